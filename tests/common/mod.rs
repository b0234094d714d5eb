//! Shared test infrastructure: an in-memory transport acting as a device.

#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder};
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rustmiio::protocol::{self, HEADER_LEN, MAGIC, Packet};
use rustmiio::{Device, DeviceBuilder, MiioError, Result, Token, Transport};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

pub const TOKEN: &str = "00112233445566778899aabbccddeeff";
pub const DEVICE_ID: u32 = 0x0102_0304;
pub const STAMP: u32 = 1000;

pub fn token() -> Token {
    TOKEN.parse().unwrap()
}

/// Decides the reply to a decoded request; `None` leaves it unanswered.
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Header-only frame a device sends back to a handshake.
pub fn handshake_reply(device_id: u32, stamp: u32, token: Option<&Token>) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN];
    BigEndian::write_u16(&mut frame[0..2], MAGIC);
    BigEndian::write_u16(&mut frame[2..4], HEADER_LEN as u16);
    BigEndian::write_u32(&mut frame[8..12], device_id);
    BigEndian::write_u32(&mut frame[12..16], stamp);
    match token {
        Some(t) => frame[16..32].copy_from_slice(t.as_bytes()),
        None => frame[16..32].fill(0xff),
    }
    frame
}

/// Encrypted data frame as a device would send it.
pub fn data_reply(message: &Value, token: &Token) -> Vec<u8> {
    let body = serde_json::to_vec(message).unwrap();
    protocol::encode_request(&body, Some(token), DEVICE_ID, STAMP + 1).unwrap()
}

pub fn is_handshake(frame: &[u8]) -> bool {
    frame == protocol::encode_handshake().as_slice()
}

/// Answers `result` for every request.
pub fn answer(result: Value) -> Responder {
    Arc::new(move |req: &Value| Some(json!({ "id": req["id"], "result": result.clone() })))
}

pub fn silent() -> Responder {
    Arc::new(|_: &Value| None)
}

/// Which frames the local socket refuses to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailSend {
    Handshake,
    Request,
}

pub struct MockDevice {
    /// Answer handshakes at all
    pub answer_handshake: bool,
    /// Token revealed in the handshake reply; hidden when `None`
    pub reveal: Option<Token>,
    /// Token the device encrypts with
    pub token: Token,
    pub responder: Responder,
    pub fail_send: Option<FailSend>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            answer_handshake: true,
            reveal: None,
            token: token(),
            responder: answer(Value::Null),
            fail_send: None,
        }
    }
}

/// [`Transport`] that records every frame and replies like a device would.
pub struct MockTransport {
    behaviour: Mutex<MockDevice>,
    sent: Mutex<Vec<(Instant, Vec<u8>)>>,
    requests: Mutex<Vec<Value>>,
    device: Mutex<Option<Device>>,
}

impl MockTransport {
    pub fn new(behaviour: MockDevice) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            sent: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            device: Mutex::new(None),
        })
    }

    /// Build a session over this transport and route replies to it.
    pub fn session(self: &Arc<Self>, builder: DeviceBuilder) -> Device {
        let device = builder.build(self.clone());
        *self.device.lock() = Some(device.clone());
        device
    }

    pub fn set_responder(&self, responder: Responder) {
        self.behaviour.lock().responder = responder;
    }

    pub fn set_fail_send(&self, fail: Option<FailSend>) {
        self.behaviour.lock().fail_send = fail;
    }

    pub fn frames(&self) -> Vec<(Instant, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn handshakes(&self) -> usize {
        self.sent.lock().iter().filter(|(_, f)| is_handshake(f)).count()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| r["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Feed a raw datagram to the session, as the receive loop would.
    pub fn deliver(&self, frame: Vec<u8>) {
        let device = self.device.lock().clone();
        if let Some(device) = device {
            tokio::spawn(async move { device.handle_message(&frame) });
        }
    }

    fn respond(&self, frame: &[u8]) {
        let (answer_handshake, reveal, token, responder) = {
            let b = self.behaviour.lock();
            (b.answer_handshake, b.reveal, b.token, b.responder.clone())
        };

        if is_handshake(frame) {
            if answer_handshake {
                self.deliver(handshake_reply(DEVICE_ID, STAMP, reveal.as_ref()));
            }
            return;
        }

        let request = match protocol::decode_packet(frame, Some(&token)) {
            Ok(Packet::Data {
                payload: Some(request),
                ..
            }) => request,
            other => panic!("device could not read request: {:?}", other),
        };
        self.requests.lock().push(request.clone());
        if let Some(reply) = responder(&request) {
            self.deliver(data_reply(&reply, &token));
        }
    }
}

impl Transport for MockTransport {
    fn send<'a>(&'a self, data: &'a [u8], _addr: SocketAddr) -> BoxFuture<'a, Result<()>> {
        async move {
            self.sent.lock().push((Instant::now(), data.to_vec()));
            let kind = if is_handshake(data) {
                FailSend::Handshake
            } else {
                FailSend::Request
            };
            if self.behaviour.lock().fail_send == Some(kind) {
                return Err(MiioError::Io("network unreachable".to_string()));
            }
            self.respond(data);
            Ok(())
        }
        .boxed()
    }
}

pub fn builder() -> DeviceBuilder {
    DeviceBuilder::new("192.168.1.20".parse().unwrap())
}
