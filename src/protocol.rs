//! miIO wire protocol implementation.
//! Handles frame layout, handshake frames, checksums and payload cleanup.

use crate::crypto::{MiioCipher, md5_digest};
use crate::error::{MiioError, Result};
use byteorder::{BigEndian, ByteOrder};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const MAGIC: u16 = 0x2131;
pub const HEADER_LEN: usize = 32;
pub const DEFAULT_PORT: u16 = 54321;

const UNKNOWN_DATA: u32 = 0;
const HANDSHAKE_FILL: u8 = 0xff;

/// A 16-byte shared secret used to encrypt all traffic with one device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; 16]);

impl Token {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex representation, as stored in the token file.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Devices that hide their token answer the handshake with a checksum
    /// made only of `0x00`/`0xff` bytes.
    pub fn is_placeholder(&self) -> bool {
        self.0.iter().all(|b| *b == 0x00) || self.0.iter().all(|b| *b == 0xff)
    }
}

impl FromStr for Token {
    type Err = MiioError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| MiioError::InvalidToken(e.to_string()))?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|b: Vec<u8>| {
            MiioError::InvalidToken(format!("expected 16 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the first bytes, the token is a secret
        write!(f, "Token({}..)", &self.to_hex()[..4])
    }
}

/// miIO frame header (32 bytes, big-endian)
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHeader {
    /// Total frame length (header + encrypted body)
    pub length: u16,
    /// Reserved, `0` on data frames and `0xffffffff` on handshakes
    pub unknown: u32,
    /// Device identifier
    pub device_id: u32,
    /// Device clock, in seconds
    pub stamp: u32,
    /// MD5 checksum, or the token itself in a handshake reply
    pub checksum: [u8; 16],
}

/// Information recovered from a handshake reply.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeReply {
    pub device_id: u32,
    pub stamp: u32,
    /// `None` when the device hides its token
    pub token: Option<Token>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Header-only frame answering a handshake
    Handshake(HandshakeReply),
    /// Data frame; `payload` is `None` for an empty (keepalive) body
    Data {
        header: PacketHeader,
        payload: Option<Value>,
    },
}

/// Parse and validate the 32-byte header of a frame.
pub fn parse_header(data: &[u8]) -> Result<PacketHeader> {
    if data.len() < HEADER_LEN {
        return Err(MiioError::MalformedPacket(format!(
            "frame too short ({} bytes)",
            data.len()
        )));
    }

    let magic = BigEndian::read_u16(&data[0..2]);
    if magic != MAGIC {
        return Err(MiioError::MalformedPacket(format!(
            "bad magic 0x{:04x}",
            magic
        )));
    }

    let length = BigEndian::read_u16(&data[2..4]);
    if length as usize != data.len() {
        return Err(MiioError::MalformedPacket(format!(
            "length field {} does not match frame size {}",
            length,
            data.len()
        )));
    }

    let mut checksum = [0u8; 16];
    checksum.copy_from_slice(&data[16..32]);

    Ok(PacketHeader {
        length,
        unknown: BigEndian::read_u32(&data[4..8]),
        device_id: BigEndian::read_u32(&data[8..12]),
        stamp: BigEndian::read_u32(&data[12..16]),
        checksum,
    })
}

/// Build the fixed handshake frame: magic, length 32, everything else `0xff`.
pub fn encode_handshake() -> Vec<u8> {
    let mut frame = vec![HANDSHAKE_FILL; HEADER_LEN];
    BigEndian::write_u16(&mut frame[0..2], MAGIC);
    BigEndian::write_u16(&mut frame[2..4], HEADER_LEN as u16);
    frame
}

/// Decode the reply to a handshake. The token travels in the checksum field.
pub fn decode_handshake_reply(data: &[u8]) -> Result<HandshakeReply> {
    let header = parse_header(data)?;
    if header.length as usize != HEADER_LEN {
        return Err(MiioError::MalformedPacket(format!(
            "handshake reply carries {} body bytes",
            header.length as usize - HEADER_LEN
        )));
    }
    Ok(handshake_from_header(&header))
}

fn handshake_from_header(header: &PacketHeader) -> HandshakeReply {
    let token = Token::from_bytes(header.checksum);
    HandshakeReply {
        device_id: header.device_id,
        stamp: header.stamp,
        token: (!token.is_placeholder()).then_some(token),
    }
}

fn checksum(header: &[u8], token: &Token, body: &[u8]) -> [u8; 16] {
    md5_digest(&[&header[..16], token.as_bytes(), body])
}

/// Encrypt a JSON request body and frame it for `device_id`.
pub fn encode_request(
    body: &[u8],
    token: Option<&Token>,
    device_id: u32,
    stamp: u32,
) -> Result<Vec<u8>> {
    let token = token.ok_or(MiioError::NoToken)?;
    let encrypted = MiioCipher::new(token.as_bytes()).encrypt(body);

    let length = HEADER_LEN + encrypted.len();
    if length > u16::MAX as usize {
        return Err(MiioError::MalformedPacket(format!(
            "request of {} bytes does not fit a frame",
            body.len()
        )));
    }

    let mut frame = vec![0u8; HEADER_LEN];
    BigEndian::write_u16(&mut frame[0..2], MAGIC);
    BigEndian::write_u16(&mut frame[2..4], length as u16);
    BigEndian::write_u32(&mut frame[4..8], UNKNOWN_DATA);
    BigEndian::write_u32(&mut frame[8..12], device_id);
    BigEndian::write_u32(&mut frame[12..16], stamp);

    let digest = checksum(&frame, token, &encrypted);
    frame[16..32].copy_from_slice(&digest);
    frame.extend_from_slice(&encrypted);
    Ok(frame)
}

/// Verify, decrypt and parse the body of a data frame.
///
/// Returns `Ok(None)` for a frame without body.
pub fn decode_response(data: &[u8], token: Option<&Token>) -> Result<Option<Value>> {
    let header = parse_header(data)?;
    decode_body(&header, data, token)
}

fn decode_body(header: &PacketHeader, data: &[u8], token: Option<&Token>) -> Result<Option<Value>> {
    let body = &data[HEADER_LEN..];
    if body.is_empty() {
        return Ok(None);
    }

    let token = token.ok_or(MiioError::NoToken)?;
    if checksum(data, token, body) != header.checksum {
        return Err(MiioError::DecryptFailure);
    }

    let plain = MiioCipher::new(token.as_bytes()).decrypt(body)?;
    let text = clean_payload(&plain);
    if text.trim().is_empty() {
        return Ok(None);
    }
    parse_lenient(&text).map(Some)
}

/// Decode any inbound frame. Header-only frames are handshake replies.
pub fn decode_packet(data: &[u8], token: Option<&Token>) -> Result<Packet> {
    let header = parse_header(data)?;
    if data.len() == HEADER_LEN {
        return Ok(Packet::Handshake(handshake_from_header(&header)));
    }
    let payload = decode_body(&header, data, token)?;
    Ok(Packet::Data { header, payload })
}

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{09}' | '\u{0B}'..='\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}'..='\u{9F}')
}

/// Turn a decrypted body into text: drop one trailing NUL and the control
/// characters some firmware leaves in otherwise valid JSON.
pub fn clean_payload(plain: &[u8]) -> String {
    let plain = match plain.last() {
        Some(0) => &plain[..plain.len() - 1],
        _ => plain,
    };
    String::from_utf8_lossy(plain)
        .chars()
        .filter(|c| !is_stripped_control(*c))
        .collect()
}

/// Parse device JSON leniently.
///
/// Devices append stray bytes after the document and some emit empty array
/// slots. Accepted on purpose: the first complete JSON value wins, and
/// `[,` / `,,` / `,]` are read as `null` elements.
pub fn parse_lenient(text: &str) -> Result<Value> {
    let strict_err = match serde_json::from_str::<Value>(text) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    if let Some(v) = first_value(text) {
        return Ok(v);
    }

    let repaired = repair_empty_slots(text);
    if repaired != text
        && let Some(v) = first_value(&repaired)
    {
        return Ok(v);
    }

    Err(strict_err.into())
}

fn first_value(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text.trim_start())
        .into_iter::<Value>()
        .next()
        .and_then(|r| r.ok())
}

fn repair_empty_slots(text: &str) -> String {
    let mut s = text.replace("[,", "[null,");
    while s.contains(",,") {
        s = s.replace(",,", ",null,");
    }
    s.replace(",]", ",null]")
}
