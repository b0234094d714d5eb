//! Individual miIO device communication and state management.
//! Handles handshakes, token resolution, request ids, retries and reply correlation.

use crate::error::{MiioError, Result};
use crate::network::Transport;
use crate::protocol::{self, DEFAULT_PORT, HandshakeReply, Packet, Token};
use crate::tokens::TokenStore;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, timeout};

const DEFAULT_RETRIES: u32 = 5;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const CALL_TIMEOUT: Duration = Duration::from_secs(2);
/// A handshake is trusted this long before the device clock is re-read.
const HANDSHAKE_VALIDITY: Duration = Duration::from_secs(120);

/// Request ids live in `1..MAX_REQUEST_ID`.
pub const MAX_REQUEST_ID: u32 = 10000;
/// Distance a retried call jumps ahead, away from late replies to the
/// previous attempt. Empirical, tune freely.
pub const RETRY_ID_JUMP: u32 = 100;

const METHOD_INFO: &str = "miIO.info";

type Reply = Result<Value>;
type SharedOp<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Outcome of looking at a single-flight slot: done already, or an
/// operation in flight to attach to.
enum Flight<T> {
    Ready(Result<T>),
    Wait(SharedOp<T>),
}

/// Progress of the handshake with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    InProgress,
    Complete,
}

/// Parameters of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// Send the request without a `params` member
    None,
    Value(Value),
}

impl From<Value> for Params {
    fn from(v: Value) -> Self {
        Params::Value(v)
    }
}

impl From<Option<Value>> for Params {
    fn from(v: Option<Value>) -> Self {
        v.map_or(Params::None, Params::Value)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Attempts after the first one; the session default when unset
    pub retries: Option<u32>,
    /// Sub-device selector, used by gateways
    pub sid: Option<String>,
}

impl CallOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn sid<S: Into<String>>(mut self, sid: S) -> Self {
        self.sid = Some(sid.into());
        self
    }
}

/// Outstanding call waiting for a reply under one request id.
struct PendingCall {
    tx: mpsc::UnboundedSender<Reply>,
    method: String,
}

/// Internal state of a device that needs to be shared and mutable.
struct DeviceState {
    device_id: Option<u32>,
    token: Option<Token>,
    auto_token: bool,
    token_changed: bool,
    model: Option<String>,
    enriched: bool,
    handshake_state: HandshakeState,
    /// Last device stamp and when it was received
    server_stamp: Option<(u32, Instant)>,
    last_id: u32,
    pending: HashMap<u32, PendingCall>,
    handshake: Option<SharedOp<Token>>,
    handshake_waiter: Option<oneshot::Sender<()>>,
    enrichment: Option<SharedOp<()>>,
}

struct DeviceInner {
    address: SocketAddr,
    transport: Arc<dyn Transport>,
    tokens: Option<TokenStore>,
    handshake_timeout: Duration,
    call_timeout: Duration,
    default_retries: u32,
    state: Mutex<DeviceState>,
}

/// Builder for a [`Device`] session.
pub struct DeviceBuilder {
    address: IpAddr,
    port: u16,
    token: Option<Token>,
    device_id: Option<u32>,
    tokens: Option<TokenStore>,
    retries: u32,
    handshake_timeout: Duration,
    call_timeout: Duration,
}

impl DeviceBuilder {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            port: DEFAULT_PORT,
            token: None,
            device_id: None,
            tokens: None,
            retries: DEFAULT_RETRIES,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            call_timeout: CALL_TIMEOUT,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Manually supplied token; always wins over stored or discovered ones.
    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn device_id(mut self, id: u32) -> Self {
        self.device_id = Some(id);
        self
    }

    pub fn token_store(mut self, tokens: TokenStore) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Device {
        let state = DeviceState {
            device_id: self.device_id,
            token: self.token,
            auto_token: false,
            token_changed: self.token.is_some(),
            model: None,
            enriched: false,
            handshake_state: HandshakeState::Idle,
            server_stamp: None,
            last_id: 0,
            pending: HashMap::new(),
            handshake: None,
            handshake_waiter: None,
            enrichment: None,
        };

        Device {
            inner: Arc::new(DeviceInner {
                address: SocketAddr::new(self.address, self.port),
                transport,
                tokens: self.tokens,
                handshake_timeout: self.handshake_timeout,
                call_timeout: self.call_timeout,
                default_retries: self.retries,
                state: Mutex::new(state),
            }),
        }
    }
}

/// A session with one miIO device.
///
/// Cloning is cheap; every clone drives the same session.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}

impl Device {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    /// Device identifier, known after the first handshake unless configured.
    pub fn id(&self) -> Option<u32> {
        self.with_state(|s| s.device_id)
    }

    pub fn token(&self) -> Option<Token> {
        self.with_state(|s| s.token)
    }

    /// Replace the token. Frames encoded before this call are no longer valid.
    pub fn set_token(&self, token: Token) {
        debug!("Using manual token for {}", self.inner.address);
        self.with_state(|s| {
            s.token = Some(token);
            s.token_changed = true;
            s.auto_token = false;
        });
    }

    /// True when the token was revealed by the device during the handshake.
    pub fn is_auto_token(&self) -> bool {
        self.with_state(|s| s.auto_token)
    }

    pub fn model(&self) -> Option<String> {
        self.with_state(|s| s.model.clone())
    }

    /// True once an identification attempt finished, successful or not.
    pub fn is_enriched(&self) -> bool {
        self.with_state(|s| s.enriched)
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.with_state(|s| s.handshake_state)
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.with_state(|s| s.pending.len())
    }

    // -------------------------------------------------------------------------
    // Internal State Helpers
    // -------------------------------------------------------------------------

    fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }
}

// -------------------------------------------------------------------------
// Handshake & Identification
// -------------------------------------------------------------------------
impl Device {
    /// Make sure the session holds a token and a fresh device stamp.
    ///
    /// Concurrent callers share one handshake in flight.
    pub async fn handshake(&self) -> Result<Token> {
        let flight = self.with_state(|s| {
            if let Some(token) = Self::ready_token(s) {
                return Flight::Ready(Ok(token));
            }
            if let Some(op) = &s.handshake {
                return Flight::Wait(op.clone());
            }
            let op = self.clone().run_handshake().boxed().shared();
            s.handshake = Some(op.clone());
            s.handshake_state = HandshakeState::InProgress;
            Flight::Wait(op)
        });

        match flight {
            Flight::Ready(result) => result,
            Flight::Wait(op) => op.await,
        }
    }

    fn ready_token(s: &mut DeviceState) -> Option<Token> {
        if s.handshake_state != HandshakeState::Complete {
            return None;
        }
        let fresh = s
            .server_stamp
            .is_some_and(|(_, at)| at.elapsed() < HANDSHAKE_VALIDITY);
        match s.token {
            Some(token) if fresh => Some(token),
            _ => {
                s.handshake_state = HandshakeState::Idle;
                None
            }
        }
    }

    async fn run_handshake(self) -> Result<Token> {
        let result = self.perform_handshake().await;
        self.with_state(|s| {
            s.handshake = None;
            s.handshake_waiter = None;
            s.handshake_state = match result {
                Ok(_) => HandshakeState::Complete,
                Err(_) => HandshakeState::Idle,
            };
        });
        result
    }

    async fn perform_handshake(&self) -> Result<Token> {
        // A known device without any token cannot be talked to
        self.resolve_token().await?;

        let (tx, rx) = oneshot::channel();
        self.with_state(|s| s.handshake_waiter = Some(tx));

        debug!("-> {} handshake", self.inner.address);
        self.inner
            .transport
            .send(&protocol::encode_handshake(), self.inner.address)
            .await?;

        match timeout(self.inner.handshake_timeout, rx).await {
            Ok(Ok(())) => {}
            _ => {
                debug!("<- {} handshake timed out", self.inner.address);
                return Err(MiioError::HandshakeTimeout);
            }
        }

        match self.token() {
            Some(token) => Ok(token),
            // The device hides its token; it may be stored under the id we just learned
            None => self.resolve_token().await?.ok_or_else(MiioError::missing_token),
        }
    }

    /// Token precedence: current (manual or discovered), then the token store
    /// by device id. `Ok(None)` means the id is still unknown.
    async fn resolve_token(&self) -> Result<Option<Token>> {
        let (token, id) = self.with_state(|s| (s.token, s.device_id));
        if token.is_some() {
            return Ok(token);
        }
        let Some(id) = id else {
            return Ok(None);
        };

        debug!("Loading token from storage for device {}", id);
        let stored = match &self.inner.tokens {
            Some(tokens) => tokens.get(id).await,
            None => None,
        };
        match stored {
            Some(token) => {
                self.with_state(|s| {
                    // A token set meanwhile still wins
                    if s.token.is_none() {
                        s.token = Some(token);
                        s.token_changed = true;
                        s.auto_token = false;
                    }
                });
                Ok(self.token())
            }
            None => Err(MiioError::missing_token()),
        }
    }

    fn handle_handshake_reply(&self, reply: HandshakeReply) {
        debug!("<- {} handshake reply", self.inner.address);
        let waiter = self.with_state(|s| {
            s.server_stamp = Some((reply.stamp, Instant::now()));
            if s.device_id != Some(reply.device_id) {
                info!(
                    "Identifier of device {} updated to {}",
                    self.inner.address, reply.device_id
                );
                s.device_id = Some(reply.device_id);
            }
            if s.token.is_none()
                && let Some(token) = reply.token
            {
                debug!("Using automatic token for {}", self.inner.address);
                s.token = Some(token);
                s.auto_token = true;
            }
            s.handshake_waiter.take()
        });

        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    /// Identify the device with `miIO.info`, validating the token and
    /// recording the model. Runs once per token; concurrent callers share it.
    pub async fn enrich(&self) -> Result<()> {
        let flight = self.with_state(|s| {
            if s.device_id.is_none() {
                return Flight::Ready(Err(MiioError::NoIdentifier));
            }
            if s.model.is_some() && !s.token_changed && s.token.is_some() {
                return Flight::Ready(Ok(()));
            }
            if let Some(op) = &s.enrichment {
                return Flight::Wait(op.clone());
            }
            let op = self.clone().run_enrich().boxed().shared();
            s.enrichment = Some(op.clone());
            Flight::Wait(op)
        });

        match flight {
            Flight::Ready(result) => result,
            Flight::Wait(op) => op.await,
        }
    }

    async fn run_enrich(self) -> Result<()> {
        let result = self.perform_enrich().await;
        self.with_state(|s| {
            s.enrichment = None;
            s.enriched = true;
        });
        result
    }

    async fn perform_enrich(&self) -> Result<()> {
        let (has_token, changed) = self.with_state(|s| (s.token.is_some(), s.token_changed));
        if has_token && !changed {
            debug!("Using automatic token for {}", self.inner.address);
            self.with_state(|s| s.auto_token = true);
        }

        let outcome = async {
            self.resolve_token().await?;
            self.call(METHOD_INFO, Params::Value(Value::Array(vec![])), CallOptions::default())
                .await
        }
        .await;

        match outcome {
            Ok(info) => {
                let model = info.get("model").and_then(Value::as_str).map(str::to_string);
                info!(
                    "Device {} identified as {}",
                    self.inner.address,
                    model.as_deref().unwrap_or("unknown model")
                );
                let (auto, id, token) = self.with_state(|s| {
                    s.model = model;
                    s.token_changed = false;
                    (s.auto_token, s.device_id, s.token)
                });
                if auto {
                    self.remember_token(id, token).await;
                }
                Ok(())
            }
            Err(e) if e.code() == "missing-token" => Err(MiioError::missing_token()),
            Err(e) => {
                debug!("Identification of {} failed: {}", self.inner.address, e);
                if self.token().is_some() {
                    Err(MiioError::ConnectionFailure(
                        "Could not connect to device, token might be wrong".to_string(),
                    ))
                } else {
                    Err(MiioError::missing_token())
                }
            }
        }
    }

    async fn remember_token(&self, id: Option<u32>, token: Option<Token>) {
        if let (Some(tokens), Some(id), Some(token)) = (&self.inner.tokens, id, token)
            && tokens.get(id).await != Some(token)
            && let Err(e) = tokens.update(id, &token).await
        {
            warn!("Failed to store token of device {}: {}", id, e);
        }
    }
}

// -------------------------------------------------------------------------
// Calls
// -------------------------------------------------------------------------

/// Removes the registration of a call when it finishes or is dropped.
struct PendingGuard<'a> {
    device: &'a Device,
    id: Option<u32>,
    tx: mpsc::UnboundedSender<Reply>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.device.with_state(|s| Self::unregister(s, id, &self.tx));
        }
    }
}

impl PendingGuard<'_> {
    fn unregister(s: &mut DeviceState, id: u32, tx: &mpsc::UnboundedSender<Reply>) {
        if s.pending.get(&id).is_some_and(|p| p.tx.same_channel(tx)) {
            s.pending.remove(&id);
        }
    }
}

impl Device {
    /// Call `method` on the device and wait for its `result`.
    ///
    /// Unanswered attempts are retried every call timeout until the retry
    /// budget is spent. Handshake timeouts count as unanswered attempts; any
    /// other handshake failure ends the call at once.
    pub async fn call(
        &self,
        method: &str,
        params: impl Into<Params>,
        options: CallOptions,
    ) -> Result<Value> {
        let mut request = Map::new();
        request.insert("method".into(), method.into());
        if let Params::Value(p) = params.into() {
            request.insert("params".into(), p);
        }
        if let Some(sid) = options.sid {
            request.insert("sid".into(), sid.into());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut guard = PendingGuard {
            device: self,
            id: None,
            tx: tx.clone(),
        };
        let mut retries_left = options.retries.unwrap_or(self.inner.default_retries);

        loop {
            // A reply to the previous attempt that landed before its id was
            // dropped still counts; once re-registered, only the new id matches
            if let Ok(reply) = rx.try_recv() {
                return reply;
            }

            match self.handshake().await {
                Ok(_) => {
                    let id = self.register(guard.id, &tx, method);
                    guard.id = Some(id);
                    request.insert("id".into(), id.into());

                    let body = serde_json::to_vec(&request)?;
                    debug!(
                        "-> {} ({}) {}",
                        self.inner.address,
                        retries_left,
                        String::from_utf8_lossy(&body)
                    );
                    let frame = self.encode(&body)?;
                    self.inner.transport.send(&frame, self.inner.address).await?;

                    if let Ok(Some(reply)) = timeout(self.inner.call_timeout, rx.recv()).await {
                        return reply;
                    }
                }
                Err(MiioError::HandshakeTimeout) => {
                    debug!("<- {} handshake timed out, retrying call", self.inner.address);
                }
                Err(e) => return Err(e),
            }

            if retries_left == 0 {
                return Err(MiioError::CallTimeout);
            }
            retries_left -= 1;
        }
    }

    /// Allocate a request id for `tx`, dropping its previous registration.
    fn register(
        &self,
        previous: Option<u32>,
        tx: &mpsc::UnboundedSender<Reply>,
        method: &str,
    ) -> u32 {
        self.with_state(|s| {
            if let Some(old) = previous {
                PendingGuard::unregister(s, old, tx);
            }
            let id = next_request_id(s.last_id, previous.is_some(), |id| {
                s.pending.contains_key(&id)
            });
            s.last_id = id;
            s.pending.insert(
                id,
                PendingCall {
                    tx: tx.clone(),
                    method: method.to_string(),
                },
            );
            id
        })
    }

    fn encode(&self, body: &[u8]) -> Result<Vec<u8>> {
        let (token, id, stamp) = self.with_state(|s| {
            let stamp = s
                .server_stamp
                .map(|(stamp, at)| stamp.wrapping_add(at.elapsed().as_secs() as u32))
                .unwrap_or(0);
            (s.token, s.device_id, stamp)
        });
        let id = id.ok_or(MiioError::NoIdentifier)?;
        protocol::encode_request(body, token.as_ref(), id, stamp)
    }

    /// Deliver an inbound datagram from this device.
    ///
    /// Undecodable frames and replies nobody waits for are logged and dropped.
    pub fn handle_message(&self, data: &[u8]) {
        let token = self.token();
        let packet = match protocol::decode_packet(data, token.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                debug!("<- {} unable to parse packet: {}", self.inner.address, e);
                return;
            }
        };

        match packet {
            Packet::Handshake(reply) => self.handle_handshake_reply(reply),
            Packet::Data { header, payload } => {
                self.with_state(|s| s.server_stamp = Some((header.stamp, Instant::now())));
                match payload {
                    Some(message) => self.dispatch_reply(message),
                    None => debug!("<- {} empty message", self.inner.address),
                }
            }
        }
    }

    fn dispatch_reply(&self, message: Value) {
        debug!("<- {} message: {}", self.inner.address, message);
        let Some(id) = message
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
        else {
            debug!("<- {} message without id", self.inner.address);
            return;
        };

        let Some(pending) = self.with_state(|s| s.pending.remove(&id)) else {
            debug!("<- {} no call waiting for id {}", self.inner.address, id);
            return;
        };

        let reply = match message.get("result") {
            Some(result) => Ok(result.clone()),
            None => Err(remote_error(message.get("error"), &pending.method)),
        };
        let _ = pending.tx.send(reply);
    }
}

fn remote_error(error: Option<&Value>, method: &str) -> MiioError {
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let message = match error {
        Some(Value::String(s)) => s.clone(),
        Some(e) => e
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| e.to_string()),
        None => "Reply carries neither result nor error".to_string(),
    };
    MiioError::remote(code, &message, method)
}

/// Next request id after `last`: `+1`, or `+RETRY_ID_JUMP` for a retry,
/// wrapping to 1 at `MAX_REQUEST_ID` and skipping ids still `taken`.
pub(crate) fn next_request_id(last: u32, retry: bool, taken: impl Fn(u32) -> bool) -> u32 {
    let step = if retry { RETRY_ID_JUMP } else { 1 };
    let mut id = last + step;
    for _ in 0..MAX_REQUEST_ID {
        if id >= MAX_REQUEST_ID {
            id = 1;
        }
        if !taken(id) {
            break;
        }
        id += 1;
    }
    id
}
