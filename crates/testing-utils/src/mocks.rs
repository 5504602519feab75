//! In-memory implementations of the collaborator traits.
//!
//! Every fake records what it was asked so tests can assert on the calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use linkmux_core::traits::{
    AuthGate, ConnectedStream, DecodeResult, DnsResolver, EncodedRequest, Frame, FrameCodec,
    HttpParse, IdentifyChallenge, IdentifyMode, IdentifyProvider, KeyValueStore,
    LongLinkProtocol, NetworkInfoProvider, ShortLinkCodec, SocketProvider, TaskCodec,
    TransportListener, Unpacked,
};
use linkmux_core::{
    codes, ChannelType, ConnectivityStatus, ErrorKind, NetworkInfo, Task, TaskProfile,
    TransportError, TransportResult, UserContext, IDENTIFY_TASK_ID,
};

/// Network info that tests can switch at will.
#[derive(Debug)]
pub struct FakeNetworkInfo {
    info: Mutex<NetworkInfo>,
}

impl FakeNetworkInfo {
    pub fn new(info: NetworkInfo) -> Self {
        Self {
            info: Mutex::new(info),
        }
    }

    pub fn set(&self, info: NetworkInfo) {
        *self.info.lock().unwrap() = info;
    }
}

impl NetworkInfoProvider for FakeNetworkInfo {
    fn network_info(&self) -> NetworkInfo {
        self.info.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    data: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn read(&self, key: &str) -> TransportResult<Option<String>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> TransportResult<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> TransportResult<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> TransportResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Resolver answering from a fixed table. Unknown hosts resolve to nothing.
#[derive(Debug, Default)]
pub struct FakeDnsResolver {
    records: Mutex<HashMap<String, Vec<String>>>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl FakeDnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: &str, ips: Vec<String>) {
        self.records.lock().unwrap().insert(host.to_string(), ips);
    }

    pub fn lookups(&self, host: &str) -> usize {
        self.lookups.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DnsResolver for FakeDnsResolver {
    async fn resolve(&self, host: &str) -> TransportResult<Vec<String>> {
        *self
            .lookups
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_insert(0) += 1;
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default())
    }
}

/// Header: total length, cmd id, task id, each a big-endian u32.
pub const FAKE_FRAME_HEADER: usize = 12;
const FAKE_FRAME_MAX: usize = 1024 * 1024;

/// Minimal framing used by long-link tests on both ends of the pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeFrameCodec;

impl FakeFrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for FakeFrameCodec {
    fn pack(&self, cmd_id: u32, task_id: u32, body: &[u8], _ext: &[u8]) -> Vec<u8> {
        let total = (FAKE_FRAME_HEADER + body.len()) as u32;
        let mut frame = Vec::with_capacity(total as usize);
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(&cmd_id.to_be_bytes());
        frame.extend_from_slice(&task_id.to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    fn unpack(&self, buf: &[u8]) -> Unpacked {
        if buf.len() < FAKE_FRAME_HEADER {
            return Unpacked::NeedMore {
                task_id: None,
                package_len: 0,
            };
        }
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let total = word(0) as usize;
        if !(FAKE_FRAME_HEADER..=FAKE_FRAME_MAX).contains(&total) {
            return Unpacked::Error;
        }
        let cmd_id = word(4);
        let task_id = word(8);
        if buf.len() < total {
            return Unpacked::NeedMore {
                task_id: Some(task_id),
                package_len: total,
            };
        }
        Unpacked::Frame(Frame {
            cmd_id,
            task_id,
            body: buf[FAKE_FRAME_HEADER..total].to_vec(),
            ext: Vec::new(),
            consumed: total,
        })
    }
}

pub const FAKE_NOOP_CMD_ID: u32 = 6;

#[derive(Debug, Clone, Default)]
pub struct FakeLongLinkProtocol {
    fixed_interval: Option<Duration>,
    verify_on_connect: bool,
}

impl FakeLongLinkProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixed_interval(mut self, interval: Duration) -> Self {
        self.fixed_interval = Some(interval);
        self
    }

    pub fn with_verify_on_connect(mut self) -> Self {
        self.verify_on_connect = true;
        self
    }
}

impl LongLinkProtocol for FakeLongLinkProtocol {
    fn noop_cmd_id(&self) -> u32 {
        FAKE_NOOP_CMD_ID
    }

    fn fixed_heartbeat_interval(&self) -> Option<Duration> {
        self.fixed_interval
    }

    fn verify_on_connect(&self) -> bool {
        self.verify_on_connect
    }
}

pub const FAKE_IDENTIFY_CMD_ID: u32 = 11;

/// Identify hooks that accept the body `ok`.
#[derive(Debug)]
pub struct FakeIdentifyProvider {
    mode: Mutex<IdentifyMode>,
    challenges: Mutex<usize>,
}

impl FakeIdentifyProvider {
    pub fn new(mode: IdentifyMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            challenges: Mutex::new(0),
        }
    }

    pub fn set_mode(&self, mode: IdentifyMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn challenge_count(&self) -> usize {
        *self.challenges.lock().unwrap()
    }
}

impl IdentifyProvider for FakeIdentifyProvider {
    fn challenge(&self) -> IdentifyChallenge {
        *self.challenges.lock().unwrap() += 1;
        IdentifyChallenge {
            mode: *self.mode.lock().unwrap(),
            cmd_id: FAKE_IDENTIFY_CMD_ID,
            buffer: b"identify".to_vec(),
            hash: b"hash".to_vec(),
        }
    }

    fn is_identify_response(&self, cmd_id: u32, task_id: u32) -> bool {
        cmd_id == FAKE_IDENTIFY_CMD_ID && task_id == IDENTIFY_TASK_ID
    }

    fn verify(&self, body: &[u8], _hash: &[u8]) -> bool {
        body == b"ok"
    }
}

/// Task codec whose requests are `req:<task id>` and whose verdicts can be scripted.
#[derive(Debug, Default)]
pub struct FakeTaskCodec {
    fail_encode: Mutex<HashSet<u32>>,
    verdicts: Mutex<VecDeque<DecodeResult>>,
    decoded: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl FakeTaskCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_encode(&self, task_id: u32) {
        self.fail_encode.lock().unwrap().insert(task_id);
    }

    /// Verdicts handed out in order; `NoError` once exhausted.
    pub fn push_verdict(&self, verdict: DecodeResult) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }

    pub fn decoded(&self) -> Vec<(u32, Vec<u8>)> {
        self.decoded.lock().unwrap().clone()
    }
}

impl TaskCodec for FakeTaskCodec {
    fn req_to_buf(&self, task: &Task, _channel: ChannelType) -> TransportResult<EncodedRequest> {
        if self.fail_encode.lock().unwrap().contains(&task.task_id) {
            return Err(TransportError::codec("fake encode failure"));
        }
        Ok(EncodedRequest {
            body: format!("req:{}", task.task_id).into_bytes(),
            ext: Vec::new(),
        })
    }

    fn buf_to_resp(
        &self,
        task: &Task,
        body: &[u8],
        _ext: &[u8],
        _channel: ChannelType,
    ) -> DecodeResult {
        self.decoded
            .lock()
            .unwrap()
            .push((task.task_id, body.to_vec()));
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DecodeResult::NoError)
    }
}

/// Requests are `POST <cgi>\n<body>`. Responses are `<status>\n<body>`,
/// complete once the peer closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeShortLinkCodec;

impl FakeShortLinkCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn response(status: i32, body: &[u8]) -> Vec<u8> {
        let mut out = format!("{status}\n").into_bytes();
        out.extend_from_slice(body);
        out
    }
}

impl ShortLinkCodec for FakeShortLinkCodec {
    fn pack(&self, _host: &str, cgi: &str, body: &[u8], _ext: &[u8]) -> Vec<u8> {
        let mut out = format!("POST {cgi}\n").into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn parse(&self, buf: &[u8], eof: bool) -> HttpParse {
        if !eof {
            return HttpParse::NeedMore;
        }
        let Some(split) = buf.iter().position(|b| *b == b'\n') else {
            return HttpParse::Error(codes::HTTP_SPLIT_HEAD_BODY);
        };
        match std::str::from_utf8(&buf[..split])
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
        {
            Some(status) => HttpParse::Complete {
                status,
                body: buf[split + 1..].to_vec(),
            },
            None => HttpParse::Error(codes::HTTP_PARSE_STATUS_LINE),
        }
    }
}

#[derive(Debug)]
pub struct FakeAuthGate {
    authed: AtomicBool,
}

impl FakeAuthGate {
    pub fn new(authed: bool) -> Self {
        Self {
            authed: AtomicBool::new(authed),
        }
    }

    pub fn set(&self, authed: bool) {
        self.authed.store(authed, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthGate for FakeAuthGate {
    async fn ensure_authenticated(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnd {
    pub task_id: u32,
    pub kind: ErrorKind,
    pub code: i32,
    pub had_context: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkErrorReport {
    pub long_link: bool,
    pub kind: ErrorKind,
    pub code: i32,
    pub ip: String,
    pub port: u16,
}

/// Listener that keeps every callback for later inspection.
#[derive(Debug, Default)]
pub struct RecordingListener {
    ends: Mutex<Vec<TaskEnd>>,
    pushes: Mutex<Vec<(u32, u32, Vec<u8>)>>,
    connectivity: Mutex<Vec<(ConnectivityStatus, ConnectivityStatus)>>,
    network_errors: Mutex<Vec<NetworkErrorReport>>,
    profiles: Mutex<Vec<TaskProfile>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ends(&self) -> Vec<TaskEnd> {
        self.ends.lock().unwrap().clone()
    }

    pub fn end_count(&self, task_id: u32) -> usize {
        self.ends
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_id == task_id)
            .count()
    }

    pub fn end_of(&self, task_id: u32) -> Option<TaskEnd> {
        self.ends
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.task_id == task_id)
            .cloned()
    }

    pub fn pushes(&self) -> Vec<(u32, u32, Vec<u8>)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn connectivity(&self) -> Vec<(ConnectivityStatus, ConnectivityStatus)> {
        self.connectivity.lock().unwrap().clone()
    }

    pub fn network_errors(&self) -> Vec<NetworkErrorReport> {
        self.network_errors.lock().unwrap().clone()
    }

    pub fn profiles(&self) -> Vec<TaskProfile> {
        self.profiles.lock().unwrap().clone()
    }
}

impl TransportListener for RecordingListener {
    fn on_task_end(
        &self,
        task_id: u32,
        user_context: Option<&UserContext>,
        kind: ErrorKind,
        code: i32,
    ) {
        self.ends.lock().unwrap().push(TaskEnd {
            task_id,
            kind,
            code,
            had_context: user_context.is_some(),
        });
    }

    fn on_push(&self, cmd_id: u32, task_id: u32, body: &[u8], _ext: &[u8]) {
        self.pushes
            .lock()
            .unwrap()
            .push((cmd_id, task_id, body.to_vec()));
    }

    fn on_connectivity(&self, overall: ConnectivityStatus, long_link: ConnectivityStatus) {
        self.connectivity.lock().unwrap().push((overall, long_link));
    }

    fn on_long_link_network_error(
        &self,
        kind: ErrorKind,
        code: i32,
        ip: &str,
        _host: &str,
        port: u16,
    ) {
        self.network_errors.lock().unwrap().push(NetworkErrorReport {
            long_link: true,
            kind,
            code,
            ip: ip.to_string(),
            port,
        });
    }

    fn on_short_link_network_error(
        &self,
        kind: ErrorKind,
        code: i32,
        ip: &str,
        _host: &str,
        port: u16,
    ) {
        self.network_errors.lock().unwrap().push(NetworkErrorReport {
            long_link: false,
            kind,
            code,
            ip: ip.to_string(),
            port,
        });
    }

    fn on_task_profile(&self, profile: &TaskProfile) {
        self.profiles.lock().unwrap().push(profile.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse,
    /// Never completes; the caller's timeout decides.
    Hang,
    Delay(Duration),
}

/// Server end of an accepted in-memory connection.
#[derive(Debug)]
pub struct AcceptedConn {
    pub ip: String,
    pub port: u16,
    pub stream: DuplexStream,
}

/// Socket provider backed by `tokio::io::duplex` pipes.
#[derive(Debug)]
pub struct DuplexSocketProvider {
    behaviors: Mutex<HashMap<(String, u16), ConnectBehavior>>,
    attempts: Mutex<Vec<(String, u16)>>,
    accepted_tx: mpsc::UnboundedSender<AcceptedConn>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptedConn>>,
    buffer_size: usize,
}

impl Default for DuplexSocketProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplexSocketProvider {
    pub fn new() -> Self {
        Self::with_buffer_size(64 * 1024)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            behaviors: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            buffer_size,
        }
    }

    pub fn set_behavior(&self, ip: &str, port: u16, behavior: ConnectBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert((ip.to_string(), port), behavior);
    }

    pub fn connect_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempts(&self) -> Vec<(String, u16)> {
        self.attempts.lock().unwrap().clone()
    }

    /// Waits for the next accepted connection.
    pub async fn next_accepted(&self) -> Option<AcceptedConn> {
        self.accepted_rx.lock().await.recv().await
    }
}

#[async_trait]
impl SocketProvider for DuplexSocketProvider {
    async fn connect(
        &self,
        ip: &str,
        port: u16,
        _timeout: Duration,
    ) -> TransportResult<ConnectedStream> {
        self.attempts.lock().unwrap().push((ip.to_string(), port));
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&(ip.to_string(), port))
            .copied()
            .unwrap_or(ConnectBehavior::Accept);

        match behavior {
            ConnectBehavior::Refuse => {
                return Err(TransportError::socket(format!("connection refused {ip}:{port}")));
            }
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            ConnectBehavior::Accept => {}
        }

        let (client, server) = tokio::io::duplex(self.buffer_size);
        let _ = self.accepted_tx.send(AcceptedConn {
            ip: ip.to_string(),
            port,
            stream: server,
        });
        Ok(ConnectedStream {
            stream: Box::new(client),
            local_addr: None,
        })
    }
}
