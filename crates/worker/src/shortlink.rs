use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use linkmux_core::config::ShortLinkConfig;
use linkmux_core::traits::{BoxedStream, HttpParse, NetworkInfoProvider, ShortLinkCodec, SocketProvider};
use linkmux_core::{codes, dump_items, ConnectProfile, ErrorKind, IPPortItem, IPSourceType};
use linkmux_longlink::race::{failure_code, race_connect, RaceConfig, SOCKET_TIMED_OUT};
use linkmux_routing::AddressSource;

use crate::events::{ShortLinkEvent, ShortLinkEventSender};

const RECV_CHUNK: usize = 8 * 1024;
const HTTP_OK: i32 = 200;

/// Collaborators shared by every short-link worker.
#[derive(Clone)]
pub struct ShortLinkDeps {
    pub source: Arc<AddressSource>,
    pub sockets: Arc<dyn SocketProvider>,
    pub codec: Arc<dyn ShortLinkCodec>,
    pub network: Arc<dyn NetworkInfoProvider>,
}

/// One attempt of one task.
#[derive(Debug, Clone, Default)]
pub struct ShortLinkRequest {
    pub worker_id: u64,
    pub task_id: u32,
    pub cgi: String,
    pub hosts: Vec<String>,
    pub body: Vec<u8>,
    pub ext: Vec<u8>,
    pub use_proxy: bool,
    /// Candidates chosen by the caller. Empty means resolve `hosts`.
    pub outer_addrs: Vec<IPPortItem>,
}

/// Wakes a worker blocked on the network and remembers that it was woken.
#[derive(Debug, Default)]
pub struct Breaker {
    notify: Notify,
    broken: AtomicBool,
}

impl Breaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn notify(&self) -> &Notify {
        &self.notify
    }
}

/// Owner side of a running worker.
pub struct ShortLinkHandle {
    worker_id: u64,
    breaker: Arc<Breaker>,
    task: JoinHandle<()>,
}

impl ShortLinkHandle {
    /// Spawns `work` with a fresh breaker.
    pub fn spawn<F, Fut>(worker_id: u64, work: F) -> Self
    where
        F: FnOnce(Arc<Breaker>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let breaker = Arc::new(Breaker::new());
        let task = tokio::spawn(work(Arc::clone(&breaker)));
        Self {
            worker_id,
            breaker,
            task,
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Interrupts the worker and waits for it. Nothing is emitted by the
    /// worker once this returns.
    pub async fn cancel(self) {
        self.breaker.fire();
        if let Err(e) = self.task.await {
            error!(worker_id = self.worker_id, error = %e, "短链工作任务异常退出");
        }
    }
}

enum Outcome {
    Cancelled,
    Finished {
        kind: ErrorKind,
        code: i32,
        status: i32,
        body: Vec<u8>,
        report: bool,
    },
}

impl Outcome {
    fn failed(kind: ErrorKind, code: i32, report: bool) -> Self {
        Outcome::Finished {
            kind,
            code,
            status: 0,
            body: Vec::new(),
            report,
        }
    }
}

/// A single request/response exchange over its own connection.
pub struct ShortLinkWorker {
    deps: ShortLinkDeps,
    config: ShortLinkConfig,
    request: ShortLinkRequest,
    events: ShortLinkEventSender,
    breaker: Arc<Breaker>,
}

impl ShortLinkWorker {
    pub fn spawn(
        deps: ShortLinkDeps,
        config: ShortLinkConfig,
        request: ShortLinkRequest,
        events: ShortLinkEventSender,
    ) -> ShortLinkHandle {
        let worker_id = request.worker_id;
        ShortLinkHandle::spawn(worker_id, move |breaker| {
            let worker = ShortLinkWorker {
                deps,
                config,
                request,
                events,
                breaker,
            };
            worker.run()
        })
    }

    fn emit(&self, event: ShortLinkEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, kind: ErrorKind, code: i32, item: &IPPortItem) {
        self.emit(ShortLinkEvent::NetworkReport {
            kind,
            code,
            ip: item.ip.clone(),
            host: item.host.clone(),
            port: item.port,
        });
    }

    async fn run(self) {
        let mut profile = ConnectProfile::new_attempt(self.request.worker_id);
        profile.net_type = self.deps.network.network_info().net_type;

        let outcome = match self.connect(&mut profile).await {
            Ok(stream) => self.read_write(stream, &profile).await,
            Err(outcome) => outcome,
        };

        let Outcome::Finished {
            kind,
            code,
            status,
            body,
            report,
        } = outcome
        else {
            info!(worker_id = self.request.worker_id, task_id = self.request.task_id, "短链任务被取消");
            return;
        };
        if self.breaker.is_broken() {
            return;
        }

        profile.disconn_time = Some(Instant::now());
        profile.disconn_error_kind = kind;
        profile.disconn_error_code = code;
        metrics::counter!("linkmux_shortlink_request_total", "result" => kind.as_str()).increment(1);

        if kind.is_ok() {
            debug!(task_id = self.request.task_id, len = body.len(), "短链响应完成");
        } else {
            warn!(
                task_id = self.request.task_id,
                kind = %kind,
                code,
                ip = %profile.ip,
                port = profile.port,
                "短链请求失败"
            );
        }

        let (ip, host, port) = (profile.ip.clone(), profile.host.clone(), profile.port);
        self.emit(ShortLinkEvent::Response {
            worker_id: self.request.worker_id,
            task_id: self.request.task_id,
            kind,
            code,
            status,
            body,
            profile,
        });
        if report && !kind.is_ok() {
            self.emit(ShortLinkEvent::NetworkReport {
                kind,
                code,
                ip,
                host,
                port,
            });
        }
    }

    async fn candidates(&self, host: &str) -> Option<Vec<IPPortItem>> {
        if self.request.use_proxy {
            if let Some((ip, port)) = self.config.proxy() {
                return Some(vec![IPPortItem::new(ip, port, IPSourceType::Proxy, host)]);
            }
        }
        if !self.request.outer_addrs.is_empty() {
            return Some(self.request.outer_addrs.clone());
        }
        tokio::select! {
            biased;
            _ = self.breaker.notify().notified() => None,
            items = self.deps.source.short_link_items(&self.request.hosts) => Some(items),
        }
    }

    async fn connect(&self, profile: &mut ConnectProfile) -> Result<BoxedStream, Outcome> {
        let started = Instant::now();
        profile.start_time = Some(started);
        profile.dns_time = Some(started);
        profile.host = self.request.hosts.first().cloned().unwrap_or_default();

        let Some(items) = self.candidates(&profile.host).await else {
            return Err(Outcome::Cancelled);
        };
        profile.dns_end_time = Some(Instant::now());
        profile.ip_list = items.clone();

        if items.is_empty() {
            error!(task_id = self.request.task_id, hosts = ?self.request.hosts, "短链没有可用地址");
            return Err(Outcome::failed(ErrorKind::Dns, codes::DNS_MAKE_SOCKET_PREPARED, false));
        }
        info!(
            task_id = self.request.task_id,
            cgi = %self.request.cgi,
            proxy = items[0].source_type == IPSourceType::Proxy,
            items = %dump_items(&items),
            "开始连接短链"
        );

        let config = RaceConfig {
            attempt_timeout: self.config.connect_timeout(),
            interval: self.config.connect_interval(),
            max_concurrent: items.len(),
        };
        let outcome = race_connect(&self.deps.sockets, &items, &config, None, self.breaker.notify()).await;

        for (index, e) in &outcome.failures {
            self.report(e.kind(), failure_code(e), &items[*index]);
        }
        let Some(winner) = outcome.winner else {
            if outcome.cancelled || self.breaker.is_broken() {
                return Err(Outcome::Cancelled);
            }
            return Err(Outcome::failed(
                ErrorKind::Socket,
                codes::SOCKET_MAKE_SOCKET_PREPARED,
                false,
            ));
        };
        for index in &outcome.abandoned {
            self.report(ErrorKind::Socket, SOCKET_TIMED_OUT, &items[*index]);
        }

        profile.select(winner.index);
        profile.conn_time = Some(Instant::now());
        profile.conn_rtt = winner.rtt;
        profile.conn_cost = outcome.cost;
        if let Some(addr) = winner.local_addr {
            profile.local_ip = addr.ip().to_string();
            profile.local_port = addr.port();
        }
        if self.breaker.is_broken() {
            return Err(Outcome::Cancelled);
        }

        self.emit(ShortLinkEvent::Send {
            worker_id: self.request.worker_id,
            task_id: self.request.task_id,
        });
        Ok(winner.stream)
    }

    async fn read_write(&self, mut stream: BoxedStream, profile: &ConnectProfile) -> Outcome {
        let request = self.deps.codec.pack(
            &profile.host,
            &self.request.cgi,
            &self.request.body,
            &self.request.ext,
        );

        let written = tokio::select! {
            biased;
            _ = self.breaker.notify().notified() => return Outcome::Cancelled,
            r = stream.write_all(&request) => r,
        };
        if let Err(e) = written {
            return Outcome::failed(
                ErrorKind::Socket,
                e.raw_os_error().unwrap_or(codes::SOCKET_WRITE_NONBLOCK),
                true,
            );
        }
        debug!(task_id = self.request.task_id, len = request.len(), "短链请求已发送");

        let mut buf = BytesMut::with_capacity(RECV_CHUNK);
        loop {
            if buf.capacity() - buf.len() < RECV_CHUNK / 2 {
                buf.reserve(RECV_CHUNK);
            }
            let read = tokio::select! {
                biased;
                _ = self.breaker.notify().notified() => return Outcome::Cancelled,
                r = stream.read_buf(&mut buf) => r,
            };

            let eof = match read {
                Err(e) => {
                    return Outcome::failed(
                        ErrorKind::Socket,
                        e.raw_os_error().unwrap_or(codes::SOCKET_READ_ONCE),
                        true,
                    );
                }
                Ok(0) => true,
                Ok(_) => {
                    self.emit(ShortLinkEvent::Recv {
                        worker_id: self.request.worker_id,
                        task_id: self.request.task_id,
                        cached: buf.len(),
                        total: 0,
                    });
                    false
                }
            };

            match self.deps.codec.parse(&buf, eof) {
                HttpParse::NeedMore if eof => {
                    info!(task_id = self.request.task_id, cached = buf.len(), "响应未完成时对端关闭短链");
                    return Outcome::failed(ErrorKind::Socket, codes::SOCKET_SHUTDOWN, true);
                }
                HttpParse::NeedMore => continue,
                HttpParse::Error(code) => {
                    warn!(task_id = self.request.task_id, code, "短链响应解析失败");
                    return Outcome::failed(ErrorKind::Http, code, true);
                }
                HttpParse::Complete { status, body } => return self.complete(status, body),
            }
        }
    }

    fn complete(&self, status: i32, body: Vec<u8>) -> Outcome {
        if status == HTTP_OK {
            return Outcome::Finished {
                kind: ErrorKind::Ok,
                code: 0,
                status,
                body,
                report: false,
            };
        }
        if matches!(status, 301 | 302 | 307) {
            warn!(task_id = self.request.task_id, status, cgi = %self.request.cgi, "短链请求被重定向");
        }
        Outcome::Finished {
            kind: ErrorKind::Http,
            code: status,
            status,
            body: Vec::new(),
            report: true,
        }
    }
}
