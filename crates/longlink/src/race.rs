use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use linkmux_core::config::LongLinkConfig;
use linkmux_core::traits::{
    BoxedStream, ConnectedStream, FrameCodec, LongLinkProtocol, SocketProvider, Unpacked,
};
use linkmux_core::{codes, IPPortItem, TransportError, TransportResult, NOOP_TASK_ID};

/// errno ETIMEDOUT, reported for attempts that were still pending when another won.
pub const SOCKET_TIMED_OUT: i32 = 110;

#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub attempt_timeout: Duration,
    pub interval: Duration,
    pub max_concurrent: usize,
}

impl From<&LongLinkConfig> for RaceConfig {
    fn from(config: &LongLinkConfig) -> Self {
        Self {
            attempt_timeout: config.connect_timeout(),
            interval: config.connect_interval(),
            max_concurrent: config.max_concurrent_connects,
        }
    }
}

pub struct RaceWinner {
    pub index: usize,
    pub stream: BoxedStream,
    pub local_addr: Option<SocketAddr>,
    pub rtt: Duration,
}

#[derive(Default)]
pub struct RaceOutcome {
    pub winner: Option<RaceWinner>,
    pub failures: Vec<(usize, TransportError)>,
    /// Earlier candidates still connecting when the winner got through.
    pub abandoned: Vec<usize>,
    pub try_count: usize,
    pub cancelled: bool,
    pub cost: Duration,
}

/// Socket-level code reported to the health tracker for a failed attempt.
pub fn failure_code(error: &TransportError) -> i32 {
    match error {
        TransportError::Timeout(_) => SOCKET_TIMED_OUT,
        _ => codes::SOCKET_MAKE_SOCKET_PREPARED,
    }
}

/// Exchanges one noop on a fresh stream before it is handed to the link.
pub struct NoopVerifier {
    codec: Arc<dyn FrameCodec>,
    protocol: Arc<dyn LongLinkProtocol>,
}

impl NoopVerifier {
    pub fn new(codec: Arc<dyn FrameCodec>, protocol: Arc<dyn LongLinkProtocol>) -> Self {
        Self { codec, protocol }
    }

    pub async fn verify(&self, stream: &mut BoxedStream) -> TransportResult<()> {
        let (body, ext) = self.protocol.noop_request_body();
        let frame = self
            .codec
            .pack(self.protocol.noop_cmd_id(), NOOP_TASK_ID, &body, &ext);
        stream.write_all(&frame).await?;

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(TransportError::socket("连接校验时对端关闭连接"));
            }
            match self.codec.unpack(&buf) {
                Unpacked::NeedMore { .. } => continue,
                Unpacked::Frame(f)
                    if self
                        .protocol
                        .is_noop_response(f.cmd_id, f.task_id, &f.body, &f.ext) =>
                {
                    return Ok(());
                }
                Unpacked::Frame(f) => {
                    return Err(TransportError::codec(format!(
                        "连接校验收到非心跳响应: cmd_id={}",
                        f.cmd_id
                    )));
                }
                Unpacked::Error => return Err(TransportError::codec("连接校验响应解包失败")),
            }
        }
    }
}

async fn attempt(
    sockets: Arc<dyn SocketProvider>,
    item: IPPortItem,
    index: usize,
    attempt_timeout: Duration,
    verifier: Option<&NoopVerifier>,
) -> (usize, Duration, TransportResult<ConnectedStream>) {
    let started = Instant::now();
    let result = tokio::time::timeout(attempt_timeout, async {
        let mut connected = sockets.connect(&item.ip, item.port, attempt_timeout).await?;
        if let Some(verifier) = verifier {
            verifier.verify(&mut connected.stream).await?;
        }
        Ok(connected)
    })
    .await
    .unwrap_or_else(|_| {
        Err(TransportError::timeout(format!(
            "连接超时: {}:{}",
            item.ip, item.port
        )))
    });
    (index, started.elapsed(), result)
}

/// Connects to `items` in order, starting the next candidate after `interval`
/// or as soon as an attempt fails, with at most `max_concurrent` in flight.
/// The first success wins and the remaining attempts are dropped. A
/// notification on `breaker` abandons the race.
pub async fn race_connect(
    sockets: &Arc<dyn SocketProvider>,
    items: &[IPPortItem],
    config: &RaceConfig,
    verifier: Option<&NoopVerifier>,
    breaker: &Notify,
) -> RaceOutcome {
    let started = Instant::now();
    let max_concurrent = config.max_concurrent.max(1);
    let mut outcome = RaceOutcome::default();
    let mut pending = FuturesUnordered::new();
    let mut in_flight: Vec<usize> = Vec::new();
    let mut next = 0usize;
    let mut next_start = started;

    loop {
        let now = Instant::now();
        let can_start = next < items.len() && pending.len() < max_concurrent;
        if can_start && now >= next_start {
            debug!(index = next, item = %items[next], "发起连接");
            pending.push(attempt(
                Arc::clone(sockets),
                items[next].clone(),
                next,
                config.attempt_timeout,
                verifier,
            ));
            in_flight.push(next);
            next += 1;
            next_start = now + config.interval;
            outcome.try_count += 1;
            continue;
        }
        if pending.is_empty() && next >= items.len() {
            break;
        }

        tokio::select! {
            biased;
            _ = breaker.notified() => {
                info!(try_count = outcome.try_count, "连接过程被中断");
                outcome.cancelled = true;
                break;
            }
            Some((index, rtt, result)) = pending.next(), if !pending.is_empty() => {
                in_flight.retain(|i| *i != index);
                match result {
                    Ok(connected) => {
                        outcome.abandoned = in_flight.iter().copied().filter(|i| *i < index).collect();
                        outcome.winner = Some(RaceWinner {
                            index,
                            stream: connected.stream,
                            local_addr: connected.local_addr,
                            rtt,
                        });
                        break;
                    }
                    Err(e) => {
                        warn!(index, item = %items[index], error = %e, "连接失败");
                        outcome.failures.push((index, e));
                        next_start = Instant::now();
                    }
                }
            }
            _ = sleep_until(next_start), if can_start => {}
        }
    }

    outcome.cost = started.elapsed();
    let result = if outcome.winner.is_some() { "success" } else { "failure" };
    metrics::counter!("linkmux_longlink_connect_total", "result" => result).increment(1);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkmux_core::IPSourceType;
    use linkmux_testing_utils::{ConnectBehavior, DuplexSocketProvider};

    fn items(n: usize) -> Vec<IPPortItem> {
        (0..n)
            .map(|i| IPPortItem::new(format!("10.0.0.{}", i + 1), 8080, IPSourceType::Dns, "long.test"))
            .collect()
    }

    fn config() -> RaceConfig {
        RaceConfig::from(&LongLinkConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_candidate_wins() {
        let provider = Arc::new(DuplexSocketProvider::new());
        let sockets: Arc<dyn SocketProvider> = provider.clone();
        let outcome = race_connect(&sockets, &items(3), &config(), None, &Notify::new()).await;
        assert_eq!(outcome.winner.map(|w| w.index), Some(0));
        assert_eq!(outcome.try_count, 1);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_starts_next_immediately() {
        let provider = Arc::new(DuplexSocketProvider::new());
        provider.set_behavior("10.0.0.1", 8080, ConnectBehavior::Refuse);
        let sockets: Arc<dyn SocketProvider> = provider.clone();
        let outcome = race_connect(&sockets, &items(3), &config(), None, &Notify::new()).await;
        assert_eq!(outcome.winner.as_ref().map(|w| w.index), Some(1));
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.cost < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_candidate_is_abandoned() {
        let provider = Arc::new(DuplexSocketProvider::new());
        provider.set_behavior("10.0.0.1", 8080, ConnectBehavior::Hang);
        let sockets: Arc<dyn SocketProvider> = provider.clone();
        let outcome = race_connect(&sockets, &items(2), &config(), None, &Notify::new()).await;
        assert_eq!(outcome.winner.as_ref().map(|w| w.index), Some(1));
        assert_eq!(outcome.abandoned, vec![0]);
        assert!(outcome.cost >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let provider = Arc::new(DuplexSocketProvider::new());
        for i in 1..=5 {
            provider.set_behavior(&format!("10.0.0.{i}"), 8080, ConnectBehavior::Hang);
        }
        let sockets: Arc<dyn SocketProvider> = provider.clone();
        let task = {
            let sockets = sockets.clone();
            tokio::spawn(async move {
                race_connect(&sockets, &items(5), &config(), None, &Notify::new()).await
            })
        };

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(provider.connect_count(), 3);

        let outcome = task.await.unwrap();
        assert!(outcome.winner.is_none());
        assert_eq!(outcome.try_count, 5);
        assert!(outcome
            .failures
            .iter()
            .all(|(_, e)| failure_code(e) == SOCKET_TIMED_OUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_cancels_race() {
        let provider = Arc::new(DuplexSocketProvider::new());
        provider.set_behavior("10.0.0.1", 8080, ConnectBehavior::Hang);
        let sockets: Arc<dyn SocketProvider> = provider.clone();
        let breaker = Notify::new();
        breaker.notify_one();
        let outcome = race_connect(&sockets, &items(1), &config(), None, &breaker).await;
        assert!(outcome.cancelled);
        assert!(outcome.winner.is_none());
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let sockets: Arc<dyn SocketProvider> = Arc::new(DuplexSocketProvider::new());
        let outcome = race_connect(&sockets, &[], &config(), None, &Notify::new()).await;
        assert!(outcome.winner.is_none());
        assert_eq!(outcome.try_count, 0);
    }
}
