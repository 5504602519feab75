use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use linkmux::core::traits::{
    DecodeResult, EncodedRequest, KeyValueStore, TaskCodec, TransportListener,
};
use linkmux::core::{
    ChannelSelect, ChannelType, ConnectivityStatus, CoreConfig, ErrorKind, NetType, NetworkInfo,
    Task, TaskProfile, TransportResult, UserContext,
};
use linkmux::infrastructure::{
    DefaultLongLinkProtocol, FileKeyValueStore, LengthPrefixedCodec, NoIdentityCheck,
    SimpleHttpCodec, StaticAuthGate, StaticNetworkInfo, SystemDnsResolver, TokioSocketProvider,
};
use linkmux::{Collaborators, NetCore};

/// Long-link command id of the demo requests.
const DEMO_CMD_ID: u32 = 1;

/// 演示程序参数
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub host: String,
    pub port: u16,
    pub cgi: String,
    pub count: usize,
    pub state_file: Option<String>,
}

/// Sends `<cgi> #<task id>` and accepts any response.
struct EchoTaskCodec;

impl TaskCodec for EchoTaskCodec {
    fn req_to_buf(&self, task: &Task, _channel: ChannelType) -> TransportResult<EncodedRequest> {
        Ok(EncodedRequest {
            body: format!("{} #{}", task.cgi, task.task_id).into_bytes(),
            ext: Vec::new(),
        })
    }

    fn buf_to_resp(&self, task: &Task, body: &[u8], _ext: &[u8], channel: ChannelType) -> DecodeResult {
        println!(
            "[{}] 任务 {} 收到响应: {}",
            channel.as_str(),
            task.task_id,
            String::from_utf8_lossy(body)
        );
        DecodeResult::NoError
    }
}

/// Prints every callback and counts finished tasks.
#[derive(Default)]
struct PrintingListener {
    finished: AtomicUsize,
    changed: Notify,
}

impl PrintingListener {
    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl TransportListener for PrintingListener {
    fn on_task_end(&self, task_id: u32, user_context: Option<&UserContext>, kind: ErrorKind, code: i32) {
        let seq = user_context
            .and_then(|c| c.downcast_ref::<usize>())
            .copied()
            .unwrap_or_default();
        println!("任务 {task_id} (第 {seq} 个) 结束: {kind} {code}");
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_one();
    }

    fn on_push(&self, cmd_id: u32, task_id: u32, body: &[u8], _ext: &[u8]) {
        println!("推送 cmd_id={cmd_id} task_id={task_id} 长度={}", body.len());
    }

    fn on_connectivity(&self, overall: ConnectivityStatus, long_link: ConnectivityStatus) {
        println!("连通状态: 整体 {overall:?}, 长链 {long_link:?}");
    }

    fn on_task_profile(&self, profile: &TaskProfile) {
        info!(
            task_id = profile.task.task_id,
            attempts = profile.attempt_count(),
            fail_step = ?profile.fail_step(),
            "任务统计"
        );
    }
}

/// 演示应用：连接到一台服务器，发起若干任务并打印结果
pub struct Application {
    core: NetCore,
    listener: Arc<PrintingListener>,
    options: DemoOptions,
}

impl Application {
    pub fn new(mut config: CoreConfig, options: DemoOptions) -> Result<Self> {
        info!(host = %options.host, port = options.port, "初始化传输核心");

        config.network.long_link_hosts = vec![options.host.clone()];
        config.network.long_link_ports = vec![options.port];
        config.network.short_link_hosts = vec![options.host.clone()];
        config.network.short_link_port = options.port;

        let store: Option<Arc<dyn KeyValueStore>> = match &options.state_file {
            Some(path) => Some(Arc::new(
                FileKeyValueStore::open(path)
                    .with_context(|| format!("打开状态文件失败: {path}"))?,
            )),
            None => None,
        };

        let listener = Arc::new(PrintingListener::default());
        let dns = Arc::new(SystemDnsResolver::new());
        let collaborators = Collaborators {
            sockets: Arc::new(TokioSocketProvider::new()),
            primary_dns: dns.clone(),
            legacy_dns: dns,
            network: Arc::new(StaticNetworkInfo::new(NetworkInfo::new(NetType::Wifi, "default"))),
            auth: Arc::new(StaticAuthGate::new(true)),
            frame_codec: Arc::new(LengthPrefixedCodec::new()),
            protocol: Arc::new(DefaultLongLinkProtocol::new()),
            identify: Arc::new(NoIdentityCheck),
            task_codec: Arc::new(EchoTaskCodec),
            short_codec: Arc::new(SimpleHttpCodec::new()),
            store,
            listener: listener.clone(),
            foreground: true,
        };

        let core = NetCore::start(config, collaborators).context("启动传输核心失败")?;
        Ok(Self {
            core,
            listener,
            options,
        })
    }

    /// Starts the demo tasks, then waits for them or for shutdown.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut accepted = 0;
        for seq in 1..=self.options.count {
            let mut task = Task::new(DEMO_CMD_ID, self.options.cgi.clone());
            task.channel_select = ChannelSelect::BOTH;
            task.short_link_hosts = vec![self.options.host.clone()];
            task.user_context = Some(UserContext::new(seq));
            if self.core.start_task(task).await {
                accepted += 1;
            }
        }
        info!(count = self.options.count, accepted, "演示任务已提交");

        loop {
            if self.listener.finished() >= self.options.count {
                println!("全部 {} 个任务已结束，按 Ctrl+C 退出", self.options.count);
                break;
            }
            tokio::select! {
                _ = self.listener.changed.notified() => {}
                _ = shutdown_rx.recv() => {
                    warn!(finished = self.listener.finished(), "收到关闭信号，放弃剩余任务");
                    return Ok(());
                }
            }
        }

        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
