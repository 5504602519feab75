//! 调度器结果的汇集点：结束回调、僵尸任务转存、网络错误上报与连通性汇总。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use linkmux_core::traits::{NetworkInfoProvider, TransportListener};
use linkmux_core::{ActiveLogic, ChannelType, ErrorKind, LongLinkStatus, TaskProfile};
use linkmux_dispatcher::{FailHandle, TaskOutcome, TaskResultSink, ZombieTaskStore};
use linkmux_longlink::LongLinkConnection;
use linkmux_routing::AddressSource;

use crate::connectivity::ConnectivityTracker;

/// Work the router hands back to the orchestrator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Followup {
    RetryAll {
        kind: ErrorKind,
        code: i32,
        handle: FailHandle,
        src_task_id: u32,
    },
    RedoZombies,
    Shutdown,
}

pub(crate) struct CompletionRouter {
    listener: Arc<dyn TransportListener>,
    zombie: Arc<ZombieTaskStore>,
    active: Arc<ActiveLogic>,
    source: Arc<AddressSource>,
    network: Arc<dyn NetworkInfoProvider>,
    link: Arc<LongLinkConnection>,
    connectivity: ConnectivityTracker,
    from_zombie: Mutex<HashSet<u32>>,
    followups: mpsc::UnboundedSender<Followup>,
}

impl CompletionRouter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        listener: Arc<dyn TransportListener>,
        zombie: Arc<ZombieTaskStore>,
        active: Arc<ActiveLogic>,
        source: Arc<AddressSource>,
        network: Arc<dyn NetworkInfoProvider>,
        link: Arc<LongLinkConnection>,
        short_error_threshold: u32,
        followups: mpsc::UnboundedSender<Followup>,
    ) -> Self {
        Self {
            listener,
            zombie,
            active,
            source,
            network,
            link,
            connectivity: ConnectivityTracker::new(short_error_threshold),
            from_zombie: Mutex::new(HashSet::new()),
            followups,
        }
    }

    fn zombie_ids(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.from_zombie.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn followup(&self, followup: Followup) {
        let _ = self.followups.send(followup);
    }

    /// The task is being restarted from the zombie store; its next result ends it.
    pub(crate) fn mark_from_zombie(&self, task_id: u32) {
        self.zombie_ids().insert(task_id);
    }

    pub(crate) fn unmark_from_zombie(&self, task_id: u32) {
        self.zombie_ids().remove(&task_id);
    }

    pub(crate) fn clear_zombie_marks(&self) {
        self.zombie_ids().clear();
    }

    pub(crate) fn end_task(&self, profile: &TaskProfile, kind: ErrorKind, code: i32) {
        self.unmark_from_zombie(profile.task.task_id);
        self.listener.on_task_profile(profile);
        self.listener.on_task_end(
            profile.task.task_id,
            profile.task.user_context.as_ref(),
            kind,
            code,
        );
    }

    pub(crate) fn reset_connectivity(&self) {
        self.connectivity.reset();
    }

    fn report_connectivity(&self, long: LongLinkStatus) {
        let has_net = self.network.network_info().has_net();
        if let Some((overall, long_link)) = self.connectivity.evaluate(long, has_net) {
            debug!(overall = ?overall, long_link = ?long_link, "连通状态");
            self.listener.on_connectivity(overall, long_link);
        }
    }

    /// Long-link status from the event bus.
    pub(crate) fn on_long_status(&self, status: LongLinkStatus) {
        if status == LongLinkStatus::Connected {
            self.followup(Followup::RedoZombies);
        }
        self.report_connectivity(status);
    }

    fn on_long_report(&self, kind: ErrorKind, code: i32, ip: &str, host: &str, port: u16) {
        self.listener
            .on_long_link_network_error(kind, code, ip, host, port);
        if kind == ErrorKind::Ok {
            self.followup(Followup::RedoZombies);
        }
        if matches!(kind, ErrorKind::Http | ErrorKind::Server | ErrorKind::Local) || ip.is_empty() {
            return;
        }
        self.source.report_long_ip(kind == ErrorKind::Ok, ip, port);
    }

    fn on_short_report(&self, kind: ErrorKind, code: i32, ip: &str, host: &str, port: u16) {
        self.listener
            .on_short_link_network_error(kind, code, ip, host, port);
        self.connectivity.record_short(kind == ErrorKind::Ok);
        self.report_connectivity(self.link.status());
        if kind == ErrorKind::Ok {
            self.followup(Followup::RedoZombies);
        }
        if matches!(kind, ErrorKind::NetMsgXp | ErrorKind::Server | ErrorKind::Local)
            || ip.is_empty()
        {
            return;
        }
        self.source
            .report_short_ip(kind == ErrorKind::Ok, ip, host, port);
    }
}

impl TaskResultSink for CompletionRouter {
    fn on_task_end(&self, outcome: TaskOutcome) {
        let task_id = outcome.task_id();
        let from_zombie = self.zombie_ids().remove(&task_id);

        let ends = outcome.kind == ErrorKind::Ok || outcome.handle.is_terminal() || from_zombie;
        if !ends && !self.active.is_foreground() && self.zombie.save(&outcome.profile, Instant::now()) {
            info!(
                task_id,
                kind = %outcome.kind,
                code = outcome.code,
                "后台任务失败，暂存待重试"
            );
            return;
        }
        self.end_task(&outcome.profile, outcome.kind, outcome.code);
    }

    fn on_push(&self, cmd_id: u32, task_id: u32, body: &[u8], ext: &[u8]) {
        debug!(cmd_id, task_id, len = body.len(), "收到推送");
        self.listener.on_push(cmd_id, task_id, body, ext);
    }

    fn on_network_report(
        &self,
        channel: ChannelType,
        kind: ErrorKind,
        code: i32,
        ip: &str,
        host: &str,
        port: u16,
    ) {
        match channel {
            ChannelType::Long => self.on_long_report(kind, code, ip, host, port),
            ChannelType::Short => self.on_short_report(kind, code, ip, host, port),
        }
    }

    fn on_retry_all(&self, kind: ErrorKind, code: i32, handle: FailHandle, src_task_id: u32) {
        self.followup(Followup::RetryAll {
            kind,
            code,
            handle,
            src_task_id,
        });
    }
}
