//! 后台期间失败的任务暂存于此，等待网络恢复或定时重试。

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use linkmux_core::{Task, TaskProfile};

#[derive(Debug, Clone)]
struct Zombie {
    task: Task,
    save_time: Instant,
}

impl Zombie {
    fn budget(&self) -> Duration {
        Duration::from_millis(self.task.total_timeout.max(0) as u64)
    }

    /// The task with its budget reduced by the time it spent here.
    fn into_restart(mut self, now: Instant) -> Task {
        let waited = now.saturating_duration_since(self.save_time).as_millis() as i32;
        self.task.total_timeout -= waited;
        self.task
    }
}

/// What the owner must do with a zombie leaving the store.
#[derive(Debug, Clone)]
pub enum ZombieAction {
    Restart(Task),
    TimedOut(Task),
}

#[derive(Debug)]
struct ZombieState {
    zombies: Vec<Zombie>,
    last_start_task_time: Instant,
}

#[derive(Debug)]
pub struct ZombieTaskStore {
    state: Mutex<ZombieState>,
    retry_interval: Duration,
}

impl ZombieTaskStore {
    pub fn new(retry_interval: Duration, now: Instant) -> Self {
        Self {
            state: Mutex::new(ZombieState {
                zombies: Vec::new(),
                last_start_task_time: now,
            }),
            retry_interval,
        }
    }

    fn state(&self) -> MutexGuard<'_, ZombieState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keeps a failed task for a later attempt. Network sensitive tasks and
    /// tasks whose budget is already spent are refused.
    pub fn save(&self, profile: &TaskProfile, now: Instant) -> bool {
        if profile.task.network_status_sensitive {
            return false;
        }
        let remaining = profile.task_timeout.saturating_sub(profile.elapsed(now));
        if remaining.is_zero() {
            return false;
        }

        let mut task = profile.task.clone();
        task.retry_count = 0;
        task.total_timeout = remaining.as_millis().min(i32::MAX as u128) as i32;
        info!(
            task_id = task.task_id,
            cmd_id = task.cmd_id,
            remaining_ms = task.total_timeout,
            "任务转入僵尸队列"
        );

        let mut state = self.state();
        state.zombies.retain(|z| z.task.task_id != task.task_id);
        state.zombies.push(Zombie {
            task,
            save_time: now,
        });
        true
    }

    pub fn has(&self, task_id: u32) -> bool {
        self.state().zombies.iter().any(|z| z.task.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.state().zombies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop(&self, task_id: u32) -> bool {
        let mut state = self.state();
        let before = state.zombies.len();
        state.zombies.retain(|z| z.task.task_id != task_id);
        state.zombies.len() != before
    }

    pub fn clear(&self) -> Vec<Task> {
        self.state().zombies.drain(..).map(|z| z.task).collect()
    }

    /// A task was accepted by a scheduler. Postpones periodic restarts and
    /// drops any zombie copy of the same id.
    pub fn on_start_task(&self, task_id: u32, now: Instant) {
        let mut state = self.state();
        state.last_start_task_time = now;
        state.zombies.retain(|z| z.task.task_id != task_id);
    }

    /// Releases every zombie, restarting those with budget left.
    pub fn redo(&self, now: Instant) -> Vec<ZombieAction> {
        let zombies: Vec<Zombie> = self.state().zombies.drain(..).collect();
        if !zombies.is_empty() {
            info!(count = zombies.len(), "重做全部僵尸任务");
        }
        zombies
            .into_iter()
            .map(|z| {
                if now.saturating_duration_since(z.save_time) >= z.budget() {
                    ZombieAction::TimedOut(z.task)
                } else {
                    ZombieAction::Restart(z.into_restart(now))
                }
            })
            .collect()
    }

    /// Periodic check. Expired zombies end; the rest are retried once they
    /// have waited the retry interval and no task started for as long.
    pub fn tick(&self, now: Instant) -> Vec<ZombieAction> {
        let mut state = self.state();
        let quiet = now.saturating_duration_since(state.last_start_task_time) >= self.retry_interval;
        let mut actions = Vec::new();
        let mut kept = Vec::with_capacity(state.zombies.len());

        for zombie in state.zombies.drain(..) {
            let waited = now.saturating_duration_since(zombie.save_time);
            if waited >= zombie.budget() {
                debug!(task_id = zombie.task.task_id, "僵尸任务超时");
                actions.push(ZombieAction::TimedOut(zombie.task));
            } else if waited >= self.retry_interval && quiet {
                actions.push(ZombieAction::Restart(zombie.into_restart(now)));
            } else {
                kept.push(zombie);
            }
        }
        state.zombies = kept;
        actions
    }
}
