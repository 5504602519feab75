use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::models::Task;

const MAX_RECORD_COUNT: usize = 30;
const RECORD_INTERCEPT_COUNT: u32 = 105;
const NOT_CLEAR_INTERCEPT_COUNT: u32 = 75;
const NOT_CLEAR_INTERCEPT_COUNT_RETRY: u32 = 99;
const NOT_CLEAR_INTERCEPT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const RUN_CLEAR_RECORDS_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct AvalancheRecord {
    hash: u64,
    count: u32,
    last_update: Instant,
}

/// Rejects identical payloads repeated too often within the clear period.
#[derive(Debug)]
pub struct FrequencyLimit {
    records: Vec<AvalancheRecord>,
    last_clear: Instant,
}

impl FrequencyLimit {
    pub fn new(now: Instant) -> Self {
        Self {
            records: Vec::with_capacity(MAX_RECORD_COUNT),
            last_clear: now,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn payload_hash(buf: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(buf);
        hasher.finish()
    }

    /// Returns `Err(span)` with the time since the previous identical payload
    /// when the task must be intercepted.
    pub fn check(&mut self, task: &Task, buf: &[u8], now: Instant) -> Result<(), Duration> {
        if !task.limit_frequency {
            return Ok(());
        }

        if now.saturating_duration_since(self.last_clear) >= RUN_CLEAR_RECORDS_INTERVAL {
            self.last_clear = now;
            self.clear_records(now);
        }

        let hash = Self::payload_hash(buf);
        match self.records.iter().rposition(|r| r.hash == hash) {
            Some(index) => {
                let record = &mut self.records[index];
                let span = now.saturating_duration_since(record.last_update);
                record.count += 1;
                record.last_update = now;
                if record.count > RECORD_INTERCEPT_COUNT {
                    error!(
                        task_id = task.task_id,
                        cmd_id = task.cmd_id,
                        cgi = %task.cgi,
                        count = record.count,
                        len = buf.len(),
                        "请求频率过高，任务被拦截"
                    );
                    return Err(span);
                }
            }
            None => self.insert_record(hash, now),
        }
        Ok(())
    }

    fn clear_records(&mut self, now: Instant) {
        debug!(records = self.records.len(), "清理频率限制记录");
        self.records.retain_mut(|r| {
            let keep = now.saturating_duration_since(r.last_update) <= NOT_CLEAR_INTERCEPT_INTERVAL
                && r.count >= NOT_CLEAR_INTERCEPT_COUNT;
            if keep {
                let old = r.count;
                r.count = r.count.min(NOT_CLEAR_INTERCEPT_COUNT_RETRY);
                warn!(hash = r.hash, old_count = old, count = r.count, "保留高频记录");
            }
            keep
        });
    }

    fn insert_record(&mut self, hash: u64, now: Instant) {
        if self.records.len() >= MAX_RECORD_COUNT {
            if let Some(oldest) = self
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.last_update)
                .map(|(i, _)| i)
            {
                self.records.remove(oldest);
            }
        }
        self.records.push(AvalancheRecord {
            hash,
            count: 1,
            last_update: now,
        });
    }
}
