use std::sync::{Mutex, MutexGuard};

use linkmux_core::{ConnectivityStatus, LongLinkStatus};

#[derive(Debug, Default)]
struct Tally {
    short_tried: bool,
    short_errors: u32,
}

/// Folds long-link status and recent short-link results into the
/// `(overall, long_link)` pair reported to the application.
#[derive(Debug)]
pub struct ConnectivityTracker {
    tally: Mutex<Tally>,
    threshold: u32,
}

impl ConnectivityTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            tally: Mutex::new(Tally::default()),
            threshold: threshold.max(1),
        }
    }

    fn tally(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_short(&self, ok: bool) {
        let mut tally = self.tally();
        tally.short_tried = true;
        if ok {
            tally.short_errors = 0;
        } else {
            tally.short_errors = tally.short_errors.saturating_add(1);
        }
    }

    pub fn reset(&self) {
        *self.tally() = Tally::default();
    }

    pub fn short_errors(&self) -> u32 {
        self.tally().short_errors
    }

    /// None when nothing should be reported for this long-link status.
    pub fn evaluate(
        &self,
        long: LongLinkStatus,
        has_net: bool,
    ) -> Option<(ConnectivityStatus, ConnectivityStatus)> {
        if long == LongLinkStatus::Disconnected {
            return None;
        }
        if !has_net {
            return Some((ConnectivityStatus::Unavailable, ConnectivityStatus::Unavailable));
        }

        let mut tally = self.tally();
        let failed = tally.short_errors >= self.threshold;
        let clean = tally.short_tried && tally.short_errors == 0;

        let pair = match long {
            LongLinkStatus::Connected => {
                *tally = Tally::default();
                (ConnectivityStatus::Connected, ConnectivityStatus::Connected)
            }
            LongLinkStatus::ConnectFailed => {
                let overall = if failed {
                    ConnectivityStatus::ServerFailed
                } else if clean {
                    ConnectivityStatus::Connected
                } else {
                    ConnectivityStatus::Unknown
                };
                (overall, ConnectivityStatus::ServerFailed)
            }
            LongLinkStatus::Idle | LongLinkStatus::Connecting => {
                let overall = if failed {
                    ConnectivityStatus::ServerFailed
                } else if clean {
                    ConnectivityStatus::Connected
                } else {
                    ConnectivityStatus::Connecting
                };
                (overall, ConnectivityStatus::Connecting)
            }
            LongLinkStatus::Disconnected => return None,
        };
        Some(pair)
    }
}
