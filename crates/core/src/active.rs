use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

/// Background time after which the app counts as inactive.
pub const INACTIVE_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveState {
    ForegroundOneMinute,
    ForegroundTenMinute,
    ForegroundActive,
    BackgroundActive,
    Inactive,
}

impl ActiveState {
    pub fn index(&self) -> usize {
        match self {
            ActiveState::ForegroundOneMinute => 0,
            ActiveState::ForegroundTenMinute => 1,
            ActiveState::ForegroundActive => 2,
            ActiveState::BackgroundActive => 3,
            ActiveState::Inactive => 4,
        }
    }
}

#[derive(Debug)]
struct Flags {
    foreground: bool,
    last_foreground_change: Instant,
    has_account: bool,
}

/// Foreground/background and account state of the host application.
#[derive(Debug)]
pub struct ActiveLogic {
    flags: RwLock<Flags>,
}

impl ActiveLogic {
    pub fn new(foreground: bool) -> Self {
        Self {
            flags: RwLock::new(Flags {
                foreground,
                last_foreground_change: Instant::now(),
                has_account: false,
            }),
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.flags.read().map(|f| f.foreground).unwrap_or(false)
    }

    pub fn last_foreground_change(&self) -> Instant {
        self.flags
            .read()
            .map(|f| f.last_foreground_change)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn has_account(&self) -> bool {
        self.flags.read().map(|f| f.has_account).unwrap_or(false)
    }

    pub fn set_has_account(&self, has_account: bool) {
        if let Ok(mut f) = self.flags.write() {
            f.has_account = has_account;
        }
    }

    /// Returns true when the foreground flag actually changed.
    pub fn set_foreground(&self, foreground: bool, now: Instant) -> bool {
        match self.flags.write() {
            Ok(mut f) if f.foreground != foreground => {
                f.foreground = foreground;
                f.last_foreground_change = now;
                true
            }
            _ => false,
        }
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        self.is_foreground()
            || now.saturating_duration_since(self.last_foreground_change()) < INACTIVE_AFTER
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> ActiveState {
        if !self.is_active_at(now) {
            return ActiveState::Inactive;
        }
        if !self.is_foreground() {
            return ActiveState::BackgroundActive;
        }
        let since = now.saturating_duration_since(self.last_foreground_change());
        if since >= Duration::from_secs(10 * 60) {
            ActiveState::ForegroundActive
        } else if since >= Duration::from_secs(60) {
            ActiveState::ForegroundTenMinute
        } else {
            ActiveState::ForegroundOneMinute
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_state_progression() {
        let logic = ActiveLogic::new(false);
        let now = Instant::now();
        assert!(logic.set_foreground(true, now));
        assert!(!logic.set_foreground(true, now));
        assert_eq!(logic.state_at(now), ActiveState::ForegroundOneMinute);
        assert_eq!(
            logic.state_at(now + Duration::from_secs(120)),
            ActiveState::ForegroundTenMinute
        );
        assert_eq!(
            logic.state_at(now + Duration::from_secs(11 * 60)),
            ActiveState::ForegroundActive
        );

        logic.set_foreground(false, now);
        assert_eq!(logic.state_at(now), ActiveState::BackgroundActive);
        assert_eq!(
            logic.state_at(now + INACTIVE_AFTER),
            ActiveState::Inactive
        );
    }
}
