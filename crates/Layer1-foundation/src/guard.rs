//! Re-entrancy guard for periodic ticks
//!
//! A tick that is still running suppresses the next one instead of
//! overlapping with it. The permit releases the guard on drop, so a tick that
//! returns early or panics never leaves the guard stuck.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Busy flag shared by every tick of one periodic job
#[derive(Debug, Default, Clone)]
pub struct TickGuard {
    busy: Arc<AtomicBool>,
    entered: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard; `None` when a tick is already in flight
    pub fn try_enter(&self) -> Option<TickPermit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.entered.fetch_add(1, Ordering::Relaxed);
            Some(TickPermit {
                busy: Arc::clone(&self.busy),
            })
        } else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ticks that ran
    pub fn entered(&self) -> u64 {
        self.entered.load(Ordering::Relaxed)
    }

    /// Ticks suppressed because the previous one was still running
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Held for the duration of one tick
#[derive(Debug)]
pub struct TickPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_enter_is_refused_while_held() {
        let guard = TickGuard::new();
        let permit = guard.try_enter();
        assert!(permit.is_some());
        assert!(guard.try_enter().is_none());

        drop(permit);
        assert!(guard.try_enter().is_some());
        assert_eq!(guard.entered(), 2);
        assert_eq!(guard.skipped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_skips_the_next_one() {
        // First tick does 12 units of work, second is scheduled 5 units later.
        let guard = TickGuard::new();

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _permit = guard.try_enter().expect("first tick must run");
                tokio::time::sleep(Duration::from_millis(12)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second_ran = guard.try_enter().is_some();

        first.await.unwrap();
        assert!(!second_ran);
        assert_eq!(guard.entered(), 1);
        assert_eq!(guard.skipped(), 1);
        assert!(!guard.is_busy());
    }
}
