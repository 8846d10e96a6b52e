//! # Background loop tracker.
//!
//! Knows which orchestrator loops (controllers, monitor) are still running, so a shutdown
//! that overruns its grace period can name them.
//!
//! ## Rules
//! - A loop is alive from [`AliveTracker::track`] until its future completes, panics or
//!   is dropped (the guard removes it in every case).
//! - [`AliveTracker::snapshot`] is sorted, for stable error messages.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Thread-safe set of live loop names.
#[derive(Clone, Debug, Default)]
pub(super) struct AliveTracker {
    names: Arc<Mutex<BTreeSet<String>>>,
}

struct AliveGuard {
    name: String,
    names: Arc<Mutex<BTreeSet<String>>>,
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        let mut names = self.names.lock().unwrap_or_else(|p| p.into_inner());
        names.remove(&self.name);
    }
}

impl AliveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` alive for as long as the returned future runs.
    pub fn track<F>(&self, name: String, fut: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.clone());
        let guard = AliveGuard {
            name,
            names: Arc::clone(&self.names),
        };
        async move {
            let _guard = guard;
            fut.await;
        }
    }

    /// Names of the loops still running, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        let names = self.names.lock().unwrap_or_else(|p| p.into_inner());
        names.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn finished_loops_leave_the_snapshot() {
        let alive = AliveTracker::new();
        let quick = tokio::spawn(alive.track("quick".into(), async {}));
        let slow = tokio::spawn(alive.track(
            "slow".into(),
            tokio::time::sleep(Duration::from_secs(60)),
        ));
        assert_eq!(alive.snapshot(), vec!["quick".to_string(), "slow".to_string()]);

        quick.await.unwrap();
        assert_eq!(alive.snapshot(), vec!["slow".to_string()]);

        slow.abort();
        let _ = slow.await;
        assert!(alive.snapshot().is_empty());
    }
}
