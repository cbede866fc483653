use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Semaphore;

use crate::config::RheaConfig;

/// Notified when this node becomes or stops being Raft leader (§4.4). Leader-only
/// bookkeeping (lease renewal, read-index tracking, ...) lives behind this trait so
/// the driver/engine stay agnostic of leadership entirely.
pub trait Listener: Send + Sync {
    fn on_become_leader(&self, term: u64);
    fn on_step_down(&self, old_term: u64);
}

/// Tracks the current leader term and fans notifications out to listeners (§4.4).
/// The listener list is copy-on-write: readers clone the `Arc<Vec<_>>` under a brief
/// read lock and iterate outside it, so a slow listener never blocks registration of
/// a new one. Fanout itself runs on a bounded pool of tasks rather than unboundedly
/// spawning one task per listener per event.
pub struct LeaderNotifier {
    leader_term: AtomicI64,
    listeners: RwLock<Arc<Vec<Arc<dyn Listener>>>>,
    fanout_semaphore: Arc<Semaphore>,
}

impl LeaderNotifier {
    pub fn new(config: &RheaConfig) -> Self {
        LeaderNotifier {
            leader_term: AtomicI64::new(-1),
            listeners: RwLock::new(Arc::new(Vec::new())),
            fanout_semaphore: Arc::new(Semaphore::new(config.leader_fanout_workers.max(1))),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        let mut guard = self.listeners.write().expect("listener list poisoned");
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn current_term(&self) -> Option<u64> {
        let term = self.leader_term.load(Ordering::Acquire);
        if term < 0 {
            None
        } else {
            Some(term as u64)
        }
    }

    /// Updates the leader term synchronously, then fans notifications out
    /// asynchronously (§4.4). `current_term` must observe the new value the instant
    /// this call returns; it can't wait on listener execution, since a listener that
    /// reads `current_term` back through this same notifier would deadlock against
    /// its own notification.
    pub fn on_become_leader(&self, term: u64) {
        self.leader_term.store(term as i64, Ordering::Release);
        self.fan_out(move |listener| listener.on_become_leader(term));
    }

    pub fn on_step_down(&self, old_term: u64) {
        self.leader_term.store(-1, Ordering::Release);
        self.fan_out(move |listener| listener.on_step_down(old_term));
    }

    fn fan_out<F>(&self, call: F)
    where
        F: Fn(&dyn Listener) + Send + Sync + 'static,
    {
        let listeners = self.listeners.read().expect("listener list poisoned").clone();
        let call = Arc::new(call);
        for listener in listeners.iter().cloned() {
            let semaphore = self.fanout_semaphore.clone();
            let call = call.clone();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("fanout semaphore is never closed");
                call(listener.as_ref());
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct RecordingListener {
        became_leader_term: Arc<AtomicU64>,
        stepped_down: Arc<AtomicI64>,
    }

    impl Listener for RecordingListener {
        fn on_become_leader(&self, term: u64) {
            self.became_leader_term.store(term, Ordering::SeqCst);
        }

        fn on_step_down(&self, old_term: u64) {
            self.stepped_down.store(old_term as i64, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn current_term_updates_synchronously_before_fanout_runs() {
        let config = RheaConfig::new(std::env::temp_dir());
        let notifier = LeaderNotifier::new(&config);
        let became_leader_term = Arc::new(AtomicU64::new(0));
        let stepped_down = Arc::new(AtomicI64::new(-1));
        notifier.add_listener(Arc::new(RecordingListener {
            became_leader_term: became_leader_term.clone(),
            stepped_down: stepped_down.clone(),
        }));

        notifier.on_become_leader(7);
        assert_eq!(notifier.current_term(), Some(7));

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(became_leader_term.load(Ordering::SeqCst), 7);
    }
}
