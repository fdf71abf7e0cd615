//! Coalescing progress channel from a loader thread to an async consumer.
//!
//! The native loader calls its progress callback very often and from a
//! thread that must never block. [`ProgressPublisher::checkpoint`] only
//! touches atomics: it raises the shared value monotonically, marks it
//! pending and wakes the consumer if it was not already woken. The consumer
//! task delivers the latest value once per wakeup, so bursts collapse into a
//! single callback invocation.
//!
//! The checkpoint is also where cooperative abort is observed: it returns
//! `false` once the abort flag is set.
//!
//! Whole-percent milestones are logged on the publishing side, each exactly
//! once, regardless of how many updates the consumer skips.

use futures::task::AtomicWaker;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Consumer-side callback receiving fractional progress in `[0, 1]`
pub type ProgressCallback = Box<dyn FnMut(f32) + Send + 'static>;

struct RelayShared {
    /// Latest progress as `f32` bits
    latest: AtomicU32,
    pending: AtomicBool,
    closed: AtomicBool,
    waker: AtomicWaker,
    /// Highest whole percent already logged
    percent: AtomicU32,
    abort: Arc<AtomicBool>,
    honour_abort: bool,
}

/// Owner side of the relay, held by the load task
pub struct ProgressRelay {
    shared: Arc<RelayShared>,
    consumer: Option<JoinHandle<()>>,
}

/// Worker side of the relay
#[derive(Clone)]
pub struct ProgressPublisher {
    shared: Arc<RelayShared>,
}

impl ProgressRelay {
    /// Create a relay whose checkpoint honours `abort` when `honour_abort` is set
    pub fn new(abort: Arc<AtomicBool>, honour_abort: bool) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                latest: AtomicU32::new(0f32.to_bits()),
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                waker: AtomicWaker::new(),
                percent: AtomicU32::new(0),
                abort,
                honour_abort,
            }),
            consumer: None,
        }
    }

    /// Deliver updates to `callback` from a task on `runtime`
    pub fn with_consumer(mut self, runtime: &Handle, callback: ProgressCallback) -> Self {
        let shared = self.shared.clone();
        self.consumer = Some(runtime.spawn(consume(shared, callback)));
        self
    }

    pub fn publisher(&self) -> ProgressPublisher {
        ProgressPublisher {
            shared: self.shared.clone(),
        }
    }

    /// Latest published progress
    pub fn latest(&self) -> f32 {
        f32::from_bits(self.shared.latest.load(Ordering::SeqCst))
    }

    /// Close the relay and wait until the consumer has delivered the final
    /// value and released its callback.
    pub async fn finish(mut self) {
        self.shared.close();
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.await {
                log::warn!("Progress consumer ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ProgressRelay {
    fn drop(&mut self) {
        // Lets a consumer that was never finished exit and drop its callback
        self.shared.close();
    }
}

impl RelayShared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.waker.wake();
    }
}

impl ProgressPublisher {
    /// Publish `progress` and report whether loading should continue
    pub fn checkpoint(&self, progress: f32) -> bool {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        let shared = &self.shared;

        let raised = shared
            .latest
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                (progress > f32::from_bits(bits)).then(|| progress.to_bits())
            })
            .is_ok();

        if let Some(crossed) = self.record_milestones(progress) {
            for percent in crossed {
                log::debug!("model load progress: {}%", percent);
            }
        }

        if raised && !shared.pending.swap(true, Ordering::SeqCst) {
            shared.waker.wake();
        }

        !(shared.honour_abort && shared.abort.load(Ordering::SeqCst))
    }

    /// Claim the whole-percent thresholds newly crossed by `progress`
    pub(crate) fn record_milestones(&self, progress: f32) -> Option<RangeInclusive<u32>> {
        let target = (progress * 100.0).floor() as u32;
        let previous = self
            .shared
            .percent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |seen| (target > seen).then_some(target))
            .ok()?;
        Some(previous + 1..=target)
    }
}

async fn consume(shared: Arc<RelayShared>, mut callback: ProgressCallback) {
    let mut delivered = f32::NEG_INFINITY;
    loop {
        let (value, closed) = futures::future::poll_fn(|cx| {
            shared.waker.register(cx.waker());
            let closed = shared.closed.load(Ordering::SeqCst);
            if shared.pending.swap(false, Ordering::SeqCst) {
                let value = f32::from_bits(shared.latest.load(Ordering::SeqCst));
                return Poll::Ready((Some(value), closed));
            }
            if closed {
                return Poll::Ready((None, true));
            }
            Poll::Pending
        })
        .await;

        if let Some(value) = value {
            if value > delivered {
                callback(value);
                delivered = value;
            }
        }
        if closed {
            break;
        }
    }
    drop(callback);
    log::trace!("Progress consumer released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn relay() -> ProgressRelay {
        ProgressRelay::new(Arc::new(AtomicBool::new(false)), true)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_final_value_delivered_and_callback_released() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let released = Arc::new(AtomicBool::new(false));

        struct ReleaseGuard(Arc<AtomicBool>);
        impl Drop for ReleaseGuard {
            fn drop(&mut self) {
                assert!(!self.0.swap(true, Ordering::SeqCst), "callback released twice");
            }
        }
        let guard = ReleaseGuard(released.clone());

        let relay = relay().with_consumer(
            &Handle::current(),
            Box::new(move |p| {
                let _ = &guard;
                sink.lock().push(p);
            }),
        );
        let publisher = relay.publisher();
        tokio::task::spawn_blocking(move || {
            for step in 1..=1000 {
                publisher.checkpoint(step as f32 / 1000.0);
            }
        })
        .await
        .unwrap();
        relay.finish().await;

        let seen = seen.lock();
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_checkpoint_reports_abort() {
        let abort = Arc::new(AtomicBool::new(false));
        let relay = ProgressRelay::new(abort.clone(), true);
        let publisher = relay.publisher();
        assert!(publisher.checkpoint(0.1));
        abort.store(true, Ordering::SeqCst);
        assert!(!publisher.checkpoint(0.2));

        let ignoring = ProgressRelay::new(abort, false);
        assert!(ignoring.publisher().checkpoint(0.3));
    }

    #[test]
    fn test_latest_never_decreases() {
        let relay = relay();
        let publisher = relay.publisher();
        publisher.checkpoint(0.6);
        publisher.checkpoint(0.2);
        assert_eq!(relay.latest(), 0.6);
    }

    proptest! {
        #[test]
        fn prop_every_milestone_claimed_once(mut steps in proptest::collection::vec(0.0f32..1.0, 0..200)) {
            steps.push(1.0);
            let relay = relay();
            let publisher = relay.publisher();
            let mut claimed = Vec::new();
            for p in steps {
                if let Some(range) = publisher.record_milestones(p) {
                    claimed.extend(range);
                }
            }
            claimed.sort_unstable();
            prop_assert_eq!(claimed, (1..=100).collect::<Vec<u32>>());
        }
    }
}
