//! Owning-thread event loop integration.
//!
//! The group needs one primitive from the host loop: a wake handle that can
//! be created and signaled from any thread, runs its handler on the owning
//! thread, and stops keeping the loop alive once closed.
//!
//! `TokioEventLoop` provides it over a tokio runtime handle. Only
//! current-thread runtimes are accepted: there the handler runs on whichever
//! thread drives the runtime, so the owning thread is simply the one calling
//! `block_on`. A multi-thread runtime would run it on any worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Notify, watch};

use crate::error::GroupError;

/// Handler invoked on the owning thread each time a wake handle fires.
pub type WakeHandler = Arc<dyn Fn() + Send + Sync>;

/// Host event loop abstraction.
pub trait EventLoop: Send + Sync {
    /// Create a wake handle whose handler runs on the loop's thread.
    ///
    /// The handle keeps the loop alive until closed.
    fn create_wake(&self, handler: WakeHandler) -> Box<dyn WakeHandle>;
}

/// A schedulable handle on the owning thread's event loop.
pub trait WakeHandle: Send {
    /// Schedule one run of the handler. Signals issued before the handler
    /// runs may be coalesced.
    fn signal(&self);

    /// Stop the handle; the handler will not run again.
    fn close(self: Box<Self>);
}

/// Tokio-backed event loop.
pub struct TokioEventLoop {
    handle: Handle,
    live: Arc<watch::Sender<usize>>,
    created: AtomicU64,
}

impl TokioEventLoop {
    /// Wrap a current-thread runtime. Any other flavor is refused with
    /// `GroupError::NoEventLoop`.
    pub fn new(handle: Handle) -> Result<Arc<Self>, GroupError> {
        if handle.runtime_flavor() != RuntimeFlavor::CurrentThread {
            log::warn!(
                "Refusing {:?} tokio runtime: wake handlers must run on the owning thread",
                handle.runtime_flavor()
            );
            return Err(GroupError::NoEventLoop);
        }

        let (live, _) = watch::channel(0usize);

        Ok(Arc::new(Self {
            handle,
            live: Arc::new(live),
            created: AtomicU64::new(0),
        }))
    }

    /// Bind to the current-thread runtime the calling thread is running in.
    pub fn current() -> Result<Arc<Self>, GroupError> {
        let handle = Handle::try_current().map_err(|_| GroupError::NoEventLoop)?;
        Self::new(handle)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Handles created and not yet closed.
    pub fn live_handles(&self) -> usize {
        *self.live.borrow()
    }

    /// Handles created over the loop's lifetime.
    pub fn handles_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Resolve once no handle keeps the loop alive.
    pub async fn until_idle(&self) {
        let mut rx = self.live.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|live| *live == 0).await;
    }
}

impl EventLoop for TokioEventLoop {
    fn create_wake(&self, handler: WakeHandler) -> Box<dyn WakeHandle> {
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        self.live.send_modify(|live| *live += 1);
        self.created.fetch_add(1, Ordering::Relaxed);

        let task_notify = Arc::clone(&notify);
        let task_closed = Arc::clone(&closed);

        self.handle.spawn(async move {
            loop {
                task_notify.notified().await;

                if task_closed.load(Ordering::Acquire) {
                    break;
                }

                handler();
            }
        });

        Box::new(TokioWake {
            notify,
            closed,
            live: Arc::clone(&self.live),
        })
    }
}

impl std::fmt::Debug for TokioEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioEventLoop")
            .field("live_handles", &self.live_handles())
            .field("handles_created", &self.handles_created())
            .finish()
    }
}

struct TokioWake {
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    live: Arc<watch::Sender<usize>>,
}

impl WakeHandle for TokioWake {
    fn signal(&self) {
        self.notify.notify_one();
    }

    fn close(self: Box<Self>) {
        // Drop does the work
    }
}

impl Drop for TokioWake {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wakes the parked task so it observes `closed` and exits
            self.notify.notify_one();
            self.live.send_modify(|live| *live = live.saturating_sub(1));
        }
    }
}

/// Keeps the owning loop alive until dropped.
///
/// Holds one live wake handle whose handler does nothing.
pub struct LoopPreserver {
    _handle: Box<dyn WakeHandle>,
}

impl LoopPreserver {
    pub fn new(event_loop: &dyn EventLoop) -> Self {
        Self {
            _handle: event_loop.create_wake(Arc::new(|| {})),
        }
    }
}

impl std::fmt::Debug for LoopPreserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopPreserver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "current_thread")]
    async fn test_signal_runs_handler_on_loop() {
        let event_loop = TokioEventLoop::new(Handle::current()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let wake = event_loop.create_wake(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(event_loop.live_handles(), 1);

        wake.signal();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        wake.close();
        assert_eq!(event_loop.live_handles(), 0);
        event_loop.until_idle().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_closed_handle_never_runs() {
        let event_loop = TokioEventLoop::new(Handle::current()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let wake = event_loop.create_wake(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        wake.signal();
        wake.close();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.handles_created(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_loop_preserver_holds_loop_alive() {
        let event_loop = TokioEventLoop::new(Handle::current()).unwrap();

        let preserver = LoopPreserver::new(&*event_loop);
        assert_eq!(event_loop.live_handles(), 1);

        let idle = tokio::time::timeout(Duration::from_millis(20), event_loop.until_idle()).await;
        assert!(idle.is_err(), "loop should not be idle while preserved");

        drop(preserver);
        event_loop.until_idle().await;
        assert_eq!(event_loop.live_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_thread_runtime_is_refused() {
        assert!(matches!(
            TokioEventLoop::new(Handle::current()),
            Err(GroupError::NoEventLoop)
        ));
        assert!(matches!(TokioEventLoop::current(), Err(GroupError::NoEventLoop)));
    }

    #[test]
    fn test_current_outside_a_runtime() {
        assert!(matches!(TokioEventLoop::current(), Err(GroupError::NoEventLoop)));
    }
}
