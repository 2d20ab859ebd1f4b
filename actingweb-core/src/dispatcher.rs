//! Callback dispatch strategy (spec §9 design note, spec §5).
//!
//! Two modes: block the caller until the peer HTTP call completes
//! (`sync_subscription_callbacks = true`, needed on serverless hosts with no
//! background execution), or hand the call off to a cooperative scheduler
//! and return immediately. [`TokioDispatcher`] is the scheduler-backed
//! implementation; [`Dispatcher::Sync`] needs no scheduler at all.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::warn;

/// A boxed, 'static async unit of work — a single outbound callback POST.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How outbound callbacks get run relative to the caller.
pub enum Dispatcher {
    /// Await the callback inline before returning (spec §5's serverless
    /// mode: `sync_subscription_callbacks = true`).
    Sync,
    /// Hand off to a tokio task and return immediately.
    Scheduled(TokioDispatcher),
}

impl Dispatcher {
    pub async fn dispatch(&self, work: CallbackFuture) {
        match self {
            Dispatcher::Sync => work.await,
            Dispatcher::Scheduled(scheduler) => scheduler.spawn(work),
        }
    }
}

/// Fire-and-forget execution on the tokio runtime. Falls back to awaiting
/// inline if called outside a runtime (e.g. from a sync test harness),
/// since a panicking `spawn` would be worse than a blocking call.
#[derive(Clone, Default)]
pub struct TokioDispatcher {
    _private: (),
}

impl TokioDispatcher {
    pub fn new() -> Self {
        TokioDispatcher::default()
    }

    fn spawn(&self, work: CallbackFuture) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    work.await;
                });
            }
            Err(_) => {
                warn!("no tokio runtime available, falling back to blocking dispatch");
                futures_lite_block_on(work);
            }
        }
    }
}

/// Minimal inline executor for the no-runtime fallback path above. Only
/// ever hit outside an async context, which in practice means tests that
/// construct a [`Dispatcher`] without entering `#[tokio::test]`.
fn futures_lite_block_on(fut: CallbackFuture) {
    let mut fut = fut;
    let waker = futures_noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    loop {
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(()) => return,
            std::task::Poll::Pending => std::thread::yield_now(),
        }
    }
}

fn futures_noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};

    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}

/// Shared handle to a dispatcher, cheaply cloned into callback closures.
pub type SharedDispatcher = Arc<Dispatcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn sync_dispatch_runs_inline_and_awaits_completion() {
        let dispatcher = Dispatcher::Sync;
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        dispatcher
            .dispatch(Box::pin(async move {
                ran2.store(true, Ordering::SeqCst);
            }))
            .await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn scheduled_dispatch_eventually_runs() {
        let dispatcher = Dispatcher::Scheduled(TokioDispatcher::new());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        dispatcher
            .dispatch(Box::pin(async move {
                ran2.store(true, Ordering::SeqCst);
            }))
            .await;
        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
