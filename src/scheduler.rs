//! The event loop: a `current_thread` tokio runtime pinned to one dedicated
//! OS thread. Every task the runtime drives — handler invocation, connect
//! completion, socket read, timer firing — runs on that single thread, so
//! two handlers never run concurrently with each other; a handler only
//! yields at its own await points. This is the run-to-completion guarantee
//! the original single-threaded event loop provided.

use std::future::Future;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::watch;

/// Handle to the running event loop. Cheap to clone; every clone schedules
/// onto the same loop thread.
#[derive(Clone, Debug)]
pub struct Scheduler {
    handle: Handle,
}

struct LoopThread {
    join: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the loop thread; dropping it (or calling `stop`) tears the loop
/// down.
pub struct SchedulerHandle {
    scheduler: Scheduler,
    thread: Option<LoopThread>,
}

impl Scheduler {
    /// Wrap an existing tokio `Handle` as a scheduler without spawning a
    /// dedicated thread. Used by `start()`, and directly by tests running
    /// inside their own `#[tokio::test]` runtime where spawning a second,
    /// separate loop thread would be redundant.
    pub fn from_handle(handle: Handle) -> Self {
        Scheduler { handle }
    }

    /// Spawn a task onto the loop thread. Safe to call from any thread.
    pub fn schedule<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(guarded(fut));
    }

    /// Spawn a task onto the loop thread after `delay` elapses.
    pub fn schedule_after<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            guarded(fut).await;
        });
    }

    pub fn tokio_handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `fut` as a task on the loop thread and await its result. Unlike
    /// `schedule`, `fut`'s return value makes it back to the caller, and a
    /// panic inside it propagates instead of only being logged — this is
    /// for one-time setup (binding the listener, starting the accept loop)
    /// that must itself execute on the loop thread rather than whatever
    /// runtime happens to be polling the caller, not for ordinary handler
    /// dispatch.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match self.handle.spawn(fut).await {
            Ok(value) => value,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

/// Run `fut`, catching a panic at the task boundary so one failing handler
/// never takes down the loop thread. Matches the spec's contract that a
/// handler which panics is logged, not fatal to the actor or the context.
async fn guarded<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let result = std::panic::AssertUnwindSafe(fut)
        .catch_unwind()
        .await;
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("scheduled task panicked: {message}");
    }
}

/// Minimal `catch_unwind`-on-a-future adaptor; tokio does not ship one.
trait CatchUnwind: Future + Sized {
    fn catch_unwind(self) -> CatchUnwindFuture<Self> {
        CatchUnwindFuture { inner: self }
    }
}
impl<F: Future> CatchUnwind for F {}

struct CatchUnwindFuture<F> {
    inner: F,
}

impl<F: Future> Future for CatchUnwindFuture<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        // Safety: we never move out of `inner`; the pin projection is
        // structural and `inner` is never itself moved after this point.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(std::task::Poll::Ready(v)) => std::task::Poll::Ready(Ok(v)),
            Ok(std::task::Poll::Pending) => std::task::Poll::Pending,
            Err(payload) => std::task::Poll::Ready(Err(payload)),
        }
    }
}

/// Start the event loop on a dedicated OS thread and block the caller until
/// it has finished initializing.
pub fn start() -> SchedulerHandle {
    // A plain std channel, not `tokio::sync::oneshot`: this call may itself
    // run from inside a caller's tokio runtime (e.g. a host binary's
    // `#[tokio::main]`), and `oneshot::Receiver::blocking_recv` panics in
    // that situation. Blocking the calling thread on a signal from an
    // independent OS thread via `std::sync::mpsc` carries no such
    // restriction.
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let join = std::thread::Builder::new()
        .name("libprocess-loop".into())
        .spawn(move || {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build loop-thread runtime");
            let handle = runtime.handle().clone();
            let _ = ready_tx.send(handle);
            runtime.block_on(async move {
                let _ = shutdown_rx.changed().await;
            });
        })
        .expect("failed to spawn loop thread");

    let handle = ready_rx
        .recv()
        .expect("loop thread dropped before signaling ready");

    SchedulerHandle {
        scheduler: Scheduler { handle },
        thread: Some(LoopThread { join, shutdown_tx }),
    }
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Signal the loop thread to shut down and join it.
    pub fn stop(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.shutdown_tx.send(true);
            let _ = thread.join.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.shutdown_tx.send(true);
            let _ = thread.join.join();
        }
    }
}
