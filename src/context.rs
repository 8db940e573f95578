//! The context: the single facade a host program uses to bring up a
//! libprocess endpoint, spawn processes, and send/dispatch/delay/link/
//! terminate against them.
//!
//! `Context::singleton` mirrors the original's class-level singleton guard:
//! the first call binds and wins; a later call with different bind
//! parameters is rejected rather than silently reusing the existing
//! instance or rebinding underneath already-spawned processes.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;

use crate::actor::ProcessTables;
use crate::config::EndpointConfig;
use crate::connection::ConnectionCache;
use crate::error::Error;
use crate::link::{ExitCallback, LinkMonitor};
use crate::pid::Pid;
use crate::registry::Registry;
use crate::scheduler::{self, Scheduler, SchedulerHandle};
use crate::server::HttpServer;

static SINGLETON: OnceLock<Context> = OnceLock::new();

/// A running libprocess endpoint: one event loop, one HTTP server, one
/// connection cache, one process registry.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    ip: Ipv4Addr,
    port: u16,
    registry: Registry,
    link_monitor: LinkMonitor,
    scheduler: Scheduler,
    // `Some` until `stop()` takes it to join the loop thread; keeping it
    // alive otherwise is what keeps the loop thread running for this
    // context's lifetime.
    loop_thread: StdMutex<Option<SchedulerHandle>>,
    _server: HttpServer,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("ip", &self.inner.ip)
            .field("port", &self.inner.port)
            .finish()
    }
}

impl Context {
    /// Bind a new context at the resolved ip/port. Does not affect the
    /// process-wide singleton; use `singleton` for that.
    pub async fn new(ip: Option<Ipv4Addr>, port: Option<u16>) -> Result<Self, Error> {
        let config = EndpointConfig::resolve(ip, port)?;
        let loop_thread = scheduler::start();
        let scheduler = loop_thread.scheduler();

        let link_monitor = LinkMonitor::new(scheduler.clone());
        let connections = ConnectionCache::new(scheduler.clone(), link_monitor.clone());

        // Bind and start accepting on the loop thread itself (not whatever
        // runtime happens to be polling this function), so inbound
        // connection handling — and therefore every mailbox/route handler
        // invocation it triggers — shares the same single-threaded
        // run-to-completion guarantee as scheduled dispatch/delay/connect
        // callbacks.
        let bind_ip = config.ip;
        let bind_port = config.port;
        let (listener, bound) = scheduler
            .run(async move { HttpServer::bind(bind_ip, bind_port).await })
            .await?;

        let advertised_ip = if config.ip == Ipv4Addr::UNSPECIFIED {
            config.advertised_ip().unwrap_or(config.ip)
        } else {
            config.ip
        };
        let registry = Registry::new(
            advertised_ip,
            bound.port(),
            scheduler.clone(),
            connections,
            link_monitor.clone(),
        );
        let registry_for_serve = registry.clone();
        let server = scheduler
            .run(async move { HttpServer::serve(listener, registry_for_serve) })
            .await;

        Ok(Context {
            inner: Arc::new(Inner {
                ip: advertised_ip,
                port: bound.port(),
                registry,
                link_monitor,
                scheduler,
                loop_thread: StdMutex::new(Some(loop_thread)),
                _server: server,
            }),
        })
    }

    /// Return the process-wide singleton context, binding it on first call.
    /// A later call with bind parameters that differ from the first wins
    /// is rejected with `Error::ConfigError`; a call with matching
    /// parameters (or no parameters) returns the existing instance.
    pub async fn singleton(ip: Option<Ipv4Addr>, port: Option<u16>) -> Result<Self, Error> {
        if let Some(existing) = SINGLETON.get() {
            if let Some(ip) = ip {
                if ip != existing.inner.ip {
                    return Err(Error::ConfigError(format!(
                        "singleton already bound to {}, cannot rebind to {ip}",
                        existing.inner.ip
                    )));
                }
            }
            if let Some(port) = port {
                if port != existing.inner.port {
                    return Err(Error::ConfigError(format!(
                        "singleton already bound to port {}, cannot rebind to {port}",
                        existing.inner.port
                    )));
                }
            }
            return Ok(existing.clone());
        }

        let context = Context::new(ip, port).await?;
        // Another thread may have won the race; if so, discard our context
        // and defer to theirs (its loop thread and server are dropped,
        // tearing themselves down).
        match SINGLETON.set(context.clone()) {
            Ok(()) => Ok(context),
            Err(_) => Ok(SINGLETON.get().expect("just failed to set").clone()),
        }
    }

    pub fn pid(&self) -> (Ipv4Addr, u16) {
        (self.inner.ip, self.inner.port)
    }

    /// Bind `tables` under a freshly reserved pid. Rejects a name that is
    /// already spawned in this context (`Error::InvalidProcess`) rather
    /// than clobbering the existing process.
    pub async fn spawn(&self, tables: Arc<ProcessTables>) -> Result<Pid, Error> {
        self.inner.registry.spawn(tables).await
    }

    pub async fn terminate(&self, pid: &Pid) {
        self.inner.registry.terminate(pid).await;
    }

    /// Terminate every locally spawned process, close every cached
    /// outbound connection, then halt the event loop. Safe to call from
    /// any thread; calling it again on an already-stopped context is a
    /// no-op.
    pub async fn stop(&self) {
        self.inner.registry.terminate_all().await;
        self.inner.registry.close_all_connections().await;
        let handle = {
            let mut guard = self
                .inner
                .loop_thread
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
        }
    }

    pub async fn send(
        &self,
        from: Pid,
        to: Pid,
        method: impl Into<String>,
        body: Bytes,
        content_type: Option<String>,
    ) -> Result<(), Error> {
        self.inner
            .registry
            .send(from, to, method.into(), body, content_type)
            .await
    }

    /// Like `send`, but identifies the sender via the legacy
    /// `User-Agent: libprocess/<pid>` header instead of `Libprocess-From`.
    pub async fn send_legacy(
        &self,
        from: Pid,
        to: Pid,
        method: impl Into<String>,
        body: Bytes,
        content_type: Option<String>,
    ) -> Result<(), Error> {
        self.inner
            .registry
            .send_legacy(from, to, method.into(), body, content_type)
            .await
    }

    pub async fn dispatch(&self, to: Pid, method: impl Into<String>, body: Bytes) -> Result<(), Error> {
        self.inner.registry.dispatch(to, method.into(), body).await
    }

    pub fn delay(&self, delay: Duration, from: Pid, to: Pid, method: impl Into<String>, body: Bytes) {
        self.inner.registry.delay(delay, from, to, method.into(), body);
    }

    /// Register a one-shot callback for `subject`'s exit, independent of
    /// any spawned process.
    pub fn link(&self, subject: Pid, on_exit: ExitCallback) {
        self.inner.link_monitor.link(subject, on_exit);
    }

    /// Link `owner`'s declared `on_exit` hook (`ProcessBuilder::on_exit`)
    /// to `subject`'s liveness, the Rust equivalent of a process calling
    /// `self.link(subject)` from within its own handlers.
    pub async fn link_process(&self, owner: &Pid, subject: Pid) -> Result<(), Error> {
        self.inner.registry.link(&owner.id, subject).await
    }

    pub fn scheduler(&self) -> Scheduler {
        self.inner.scheduler.clone()
    }
}
