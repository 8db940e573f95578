//! Process registry: tracks every locally spawned process and implements
//! `spawn`, `terminate`, `send`, `dispatch`, `delay`.
//!
//! Grounded in `Context.spawn`/`Context.dispatch`/`Context.delay`/
//! `Context.send`: a message addressed to a pid whose ip/port match this
//! context's own endpoint is delivered in-process without touching the
//! network; anything else goes out through the connection cache.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::actor::ProcessTables;
use crate::connection::ConnectionCache;
use crate::link::LinkMonitor;
use crate::pid::Pid;
use crate::scheduler::Scheduler;

struct Entry {
    tables: Arc<ProcessTables>,
}

#[derive(Clone)]
pub struct Registry {
    local_ip: Ipv4Addr,
    local_port: u16,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    scheduler: Scheduler,
    connections: ConnectionCache,
    link_monitor: LinkMonitor,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local_ip", &self.local_ip)
            .field("local_port", &self.local_port)
            .finish()
    }
}

impl Registry {
    pub fn new(
        local_ip: Ipv4Addr,
        local_port: u16,
        scheduler: Scheduler,
        connections: ConnectionCache,
        link_monitor: LinkMonitor,
    ) -> Self {
        Registry {
            local_ip,
            local_port,
            entries: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            connections,
            link_monitor,
        }
    }

    fn local_pid(&self, id: &str) -> Pid {
        Pid::new(id, self.local_ip, self.local_port)
    }

    fn is_local(&self, pid: &Pid) -> bool {
        pid.ip == self.local_ip && pid.port == self.local_port
    }

    /// Bind `tables` under a freshly reserved pid and register it for
    /// dispatch. Rejects a name that is already spawned rather than
    /// clobbering the existing entry, per the "duplicate spawn of the same
    /// pid is rejected" contract. Runs the process's `on_init` hook (if
    /// any) on the loop thread once registration succeeds, then returns
    /// the bound pid.
    pub async fn spawn(&self, tables: Arc<ProcessTables>) -> Result<Pid, crate::error::Error> {
        let pid = self.local_pid(&tables.name);
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&tables.name) {
            return Err(crate::error::Error::InvalidProcess(format!(
                "process `{}` is already spawned",
                tables.name
            )));
        }
        let initialize = tables.initialize.clone();
        entries.insert(tables.name.clone(), Entry { tables });
        drop(entries);
        if let Some(initialize) = initialize {
            self.scheduler.schedule(async move {
                initialize();
            });
        }
        Ok(pid)
    }

    /// Unregister `pid` and notify anyone linked to it. A no-op if `pid`
    /// is not a locally spawned process.
    pub async fn terminate(&self, pid: &Pid) {
        if !self.is_local(pid) {
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.remove(&pid.id);
        drop(entries);
        self.link_monitor.notify_exited(pid);
    }

    /// Unregister every locally spawned process and notify anyone linked
    /// to any of them. Used by `Context::stop`.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = {
            let mut entries = self.entries.lock().await;
            let ids = entries.keys().cloned().collect();
            entries.clear();
            ids
        };
        for id in ids {
            let pid = self.local_pid(&id);
            self.link_monitor.notify_exited(&pid);
        }
    }

    /// Close every cached outbound connection. Used by `Context::stop`.
    pub async fn close_all_connections(&self) {
        self.connections.close_all().await;
    }

    /// Deliver `body` to `to`'s mailbox named `method`. Local delivery is
    /// direct; remote delivery goes through the connection cache. An
    /// unknown local mailbox is silently dropped (with a log warning), the
    /// same "fire and forget" contract `Context.send` provides.
    pub async fn send(
        &self,
        from: Pid,
        to: Pid,
        method: String,
        body: Bytes,
        content_type: Option<String>,
    ) -> Result<(), crate::error::Error> {
        self.send_with_identification(from, to, method, body, content_type, false)
            .await
    }

    /// Like `send`, but identifies the sender via the legacy
    /// `User-Agent: libprocess/<pid>` header instead of `Libprocess-From`,
    /// for interop with peers that predate the modern header.
    pub async fn send_legacy(
        &self,
        from: Pid,
        to: Pid,
        method: String,
        body: Bytes,
        content_type: Option<String>,
    ) -> Result<(), crate::error::Error> {
        self.send_with_identification(from, to, method, body, content_type, true)
            .await
    }

    async fn send_with_identification(
        &self,
        from: Pid,
        to: Pid,
        method: String,
        body: Bytes,
        content_type: Option<String>,
        legacy: bool,
    ) -> Result<(), crate::error::Error> {
        if self.is_local(&to) {
            self.schedule_local_delivery(Some(from), to, method, body);
            return Ok(());
        }
        let path = format!("{}/{}", to.path_prefix(), method);
        self.connections
            .send_request(from, to, path, body, content_type, legacy)
            .await
    }

    /// Call an arbitrary declared method on a local process directly,
    /// bypassing mailbox delivery semantics. Unlike `send`, an unknown
    /// target or method is a hard error rather than a silent drop, per the
    /// `dispatch`/`delay` contract. The target/method lookup happens
    /// synchronously so the error is known before returning; the handler
    /// invocation itself is scheduled onto the loop thread, same as a
    /// local `send` (see `schedule_local_delivery`), rather than run
    /// inline on whatever thread called `dispatch`.
    pub async fn dispatch(
        &self,
        to: Pid,
        method: String,
        body: Bytes,
    ) -> Result<(), crate::error::Error> {
        if !self.is_local(&to) {
            return Err(crate::error::Error::InvalidProcess(to.to_string()));
        }
        let handler = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(&to.id)
                .ok_or_else(|| crate::error::Error::InvalidProcess(to.to_string()))?;
            entry
                .tables
                .mailboxes
                .get(&method)
                .cloned()
                .ok_or_else(|| crate::error::Error::InvalidMethod(method.clone()))?
        };
        self.scheduler.schedule(async move {
            handler.handle(None, body).await;
        });
        Ok(())
    }

    /// Enqueue a local mailbox delivery on the loop thread rather than
    /// invoking the handler inline on the caller's thread, so a local
    /// short-circuited `send` gives actor handlers the same "only ever
    /// runs on the loop thread" guarantee a remote send's eventual
    /// delivery does (§4.5/§5: "a single-threaded execution contract for
    /// actor code despite being driven by multi-threaded callers").
    fn schedule_local_delivery(&self, from: Option<Pid>, to: Pid, method: String, body: Bytes) {
        let entries = self.entries.clone();
        self.scheduler.schedule(async move {
            let handler = {
                let entries = entries.lock().await;
                entries
                    .get(&to.id)
                    .and_then(|e| e.tables.mailboxes.get(&method).cloned())
            };
            match handler {
                Some(handler) => handler.handle(from, body).await,
                None => log::warn!("dropping message for unknown local process {to}/{method}"),
            }
        });
    }

    /// Link `owner`'s declared `on_exit` hook (see `ProcessBuilder::on_exit`)
    /// to `subject`'s liveness. If `owner` declared no hook, `subject`'s
    /// exit is still observed, just with no process-level callback to run.
    pub async fn link(&self, owner_id: &str, subject: Pid) -> Result<(), crate::error::Error> {
        let hook = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(owner_id)
                .ok_or_else(|| crate::error::Error::UnboundProcess(owner_id.to_string()))?;
            entry.tables.exited.clone()
        };
        match hook {
            Some(hook) => self
                .link_monitor
                .link(subject, Box::new(move |pid| hook(pid.clone()))),
            None => self
                .link_monitor
                .link(subject, Box::new(|pid| log::debug!("{pid} exited"))),
        }
        Ok(())
    }

    /// Schedule a `dispatch` call to run after `delay` elapses: the same
    /// arbitrary-method, local-only, `InvalidProcess`/`InvalidMethod`
    /// contract as `dispatch`, just deferred. `from` is accepted (not used
    /// by local dispatch, which carries no sender identity) to keep the
    /// call-site shape symmetric with `send`'s.
    pub fn delay(&self, delay: Duration, from: Pid, to: Pid, method: String, body: Bytes) {
        let _ = from;
        let registry = self.clone();
        self.scheduler.schedule_after(delay, async move {
            if let Err(e) = registry.dispatch(to.clone(), method.clone(), body).await {
                log::warn!("delayed dispatch to {to}/{method} failed: {e}");
            }
        });
    }

    pub async fn route_handler(
        &self,
        id: &str,
        path: &str,
    ) -> Option<Arc<dyn crate::actor::RouteHandler>> {
        let entries = self.entries.lock().await;
        entries.get(id).and_then(|e| e.tables.routes.get(path).cloned())
    }

    pub async fn mailbox_handler(
        &self,
        id: &str,
        name: &str,
    ) -> Option<Arc<dyn crate::actor::MailboxHandler>> {
        let entries = self.entries.lock().await;
        entries
            .get(id)
            .and_then(|e| e.tables.mailboxes.get(name).cloned())
    }

    pub async fn is_mounted(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ProcessBuilder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    fn new_registry() -> Registry {
        let scheduler = Scheduler::from_handle(tokio::runtime::Handle::current());
        let link_monitor = LinkMonitor::new(scheduler.clone());
        let connections = ConnectionCache::new(scheduler.clone(), link_monitor.clone());
        Registry::new(
            Ipv4Addr::new(127, 0, 0, 1),
            5050,
            scheduler,
            connections,
            link_monitor,
        )
    }

    #[tokio::test]
    async fn spawn_registers_local_mailbox() {
        let registry = new_registry();
        let received = StdArc::new(AtomicBool::new(false));
        let received2 = received.clone();
        let tables = ProcessBuilder::new("echo")
            .install("ping", move |_from: Option<Pid>, _body: Bytes| {
                let received = received2.clone();
                async move {
                    received.store(true, Ordering::SeqCst);
                }
            })
            .build();
        let pid = registry.spawn(tables).await.unwrap();
        registry
            .send(pid.clone(), pid.clone(), "ping".into(), Bytes::new(), None)
            .await
            .unwrap();
        // Local delivery is scheduled onto the loop thread rather than run
        // inline, so give it a chance to run before asserting.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(received.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn duplicate_spawn_of_the_same_name_is_rejected() {
        let registry = new_registry();
        let tables = ProcessBuilder::new("echo").build();
        registry.spawn(tables).await.unwrap();
        let tables_again = ProcessBuilder::new("echo").build();
        let result = registry.spawn(tables_again).await;
        assert!(matches!(result, Err(crate::error::Error::InvalidProcess(_))));
        // The first process is still mounted, untouched by the rejected spawn.
        assert!(registry.is_mounted("echo").await);
    }

    #[tokio::test]
    async fn spawn_runs_the_on_init_hook_on_the_loop_thread() {
        let registry = new_registry();
        let initialized = StdArc::new(AtomicBool::new(false));
        let initialized2 = initialized.clone();
        let tables = ProcessBuilder::new("echo")
            .on_init(move || initialized2.store(true, Ordering::SeqCst))
            .build();
        registry.spawn(tables).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(initialized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_to_unknown_local_mailbox_is_silently_dropped() {
        let registry = new_registry();
        let tables = ProcessBuilder::new("echo").build();
        let pid = registry.spawn(tables).await.unwrap();
        let result = registry
            .send(pid.clone(), pid.clone(), "missing".into(), Bytes::new(), None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dispatch_delivers_locally_without_a_sender() {
        let registry = new_registry();
        let observed = StdArc::new(Mutex::new(None));
        let observed2 = observed.clone();
        let tables = ProcessBuilder::new("echo")
            .install("ping", move |from: Option<Pid>, _body: Bytes| {
                let observed = observed2.clone();
                async move {
                    *observed.lock().await = Some(from);
                }
            })
            .build();
        let pid = registry.spawn(tables).await.unwrap();
        registry
            .dispatch(pid.clone(), "ping".into(), Bytes::new())
            .await
            .unwrap();
        // `dispatch` returns once the target/method lookup succeeds; the
        // handler invocation itself is scheduled onto the loop thread.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(*observed.lock().await, Some(None));
    }

    #[tokio::test]
    async fn link_invokes_process_declared_on_exit_hook() {
        let registry = new_registry();
        let fired = StdArc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let tables = ProcessBuilder::new("watcher")
            .on_exit(move |_pid| {
                fired2.store(true, Ordering::SeqCst);
            })
            .build();
        registry.spawn(tables).await.unwrap();
        let subject = Pid::new("child", Ipv4Addr::new(127, 0, 0, 1), 6000);
        registry.link("watcher", subject.clone()).await.unwrap();
        // Drive the exit the way a lost connection would: the link
        // monitor observes it directly, since `subject` here is a remote
        // pid with no local registry entry for `terminate` to act on.
        registry.link_monitor.notify_exited(&subject);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn link_rejects_unknown_owner() {
        let registry = new_registry();
        let subject = Pid::new("child", Ipv4Addr::new(127, 0, 0, 1), 6000);
        let result = registry.link("nobody", subject).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dispatch_to_remote_pid_is_rejected() {
        let registry = new_registry();
        let remote = Pid::new("other", Ipv4Addr::new(10, 0, 0, 1), 9999);
        let result = registry.dispatch(remote, "ping".into(), Bytes::new()).await;
        assert!(matches!(result, Err(crate::error::Error::InvalidProcess(_))));
    }

    #[tokio::test]
    async fn dispatch_to_unknown_local_method_is_invalid_method() {
        let registry = new_registry();
        let tables = ProcessBuilder::new("echo").build();
        let pid = registry.spawn(tables).await.unwrap();
        let result = registry.dispatch(pid, "missing".into(), Bytes::new()).await;
        assert!(matches!(result, Err(crate::error::Error::InvalidMethod(_))));
    }

    #[tokio::test]
    async fn delay_to_unknown_local_method_logs_and_does_not_panic() {
        let registry = new_registry();
        let tables = ProcessBuilder::new("echo").build();
        let pid = registry.spawn(tables).await.unwrap();
        registry.delay(
            Duration::from_millis(5),
            pid.clone(),
            pid.clone(),
            "missing".into(),
            Bytes::new(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        // No panic, no observable effect beyond the logged warning.
        assert!(registry.is_mounted("echo").await);
    }

    #[tokio::test]
    async fn terminate_removes_process_and_notifies_link() {
        let registry = new_registry();
        let tables = ProcessBuilder::new("echo").build();
        let pid = registry.spawn(tables).await.unwrap();
        assert!(registry.is_mounted("echo").await);
        registry.terminate(&pid).await;
        assert!(!registry.is_mounted("echo").await);
    }

    #[tokio::test]
    async fn terminate_all_clears_every_process_and_notifies_links() {
        let registry = new_registry();
        let fired = StdArc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let watcher_tables = ProcessBuilder::new("watcher")
            .on_exit(move |_pid| {
                fired2.store(true, Ordering::SeqCst);
            })
            .build();
        registry.spawn(watcher_tables).await.unwrap();
        let child_tables = ProcessBuilder::new("child").build();
        let child_pid = registry.spawn(child_tables).await.unwrap();
        registry.link("watcher", child_pid).await.unwrap();

        assert!(registry.is_mounted("watcher").await);
        assert!(registry.is_mounted("child").await);
        registry.terminate_all().await;
        assert!(!registry.is_mounted("watcher").await);
        assert!(!registry.is_mounted("child").await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
