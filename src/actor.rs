//! Declarative process base.
//!
//! The original `Process` base class lets a subclass annotate methods with
//! `@route`/`@install` decorators; `initialize()` then reflects over the
//! instance once at bind time to build the route and mailbox tables. Rust
//! has neither decorators nor reflection, so the same "declare once, freeze
//! before spawn" contract is expressed as a builder: `route`/`install` are
//! called up front, `build()` freezes the tables into an `Arc` shared
//! between the registry and the HTTP server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::pid::Pid;

/// Context a route handler is invoked with: the requester's pid (if
/// identifiable) and the raw query string, mirroring `handle_http`'s
/// `(request, *args, **kwargs)` shape without tying the handler to a
/// specific HTTP library's request type.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestContext {
    pub query: String,
}

/// A route handler answers GET requests mounted under a process's pid.
/// Returns the response body and an optional content type.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, ctx: HttpRequestContext) -> (Bytes, Option<String>);
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(HttpRequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = (Bytes, Option<String>)> + Send,
{
    async fn handle(&self, ctx: HttpRequestContext) -> (Bytes, Option<String>) {
        (self)(ctx).await
    }
}

/// A mailbox handler answers a wire message posted to a process's mailbox.
/// Mirrors `handle_message(name, body)`; the handler never produces a
/// response body, matching the original's `flush()` trap.
#[async_trait]
pub trait MailboxHandler: Send + Sync {
    async fn handle(&self, from: Option<Pid>, body: Bytes);
}

#[async_trait]
impl<F, Fut> MailboxHandler for F
where
    F: Fn(Option<Pid>, Bytes) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, from: Option<Pid>, body: Bytes) {
        (self)(from, body).await
    }
}

/// The frozen route/mailbox tables produced by `ProcessBuilder::build`.
pub struct ProcessTables {
    pub name: String,
    pub routes: HashMap<String, Arc<dyn RouteHandler>>,
    pub mailboxes: HashMap<String, Arc<dyn MailboxHandler>>,
    pub exited: Option<Arc<dyn Fn(Pid) + Send + Sync>>,
    /// User startup hook, run once on the loop thread right after `spawn`
    /// registers the process. Mirrors `Process.initialize()`.
    pub initialize: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for ProcessTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTables")
            .field("name", &self.name)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("mailboxes", &self.mailboxes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a process's route and mailbox tables before it is spawned. Once
/// `build()` runs, the tables are immutable for the process's lifetime.
pub struct ProcessBuilder {
    name: String,
    routes: HashMap<String, Arc<dyn RouteHandler>>,
    mailboxes: HashMap<String, Arc<dyn MailboxHandler>>,
    exited: Option<Arc<dyn Fn(Pid) + Send + Sync>>,
    initialize: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ProcessBuilder {
            name: name.into(),
            routes: HashMap::new(),
            mailboxes: HashMap::new(),
            exited: None,
            initialize: None,
        }
    }

    /// Register a GET route. `path` must start with `/`.
    pub fn route(mut self, path: &str, handler: impl RouteHandler + 'static) -> Self {
        assert!(path.starts_with('/'), "route path must start with '/': {path}");
        let prior = self.routes.insert(path.to_string(), Arc::new(handler));
        assert!(prior.is_none(), "duplicate route: {path}");
        self
    }

    /// Register a mailbox. `name` is the message name posted under
    /// `/<pid>/<name>`.
    pub fn install(mut self, name: &str, handler: impl MailboxHandler + 'static) -> Self {
        let prior = self.mailboxes.insert(name.to_string(), Arc::new(handler));
        assert!(prior.is_none(), "duplicate mailbox: {name}");
        self
    }

    /// Register a hook invoked when a linked pid is observed to exit.
    pub fn on_exit(mut self, f: impl Fn(Pid) + Send + Sync + 'static) -> Self {
        self.exited = Some(Arc::new(f));
        self
    }

    /// Register a startup hook run once, on the loop thread, right after
    /// the process is registered by `spawn` — the Rust equivalent of
    /// overriding `Process.initialize()` to `link`/`send` on startup.
    pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.initialize = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Arc<ProcessTables> {
        Arc::new(ProcessTables {
            name: self.name,
            routes: self.routes,
            mailboxes: self.mailboxes,
            exited: self.exited,
            initialize: self.initialize,
        })
    }
}
