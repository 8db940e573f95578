//! Link / exit monitor.
//!
//! `link(watcher, subject)` registers interest in `subject`'s liveness.
//! Liveness here is transport-derived: when the connection cache loses its
//! stream to a pid (close or connect failure) or a local process
//! terminates, every watcher registered on that pid receives one `exited`
//! notification, then the registration is dropped — this mirrors
//! `Context.link`/`__erase_link`/`__on_exit`'s one-shot-per-edge contract.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::pid::Pid;
use crate::scheduler::Scheduler;

/// Callback invoked when a watched pid exits. Runs on the loop thread.
pub type ExitCallback = Box<dyn FnOnce(&Pid) + Send + 'static>;

#[derive(Default)]
struct State {
    watchers: HashMap<Pid, Vec<ExitCallback>>,
}

#[derive(Clone)]
pub struct LinkMonitor {
    state: Arc<Mutex<State>>,
    scheduler: Scheduler,
}

impl std::fmt::Debug for LinkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkMonitor").finish()
    }
}

impl LinkMonitor {
    pub fn new(scheduler: Scheduler) -> Self {
        LinkMonitor {
            state: Arc::new(Mutex::new(State::default())),
            scheduler,
        }
    }

    /// Register `on_exit` to fire the next time `subject` is observed to
    /// have exited.
    pub fn link(&self, subject: Pid, on_exit: ExitCallback) {
        let state = self.state.clone();
        self.scheduler.schedule(async move {
            let mut state = state.lock().await;
            state.watchers.entry(subject).or_default().push(on_exit);
        });
    }

    /// Fire and clear every watcher registered on `subject`. Safe to call
    /// from any thread; the actual fan-out runs on the loop thread.
    pub fn notify_exited(&self, subject: &Pid) {
        let state = self.state.clone();
        let subject = subject.clone();
        self.scheduler.schedule(async move {
            let callbacks = {
                let mut state = state.lock().await;
                state.watchers.remove(&subject).unwrap_or_default()
            };
            for cb in callbacks {
                cb(&subject);
            }
        });
    }
}
