use crate::execution::context::ContextSnapshot;
use crate::execution::error::ExecutionError;
use crate::execution::interaction::InteractionGateway;
use crate::execution::session::SessionStatus;
use crate::shared::cancel::CancellationToken;
use crate::shared::ids::{InteractionId, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What the registry knows about a live session without touching the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleState {
    pub status: SessionStatus,
    pub cursor: usize,
    pub current_interaction: Option<InteractionId>,
    pub last_snapshot: Option<ContextSnapshot>,
}

/// Control handle for one running session. Each handle carries its own
/// locks, so operations on one session never contend with another.
pub struct SessionHandle {
    session_id: SessionId,
    cancel: CancellationToken,
    running: AtomicBool,
    state: Mutex<HandleState>,
    finished: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(session_id: SessionId, status: SessionStatus, cursor: usize) -> Self {
        Self {
            session_id,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            state: Mutex::new(HandleState {
                status,
                cursor,
                current_interaction: None,
                last_snapshot: None,
            }),
            finished: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claims the right to drive this session. Fails with `SessionBusy` if
    /// an engine is already running it.
    pub fn begin_run(&self) -> Result<(), ExecutionError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ExecutionError::SessionBusy {
                session_id: self.session_id.to_string(),
            })
    }

    pub fn end_run(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> HandleState {
        self.lock_state().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    pub fn update(&self, apply: impl FnOnce(&mut HandleState)) {
        let mut state = self.lock_state();
        apply(&mut state);
        if state.status.is_terminal() {
            self.finished.notify_all();
        }
    }

    /// Waits until the session reaches a terminal status. Returns the last
    /// known status when `timeout` elapses first.
    pub fn wait_terminal(&self, timeout: Duration) -> SessionStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while !state.status.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.finished.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.status
    }

    pub fn attach_thread(&self, thread: JoinHandle<()>) {
        *self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(thread);
    }

    pub fn thread_alive(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Joins the engine thread if one was attached. Returns false if the
    /// thread panicked.
    pub fn join(&self) -> bool {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match thread {
            Some(thread) => thread.join().is_ok(),
            None => true,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("running", &self.is_running())
            .field("state", &self.state())
            .finish()
    }
}

/// Process-wide map from session id to its handle. The map lock covers only
/// insert, remove and lookup.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
    gateway: Arc<InteractionGateway>,
}

impl SessionRegistry {
    pub fn new(gateway: Arc<InteractionGateway>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            gateway,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionHandle>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a handle, replacing a stale one. A handle whose engine is
    /// still alive makes the session busy.
    pub fn register(&self, handle: Arc<SessionHandle>) -> Result<(), ExecutionError> {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(handle.session_id()) {
            if existing.is_running() || existing.thread_alive() {
                return Err(ExecutionError::SessionBusy {
                    session_id: handle.session_id().to_string(),
                });
            }
        }
        sessions.insert(handle.session_id().clone(), handle);
        Ok(())
    }

    pub fn lookup(&self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions().get(session_id).cloned()
    }

    /// Sets the session's cancellation flag, then unblocks any interaction
    /// wait it is parked in.
    pub fn cancel(&self, session_id: &SessionId) -> Result<(), ExecutionError> {
        let handle = self
            .lookup(session_id)
            .ok_or_else(|| ExecutionError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        handle.cancel.cancel();
        self.gateway.cancel_session(session_id);
        Ok(())
    }

    pub fn unregister(&self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions().remove(session_id)
    }

    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        let mut handles = self.sessions().values().cloned().collect::<Vec<_>>();
        handles.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        handles
    }

    pub fn cancel_all(&self) -> usize {
        let handles = self.list();
        let mut cancelled = 0;
        for handle in handles {
            if handle.status().is_terminal() {
                continue;
            }
            handle.cancel.cancel();
            self.gateway.cancel_session(handle.session_id());
            cancelled += 1;
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::store::FileSessionStore;
    use std::thread;

    fn registry(root: &std::path::Path) -> SessionRegistry {
        let store = Arc::new(FileSessionStore::new(root));
        SessionRegistry::new(Arc::new(InteractionGateway::new(store, root)))
    }

    fn handle(id: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(
            SessionId::parse(id).expect("id"),
            SessionStatus::Running,
            0,
        ))
    }

    #[test]
    fn register_lookup_cancel_unregister() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        let id = SessionId::parse("sess-a").expect("id");
        registry.register(handle("sess-a")).expect("register");

        let found = registry.lookup(&id).expect("registered");
        assert!(!found.is_cancelled());
        registry.cancel(&id).expect("cancel");
        assert!(found.is_cancelled());

        assert!(registry.unregister(&id).is_some());
        assert!(registry.lookup(&id).is_none());
        assert!(matches!(
            registry.cancel(&id),
            Err(ExecutionError::UnknownSession { .. })
        ));
    }

    #[test]
    fn running_handle_blocks_reregistration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        let first = handle("sess-b");
        registry.register(first.clone()).expect("register");
        first.begin_run().expect("claim");
        assert!(matches!(
            first.begin_run(),
            Err(ExecutionError::SessionBusy { .. })
        ));
        assert!(matches!(
            registry.register(handle("sess-b")),
            Err(ExecutionError::SessionBusy { .. })
        ));

        first.end_run();
        registry
            .register(handle("sess-b"))
            .expect("stale handle replaced");
    }

    #[test]
    fn wait_terminal_wakes_on_terminal_update() {
        let session = handle("sess-c");
        let waiter = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.wait_terminal(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        session.update(|state| state.cursor = 1);
        session.update(|state| state.status = SessionStatus::Completed);
        assert_eq!(waiter.join().expect("waiter"), SessionStatus::Completed);

        let idle = handle("sess-d");
        assert_eq!(
            idle.wait_terminal(Duration::from_millis(10)),
            SessionStatus::Running
        );
    }

    #[test]
    fn cancel_all_skips_finished_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());
        let live = handle("sess-e");
        let done = handle("sess-f");
        done.update(|state| state.status = SessionStatus::Failed);
        registry.register(live.clone()).expect("register");
        registry.register(done.clone()).expect("register");

        assert_eq!(registry.cancel_all(), 1);
        assert!(live.is_cancelled());
        assert!(!done.is_cancelled());
        assert_eq!(registry.list().len(), 2);
    }
}
