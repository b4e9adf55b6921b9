use crate::config::{Settings, SshSettings, StoreKind};
use crate::execution::context::{ExecutionContext, RemoteConnection, VarScope};
use crate::execution::engine::{EngineSettings, ExecutionEngine, SessionRun};
use crate::execution::error::ExecutionError;
use crate::execution::events::{FanoutPublisher, JsonlPublisher, ProgressPublisher, SessionEvents};
use crate::execution::interaction::{Interaction, InteractionGateway, SUPERSEDED_REASON};
use crate::execution::registry::{SessionHandle, SessionRegistry};
use crate::execution::session::{ExecutionSession, SessionStatus};
use crate::execution::step::{compile_steps, plan_digest, SessionPlan};
use crate::execution::store::{FileSessionStore, SessionStore, SqliteSessionStore};
use crate::remote::{self, RemoteCommandRunner};
use crate::shared::ids::{InteractionId, SessionId};
use crate::shared::logging::{append_engine_log, LogLevel};
use crate::shared::time::now_millis;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const SQLITE_DB_FILE_NAME: &str = "shellpilot.db";

/// Options for a new session. `start_at` lets a new session pick up where
/// an earlier run of the same plan stopped; it is honoured only when
/// `plan_digest` matches the plan being started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    pub start_at: Option<usize>,
    pub plan_digest: Option<String>,
    pub session_vars: BTreeMap<String, Value>,
}

/// Public face of the engine: starts sessions on their own threads and
/// routes control calls (cancel, respond, status) to them.
pub struct ExecutionService {
    state_root: PathBuf,
    store: Arc<dyn SessionStore>,
    gateway: Arc<InteractionGateway>,
    registry: Arc<SessionRegistry>,
    engine: Arc<ExecutionEngine>,
    publisher: Arc<dyn ProgressPublisher>,
    global_vars: Arc<BTreeMap<String, Value>>,
    ssh: SshSettings,
}

impl ExecutionService {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn SessionStore>,
        publisher: Arc<dyn ProgressPublisher>,
        global_vars: BTreeMap<String, Value>,
    ) -> Self {
        let state_root = settings.state_root.clone();
        let gateway = Arc::new(InteractionGateway::new(store.clone(), state_root.clone()));
        let registry = Arc::new(SessionRegistry::new(gateway.clone()));
        let engine = Arc::new(ExecutionEngine::new(settings, store.clone(), gateway.clone()));
        Self {
            state_root,
            store,
            gateway,
            registry,
            engine,
            publisher,
            global_vars: Arc::new(global_vars),
            ssh: SshSettings::default(),
        }
    }

    pub fn with_ssh_settings(mut self, ssh: SshSettings) -> Self {
        self.ssh = ssh;
        self
    }

    /// Builds the store named by the settings and tees events into the
    /// per-session JSONL log alongside `publisher`.
    pub fn from_settings(
        settings: &Settings,
        publisher: Arc<dyn ProgressPublisher>,
    ) -> Result<Self, ExecutionError> {
        settings.validate()?;
        let state_root = settings.resolve_state_root()?;
        let store = open_store(settings.store, &state_root)?;
        let fanout: Arc<dyn ProgressPublisher> = Arc::new(
            FanoutPublisher::default()
                .with(Arc::new(JsonlPublisher::new(state_root.clone())))
                .with(publisher),
        );
        Ok(Self::new(
            EngineSettings::from_settings(settings, state_root),
            store,
            fanout,
            settings.global_vars.clone(),
        )
        .with_ssh_settings(settings.ssh.clone()))
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<InteractionGateway> {
        &self.gateway
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Validates the plan, persists the new session and starts its engine
    /// thread. Nothing runs remotely if validation fails.
    pub fn start_session(
        &self,
        plan: &SessionPlan,
        runner: Box<dyn RemoteCommandRunner>,
        options: StartOptions,
    ) -> Result<SessionId, ExecutionError> {
        let steps = compile_steps(&plan.steps)?;
        plan.connection
            .validate()
            .map_err(|reason| ExecutionError::Config(format!("connection: {reason}")))?;
        let digest = plan_digest(&plan.steps)?;
        if let Some(start_at) = options.start_at {
            let claimed = options.plan_digest.as_deref().unwrap_or("<none>");
            if claimed != digest {
                return Err(ExecutionError::PlanMismatch {
                    expected: digest,
                    actual: claimed.to_string(),
                });
            }
            if start_at >= steps.len() {
                return Err(ExecutionError::InvalidStepList(format!(
                    "start_at {start_at} is past the last step ({})",
                    steps.len() - 1
                )));
            }
        }

        let now = now_millis();
        let session_id = SessionId::generate(now).map_err(ExecutionError::IdAllocation)?;
        let mut context = ExecutionContext::new(
            session_id.clone(),
            RemoteConnection {
                descriptor: plan.connection.clone(),
                runner,
            },
            self.global_vars.clone(),
        );
        for (name, value) in options.session_vars {
            context.set(VarScope::Session, &name, value)?;
        }
        if let Some(start_at) = options.start_at {
            context.start_at(start_at);
        }

        let mut session = ExecutionSession::new(
            session_id.clone(),
            plan.name.clone(),
            steps.len(),
            digest,
            plan.connection.clone(),
            now,
        );
        session.cursor = context.cursor();
        self.store.save_plan(&session_id, plan)?;
        self.store.save_session(&session)?;
        self.store.save_snapshot(&context.snapshot(now))?;

        let handle = Arc::new(SessionHandle::new(
            session_id.clone(),
            SessionStatus::Running,
            session.cursor,
        ));
        self.registry.register(handle.clone())?;

        let mut events = SessionEvents::new(session_id.clone(), self.publisher.clone());
        events.log(
            "session_started",
            format!("plan `{}` with {} steps", plan.name, steps.len()),
        );
        append_engine_log(
            &self.state_root,
            LogLevel::Info,
            "session.started",
            Some(session_id.as_str()),
            &format!(
                "plan `{}` on {} starting at step {}",
                plan.name,
                plan.connection.target(),
                session.cursor
            ),
        );

        self.spawn(SessionRun {
            session,
            steps,
            context,
            events,
            handle,
        })?;
        Ok(session_id)
    }

    /// Continues a non-terminal session from its last snapshot, typically in
    /// a new process after a crash. Interactions the dead process left
    /// pending are closed first; the interactive step is then asked again.
    pub fn resume(
        &self,
        session_id: &SessionId,
        runner: Box<dyn RemoteCommandRunner>,
    ) -> Result<(), ExecutionError> {
        if let Some(existing) = self.registry.lookup(session_id) {
            if existing.is_running() || existing.thread_alive() {
                return Err(ExecutionError::SessionBusy {
                    session_id: session_id.to_string(),
                });
            }
        }
        let mut session = self.load_session(session_id)?;
        if session.status.is_terminal() {
            return Err(ExecutionError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Running,
            });
        }
        let plan = self
            .store
            .load_plan(session_id)?
            .ok_or_else(|| ExecutionError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let steps = compile_steps(&plan.steps)?;
        let digest = plan_digest(&plan.steps)?;
        if digest != session.plan_digest {
            return Err(ExecutionError::PlanMismatch {
                expected: session.plan_digest.clone(),
                actual: digest,
            });
        }

        let mut context = ExecutionContext::new(
            session_id.clone(),
            RemoteConnection {
                descriptor: plan.connection.clone(),
                runner,
            },
            self.global_vars.clone(),
        );
        match self.store.load_snapshot(session_id)? {
            Some(snapshot) => context.restore(snapshot)?,
            None => context.start_at(session.cursor),
        }

        let expired = self.gateway.expire_orphaned(session_id, SUPERSEDED_REASON)?;
        let now = now_millis();
        if session.status == SessionStatus::WaitingInput {
            session.transition(SessionStatus::Running, now, None)?;
        }
        session.current_interaction = None;
        session.cursor = context.cursor();
        session.last_completed_step = context.last_completed_step();
        session.updated_at = now;
        self.store.save_session(&session)?;

        let handle = Arc::new(SessionHandle::new(
            session_id.clone(),
            SessionStatus::Running,
            session.cursor,
        ));
        self.registry.register(handle.clone())?;

        let mut events = SessionEvents::new(session_id.clone(), self.publisher.clone());
        events.log(
            "session_resumed",
            format!(
                "resuming at step {} ({expired} stale interactions closed)",
                session.cursor
            ),
        );
        append_engine_log(
            &self.state_root,
            LogLevel::Info,
            "session.resumed",
            Some(session_id.as_str()),
            &format!("cursor={} expired_interactions={expired}", session.cursor),
        );

        self.spawn(SessionRun {
            session,
            steps,
            context,
            events,
            handle,
        })
    }

    /// Resumes using a runner opened from the session's stored connection.
    pub fn resume_connected(&self, session_id: &SessionId) -> Result<(), ExecutionError> {
        let plan = self
            .store
            .load_plan(session_id)?
            .ok_or_else(|| ExecutionError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let runner = remote::connect(&plan.connection, &self.ssh)
            .map_err(|err| ExecutionError::Config(err.to_string()))?;
        self.resume(session_id, runner)
    }

    fn spawn(&self, run: SessionRun) -> Result<(), ExecutionError> {
        let engine = Arc::clone(&self.engine);
        let handle = Arc::clone(&run.handle);
        let state_root = self.state_root.clone();
        let name = format!("session-{}", run.session.session_id);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut run = run;
                if let Err(err) = engine.run(&mut run) {
                    append_engine_log(
                        &state_root,
                        LogLevel::Error,
                        "session.engine_error",
                        Some(run.session.session_id.as_str()),
                        &err.to_string(),
                    );
                }
            })
            .map_err(|source| ExecutionError::Io {
                path: "<session thread>".to_string(),
                source,
            })?;
        handle.attach_thread(thread);
        Ok(())
    }

    pub fn cancel(&self, session_id: &SessionId) -> Result<(), ExecutionError> {
        self.registry.cancel(session_id)?;
        append_engine_log(
            &self.state_root,
            LogLevel::Warn,
            "session.cancel_requested",
            Some(session_id.as_str()),
            "cancellation requested",
        );
        Ok(())
    }

    pub fn status(&self, session_id: &SessionId) -> Result<ExecutionSession, ExecutionError> {
        self.load_session(session_id)
    }

    pub fn respond(
        &self,
        interaction_id: &InteractionId,
        response: &str,
    ) -> Result<(), ExecutionError> {
        self.gateway.complete(interaction_id, response)
    }

    pub fn pending_interaction(&self, session_id: &SessionId) -> Option<Interaction> {
        self.gateway.pending_for_session(session_id)
    }

    pub fn interactions(&self, session_id: &SessionId) -> Result<Vec<Interaction>, ExecutionError> {
        self.gateway.list_for_session(session_id)
    }

    pub fn list_sessions(&self) -> Result<Vec<ExecutionSession>, ExecutionError> {
        self.store.list_sessions()
    }

    /// Blocks until the session reaches a terminal status or `timeout`
    /// elapses, and returns the status observed last.
    pub fn wait(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<SessionStatus, ExecutionError> {
        match self.registry.lookup(session_id) {
            Some(handle) => Ok(handle.wait_terminal(timeout)),
            None => Ok(self.load_session(session_id)?.status),
        }
    }

    /// Joins the session's engine thread and drops its registry entry.
    /// Returns false if the thread panicked.
    pub fn join(&self, session_id: &SessionId) -> Result<bool, ExecutionError> {
        let handle =
            self.registry
                .lookup(session_id)
                .ok_or_else(|| ExecutionError::UnknownSession {
                    session_id: session_id.to_string(),
                })?;
        let clean = handle.join();
        self.registry.unregister(session_id);
        Ok(clean)
    }

    /// Non-terminal sessions in the store that no engine in this process is
    /// driving.
    pub fn recoverable_sessions(&self) -> Result<Vec<ExecutionSession>, ExecutionError> {
        Ok(self
            .store
            .list_sessions()?
            .into_iter()
            .filter(|session| !session.status.is_terminal())
            .filter(|session| match self.registry.lookup(&session.session_id) {
                Some(handle) => !handle.is_running() && !handle.thread_alive(),
                None => true,
            })
            .collect())
    }

    /// Cancels every live session and joins their threads.
    pub fn shutdown(&self) {
        let cancelled = self.registry.cancel_all();
        for handle in self.registry.list() {
            handle.join();
            self.registry.unregister(handle.session_id());
        }
        append_engine_log(
            &self.state_root,
            LogLevel::Info,
            "service.shutdown",
            None,
            &format!("cancelled {cancelled} live sessions"),
        );
    }

    fn load_session(&self, session_id: &SessionId) -> Result<ExecutionSession, ExecutionError> {
        self.store
            .load_session(session_id)?
            .ok_or_else(|| ExecutionError::UnknownSession {
                session_id: session_id.to_string(),
            })
    }
}

pub fn open_store(
    kind: StoreKind,
    state_root: &Path,
) -> Result<Arc<dyn SessionStore>, ExecutionError> {
    Ok(match kind {
        StoreKind::File => Arc::new(FileSessionStore::new(state_root)),
        StoreKind::Sqlite => Arc::new(SqliteSessionStore::open(
            &state_root.join(SQLITE_DB_FILE_NAME),
        )?),
    })
}
