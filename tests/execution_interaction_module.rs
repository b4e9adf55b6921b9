use shellpilot::execution::{
    ContextSnapshot, ExecutionError, ExecutionSession, FileSessionStore, Interaction,
    InteractionGateway, InteractionKind, InteractionRequest, InteractionStatus, ProgressEvent,
    ProgressPublisher, SessionEvents, SessionPlan, SessionStore,
};
use shellpilot::execution::{ChannelPublisher, EventKind};
use shellpilot::shared::cancel::CancellationToken;
use shellpilot::shared::ids::{InteractionId, SessionId, StepId};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

fn gateway(root: &Path) -> (Arc<InteractionGateway>, Arc<FileSessionStore>) {
    let store = Arc::new(FileSessionStore::new(root));
    (
        Arc::new(InteractionGateway::new(store.clone(), root)),
        store,
    )
}

fn request(session: &str, kind: InteractionKind, timeout: Duration) -> InteractionRequest {
    InteractionRequest {
        session_id: SessionId::parse(session).expect("session id"),
        step_id: StepId::parse("confirm").expect("step id"),
        step_index: 0,
        prompt: "Continue?".to_string(),
        kind,
        timeout,
    }
}

fn events_for(session: &str) -> SessionEvents {
    SessionEvents::new(
        SessionId::parse(session).expect("session id"),
        Arc::new(ChannelPublisher::new()),
    )
}

#[test]
fn completing_twice_reports_already_completed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, store) = gateway(temp.path());
    let mut events = events_for("sess-a");
    let id = gateway
        .create_interaction(
            &request("sess-a", InteractionKind::TextInput, Duration::from_secs(5)),
            &mut events,
        )
        .expect("create");

    gateway.complete(&id, "first").expect("first response");
    let err = gateway.complete(&id, "second").expect_err("second response");
    assert!(matches!(err, ExecutionError::AlreadyCompleted { .. }));

    let answer = gateway
        .await_completion(&id, Duration::from_secs(1), &CancellationToken::new())
        .expect("answer");
    assert_eq!(answer, "first");
    let record = store
        .load_interaction(&id)
        .expect("load")
        .expect("record exists");
    assert_eq!(record.status, InteractionStatus::Completed);
    assert_eq!(record.response.as_deref(), Some("first"));
    assert!(record.responded_at.is_some());

    let unknown = InteractionId::parse("ia-unknown").expect("id");
    assert!(matches!(
        gateway.complete(&unknown, "x"),
        Err(ExecutionError::UnknownInteraction { .. })
    ));
}

#[test]
fn a_session_holds_at_most_one_pending_interaction() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, _) = gateway(temp.path());
    let mut events = events_for("sess-b");
    let first = gateway
        .create_interaction(
            &request("sess-b", InteractionKind::Confirmation, Duration::from_secs(5)),
            &mut events,
        )
        .expect("first");
    let err = gateway
        .create_interaction(
            &request("sess-b", InteractionKind::Confirmation, Duration::from_secs(5)),
            &mut events,
        )
        .expect_err("second pending");
    assert!(matches!(err, ExecutionError::InteractionPending { .. }));

    gateway.complete(&first, "yes").expect("complete");
    gateway
        .create_interaction(
            &request("sess-b", InteractionKind::Confirmation, Duration::from_secs(5)),
            &mut events,
        )
        .expect("new interaction after completion");
}

/// Checks the store from inside `publish`, so it sees exactly what a
/// subscriber reacting to INTERACTION_REQUEST would.
struct PersistedCheck {
    store: FileSessionStore,
    seen: Mutex<Vec<InteractionStatus>>,
}

impl ProgressPublisher for PersistedCheck {
    fn publish(&self, _session_id: &SessionId, event: &ProgressEvent) {
        if event.kind != EventKind::InteractionRequest {
            return;
        }
        let id = InteractionId::parse(event.payload["interactionId"].as_str().expect("id"))
            .expect("interaction id");
        let record = self
            .store
            .load_interaction(&id)
            .expect("load")
            .expect("persisted before publish");
        self.seen.lock().expect("seen lock").push(record.status);
    }
}

#[test]
fn request_is_persisted_before_it_is_published() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, _) = gateway(temp.path());
    let check = Arc::new(PersistedCheck {
        store: FileSessionStore::new(temp.path()),
        seen: Mutex::new(Vec::new()),
    });
    let mut events = SessionEvents::new(SessionId::parse("sess-c").expect("id"), check.clone());

    gateway
        .create_interaction(
            &request("sess-c", InteractionKind::Confirmation, Duration::from_secs(5)),
            &mut events,
        )
        .expect("create");
    assert_eq!(
        *check.seen.lock().expect("seen lock"),
        vec![InteractionStatus::Pending]
    );
}

#[test]
fn response_racing_the_timeout_settles_exactly_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, store) = gateway(temp.path());

    for round in 0..40 {
        let session = format!("sess-race-{round}");
        let mut events = events_for(&session);
        let timeout = Duration::from_millis(5);
        let id = gateway
            .create_interaction(
                &request(&session, InteractionKind::TextInput, timeout),
                &mut events,
            )
            .expect("create");

        let barrier = Arc::new(Barrier::new(2));
        let responder = {
            let gateway = Arc::clone(&gateway);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            thread::spawn(move || {
                barrier.wait();
                thread::sleep(Duration::from_millis(round % 10));
                gateway.complete(&id, "answer")
            })
        };
        barrier.wait();
        let waited = gateway.await_completion(&id, timeout, &CancellationToken::new());
        let completed = responder.join().expect("responder thread");

        let record = store
            .load_interaction(&id)
            .expect("load")
            .expect("record exists");
        match waited {
            Ok(answer) => {
                assert_eq!(answer, "answer");
                assert!(completed.is_ok(), "round {round}");
                assert_eq!(record.status, InteractionStatus::Completed);
            }
            Err(ExecutionError::InteractionTimeout { .. }) => {
                assert!(
                    matches!(completed, Err(ExecutionError::AlreadyCompleted { .. })),
                    "round {round}: {completed:?}"
                );
                assert_eq!(record.status, InteractionStatus::TimedOut);
            }
            Err(other) => panic!("round {round}: unexpected {other}"),
        }
    }
}

#[test]
fn cancelling_the_session_unblocks_the_waiter() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, store) = gateway(temp.path());
    let mut events = events_for("sess-d");
    let id = gateway
        .create_interaction(
            &request("sess-d", InteractionKind::Confirmation, Duration::from_secs(30)),
            &mut events,
        )
        .expect("create");
    let token = CancellationToken::new();

    let waiter = {
        let gateway = Arc::clone(&gateway);
        let token = token.clone();
        let id = id.clone();
        thread::spawn(move || gateway.await_completion(&id, Duration::from_secs(30), &token))
    };
    thread::sleep(Duration::from_millis(50));
    token.cancel();
    assert!(gateway.cancel_session(&SessionId::parse("sess-d").expect("id")));

    let result = waiter.join().expect("waiter thread");
    assert!(matches!(result, Err(ExecutionError::Cancelled { .. })));
    let record = store
        .load_interaction(&id)
        .expect("load")
        .expect("record exists");
    assert_eq!(record.status, InteractionStatus::TimedOut);
    assert_eq!(record.closed_reason.as_deref(), Some("session cancelled"));
    assert!(matches!(
        gateway.complete(&id, "late"),
        Err(ExecutionError::AlreadyCompleted { .. })
    ));
}

#[test]
fn orphaned_pending_records_are_expired_on_resume() {
    let temp = tempfile::tempdir().expect("tempdir");
    let session_id = SessionId::parse("sess-e").expect("id");
    let id = {
        let (crashed, _) = gateway(temp.path());
        let mut events = events_for("sess-e");
        crashed
            .create_interaction(
                &request("sess-e", InteractionKind::TextInput, Duration::from_secs(30)),
                &mut events,
            )
            .expect("create")
    };

    let (fresh, store) = gateway(temp.path());
    assert_eq!(
        fresh
            .expire_orphaned(&session_id, "superseded by resume")
            .expect("expire"),
        1
    );
    let record = store
        .load_interaction(&id)
        .expect("load")
        .expect("record exists");
    assert_eq!(record.status, InteractionStatus::TimedOut);
    assert_eq!(record.closed_reason.as_deref(), Some("superseded by resume"));
    assert!(matches!(
        fresh.complete(&id, "late"),
        Err(ExecutionError::AlreadyCompleted { .. })
    ));
    assert_eq!(fresh.expire_orphaned(&session_id, "again").expect("expire"), 0);
}

#[test]
fn password_responses_are_redacted_in_the_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, store) = gateway(temp.path());
    let mut events = events_for("sess-f");
    let id = gateway
        .create_interaction(
            &request("sess-f", InteractionKind::Password, Duration::from_secs(5)),
            &mut events,
        )
        .expect("create");

    gateway.complete(&id, "hunter2").expect("complete");
    let answer = gateway
        .await_completion(&id, Duration::from_secs(1), &CancellationToken::new())
        .expect("answer");
    assert_eq!(answer, "hunter2");
    let record = store
        .load_interaction(&id)
        .expect("load")
        .expect("record exists");
    assert_eq!(record.response.as_deref(), Some("***"));
}

/// File store whose interaction writes can be switched to fail.
struct FlakyStore {
    inner: FileSessionStore,
    fail_interactions: AtomicBool,
}

impl SessionStore for FlakyStore {
    fn save_session(&self, session: &ExecutionSession) -> Result<(), ExecutionError> {
        self.inner.save_session(session)
    }

    fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ExecutionSession>, ExecutionError> {
        self.inner.load_session(session_id)
    }

    fn list_sessions(&self) -> Result<Vec<ExecutionSession>, ExecutionError> {
        self.inner.list_sessions()
    }

    fn save_plan(&self, session_id: &SessionId, plan: &SessionPlan) -> Result<(), ExecutionError> {
        self.inner.save_plan(session_id, plan)
    }

    fn load_plan(&self, session_id: &SessionId) -> Result<Option<SessionPlan>, ExecutionError> {
        self.inner.load_plan(session_id)
    }

    fn save_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), ExecutionError> {
        self.inner.save_snapshot(snapshot)
    }

    fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ContextSnapshot>, ExecutionError> {
        self.inner.load_snapshot(session_id)
    }

    fn save_interaction(&self, interaction: &Interaction) -> Result<(), ExecutionError> {
        if self.fail_interactions.load(Ordering::SeqCst) {
            return Err(ExecutionError::Io {
                path: "interactions".to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.save_interaction(interaction)
    }

    fn load_interaction(
        &self,
        interaction_id: &InteractionId,
    ) -> Result<Option<Interaction>, ExecutionError> {
        self.inner.load_interaction(interaction_id)
    }

    fn list_interactions(&self, session_id: &SessionId) -> Result<Vec<Interaction>, ExecutionError> {
        self.inner.list_interactions(session_id)
    }
}

fn flaky_gateway(root: &Path) -> (Arc<InteractionGateway>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore {
        inner: FileSessionStore::new(root),
        fail_interactions: AtomicBool::new(false),
    });
    (
        Arc::new(InteractionGateway::new(store.clone(), root)),
        store,
    )
}

#[test]
fn unrecorded_response_leaves_the_interaction_pending() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, store) = flaky_gateway(temp.path());
    let session_id = SessionId::parse("sess-g").expect("id");
    let mut events = events_for("sess-g");
    let id = gateway
        .create_interaction(
            &request("sess-g", InteractionKind::TextInput, Duration::from_secs(5)),
            &mut events,
        )
        .expect("create");

    store.fail_interactions.store(true, Ordering::SeqCst);
    assert!(matches!(
        gateway.complete(&id, "lost"),
        Err(ExecutionError::Io { .. })
    ));
    let record = store.load_interaction(&id).expect("load").expect("record");
    assert_eq!(record.status, InteractionStatus::Pending);
    assert!(gateway.pending_for_session(&session_id).is_some());

    store.fail_interactions.store(false, Ordering::SeqCst);
    gateway.complete(&id, "kept").expect("retry");
    let answer = gateway
        .await_completion(&id, Duration::from_secs(1), &CancellationToken::new())
        .expect("answer");
    assert_eq!(answer, "kept");
    let record = store.load_interaction(&id).expect("load").expect("record");
    assert_eq!(record.status, InteractionStatus::Completed);
    assert_eq!(record.response.as_deref(), Some("kept"));
}

#[test]
fn unrecorded_response_does_not_wake_the_waiter() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, store) = flaky_gateway(temp.path());
    let mut events = events_for("sess-h");
    let id = gateway
        .create_interaction(
            &request("sess-h", InteractionKind::TextInput, Duration::from_millis(50)),
            &mut events,
        )
        .expect("create");

    store.fail_interactions.store(true, Ordering::SeqCst);
    assert!(gateway.complete(&id, "lost").is_err());
    store.fail_interactions.store(false, Ordering::SeqCst);

    let waited = gateway.await_completion(&id, Duration::from_millis(50), &CancellationToken::new());
    assert!(
        matches!(waited, Err(ExecutionError::InteractionTimeout { .. })),
        "{waited:?}"
    );
    let record = store.load_interaction(&id).expect("load").expect("record");
    assert_eq!(record.status, InteractionStatus::TimedOut);
    assert_eq!(record.response, None);
}

#[test]
fn response_before_the_waiter_attaches_is_delivered() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (gateway, _) = gateway(temp.path());
    let mut events = events_for("sess-i");
    let id = gateway
        .create_interaction(
            &request("sess-i", InteractionKind::Confirmation, Duration::from_secs(5)),
            &mut events,
        )
        .expect("create");

    gateway.complete(&id, "yes").expect("complete");
    assert!(gateway
        .pending_for_session(&SessionId::parse("sess-i").expect("id"))
        .is_none());
    let answer = gateway
        .await_completion(&id, Duration::from_secs(1), &CancellationToken::new())
        .expect("answer delivered");
    assert_eq!(answer, "yes");
    assert!(matches!(
        gateway.await_completion(&id, Duration::from_millis(10), &CancellationToken::new()),
        Err(ExecutionError::UnknownInteraction { .. })
    ));
}
