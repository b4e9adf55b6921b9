use crate::shared::ids::SessionId;
use crate::shared::logging::{append_engine_log, LogLevel};
use crate::shared::time::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Log,
    StepStart,
    StepDone,
    InteractionRequest,
    SessionDone,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::StepStart => "STEP_START",
            Self::StepDone => "STEP_DONE",
            Self::InteractionRequest => "INTERACTION_REQUEST",
            Self::SessionDone => "SESSION_DONE",
        }
    }
}

/// `sequence` increases by one per event within a single engine run of a
/// session, so subscribers can detect gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub session_id: SessionId,
    pub sequence: u64,
    pub timestamp: i64,
    pub kind: EventKind,
    pub payload: Value,
}

/// Outbound side of the session topic. Publishing is fire-and-forget for the
/// engine; implementations must deliver one session's events in call order.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, session_id: &SessionId, event: &ProgressEvent);
}

/// Stamps events for one session with timestamps and a running sequence.
pub struct SessionEvents {
    session_id: SessionId,
    publisher: Arc<dyn ProgressPublisher>,
    next_sequence: u64,
}

impl SessionEvents {
    pub fn new(session_id: SessionId, publisher: Arc<dyn ProgressPublisher>) -> Self {
        Self {
            session_id,
            publisher,
            next_sequence: 0,
        }
    }

    pub fn emit(&mut self, kind: EventKind, payload: Value) {
        let event = ProgressEvent {
            session_id: self.session_id.clone(),
            sequence: self.next_sequence,
            timestamp: now_millis(),
            kind,
            payload,
        };
        self.next_sequence += 1;
        self.publisher.publish(&self.session_id, &event);
    }

    pub fn log(&mut self, event: &str, message: impl Into<String>) {
        self.emit(
            EventKind::Log,
            serde_json::json!({ "event": event, "message": message.into() }),
        );
    }
}

struct Subscriber {
    filter: Option<SessionId>,
    sender: Sender<ProgressEvent>,
}

/// In-process pub/sub. Each subscriber gets its own channel; a subscriber
/// whose receiver was dropped is pruned on the next publish.
#[derive(Default)]
pub struct ChannelPublisher {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChannelPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to one session's topic, or to every session with `None`.
    pub fn subscribe(&self, filter: Option<SessionId>) -> Receiver<ProgressEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscriber { filter, sender });
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl ProgressPublisher for ChannelPublisher {
    fn publish(&self, session_id: &SessionId, event: &ProgressEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|subscriber| {
            if subscriber
                .filter
                .as_ref()
                .is_some_and(|filter| filter != session_id)
            {
                return true;
            }
            subscriber.sender.send(event.clone()).is_ok()
        });
    }
}

/// Appends every event to `<state_root>/sessions/<id>/events.jsonl`.
pub struct JsonlPublisher {
    state_root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPublisher {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn events_path(&self, session_id: &SessionId) -> PathBuf {
        session_events_path(&self.state_root, session_id)
    }

    fn append(&self, path: &Path, line: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")
    }
}

pub fn session_events_path(state_root: &Path, session_id: &SessionId) -> PathBuf {
    state_root
        .join("sessions")
        .join(session_id.as_str())
        .join("events.jsonl")
}

impl ProgressPublisher for JsonlPublisher {
    fn publish(&self, session_id: &SessionId, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                append_engine_log(
                    &self.state_root,
                    LogLevel::Warn,
                    "events.encode_failed",
                    Some(session_id.as_str()),
                    &err.to_string(),
                );
                return;
            }
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = self.append(&self.events_path(session_id), &line) {
            append_engine_log(
                &self.state_root,
                LogLevel::Warn,
                "events.append_failed",
                Some(session_id.as_str()),
                &err.to_string(),
            );
        }
    }
}

/// Delivers each event to every inner publisher, in registration order.
#[derive(Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn ProgressPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn ProgressPublisher>>) -> Self {
        Self { publishers }
    }

    pub fn with(mut self, publisher: Arc<dyn ProgressPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl ProgressPublisher for FanoutPublisher {
    fn publish(&self, session_id: &SessionId, event: &ProgressEvent) {
        for publisher in &self.publishers {
            publisher.publish(session_id, event);
        }
    }
}

pub fn read_session_events(
    state_root: &Path,
    session_id: &SessionId,
) -> std::io::Result<Vec<ProgressEvent>> {
    let path = session_events_path(state_root, session_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(std::io::Error::other))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).expect("session id")
    }

    #[test]
    fn channel_publisher_filters_by_session_and_keeps_order() {
        let publisher = Arc::new(ChannelPublisher::new());
        let only_a = publisher.subscribe(Some(id("sess-a")));
        let all = publisher.subscribe(None);

        let mut a = SessionEvents::new(id("sess-a"), publisher.clone());
        let mut b = SessionEvents::new(id("sess-b"), publisher.clone());
        a.log("one", "a1");
        b.log("one", "b1");
        a.emit(EventKind::StepStart, serde_json::json!({"index": 0}));

        let seen_a = only_a.try_iter().collect::<Vec<_>>();
        assert_eq!(seen_a.len(), 2);
        assert_eq!(seen_a[0].sequence, 0);
        assert_eq!(seen_a[1].sequence, 1);
        assert_eq!(seen_a[1].kind, EventKind::StepStart);
        assert_eq!(all.try_iter().count(), 3);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let publisher = Arc::new(ChannelPublisher::new());
        let receiver = publisher.subscribe(None);
        drop(receiver);
        let mut events = SessionEvents::new(id("sess-a"), publisher.clone());
        events.log("x", "y");
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn jsonl_publisher_appends_per_session_file() {
        let dir = tempdir().expect("tempdir");
        let jsonl: Arc<dyn ProgressPublisher> = Arc::new(JsonlPublisher::new(dir.path()));
        let channel = Arc::new(ChannelPublisher::new());
        let receiver = channel.subscribe(None);
        let fanout: Arc<dyn ProgressPublisher> =
            Arc::new(FanoutPublisher::new(vec![jsonl]).with(channel));

        let mut events = SessionEvents::new(id("sess-a"), fanout);
        events.log("session_started", "go");
        events.emit(EventKind::SessionDone, serde_json::json!({"status": "COMPLETED"}));

        let stored = read_session_events(dir.path(), &id("sess-a")).expect("read events");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].kind, EventKind::SessionDone);
        assert_eq!(receiver.try_iter().count(), 2);
        assert!(read_session_events(dir.path(), &id("sess-none"))
            .expect("missing")
            .is_empty());
    }
}
