use crate::execution::error::ExecutionError;
use crate::execution::events::{EventKind, SessionEvents};
use crate::execution::step::InteractionKind;
use crate::execution::store::SessionStore;
use crate::shared::cancel::CancellationToken;
use crate::shared::ids::{InteractionId, SessionId, StepId};
use crate::shared::logging::{append_engine_log, LogLevel};
use crate::shared::time::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const REDACTED_RESPONSE: &str = "***";
pub const SUPERSEDED_REASON: &str = "superseded by resume";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionStatus {
    Pending,
    Completed,
    TimedOut,
}

impl InteractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub interaction_id: InteractionId,
    pub session_id: SessionId,
    pub step_id: StepId,
    pub prompt: String,
    pub kind: InteractionKind,
    pub status: InteractionStatus,
    #[serde(default)]
    pub response: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub responded_at: Option<i64>,
    pub expires_at: i64,
    #[serde(default)]
    pub closed_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InteractionRequest {
    pub session_id: SessionId,
    pub step_id: StepId,
    pub step_index: usize,
    pub prompt: String,
    pub kind: InteractionKind,
    pub timeout: Duration,
}

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(20);

enum Signal {
    Completed(String),
    Cancelled,
}

/// Live half of a pending interaction. `state` is the single arbiter of
/// which terminal transition wins; the channel carries the outcome to the
/// one waiting engine thread.
struct Slot {
    state: AtomicU8,
    sender: SyncSender<Signal>,
    receiver: Mutex<Option<Receiver<Signal>>>,
    record: Mutex<Interaction>,
}

impl Slot {
    fn claim(&self, next: u8) -> bool {
        self.state
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Default)]
struct Live {
    slots: HashMap<InteractionId, Arc<Slot>>,
    pending_by_session: HashMap<SessionId, InteractionId>,
}

/// Bridges "engine wants input" and "a response arrived from outside".
///
/// Records are persisted through the store before anything is announced.
/// `complete`, the waiter's timeout and session cancellation race through a
/// compare-and-set on the slot state, so exactly one terminal status is ever
/// recorded. The live-map lock is never held across store I/O or waits.
pub struct InteractionGateway {
    store: Arc<dyn SessionStore>,
    state_root: PathBuf,
    live: Mutex<Live>,
}

impl InteractionGateway {
    pub fn new(store: Arc<dyn SessionStore>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            state_root: state_root.into(),
            live: Mutex::new(Live::default()),
        }
    }

    fn live(&self) -> MutexGuard<'_, Live> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persists a PENDING record, then publishes INTERACTION_REQUEST on the
    /// session topic. A session may hold only one pending interaction.
    pub fn create_interaction(
        &self,
        request: &InteractionRequest,
        events: &mut SessionEvents,
    ) -> Result<InteractionId, ExecutionError> {
        let now = now_millis();
        let interaction_id =
            InteractionId::generate(now).map_err(ExecutionError::IdAllocation)?;

        {
            let mut live = self.live();
            if let Some(existing) = live.pending_by_session.get(&request.session_id) {
                return Err(ExecutionError::InteractionPending {
                    session_id: request.session_id.to_string(),
                    interaction_id: existing.to_string(),
                });
            }
            live.pending_by_session
                .insert(request.session_id.clone(), interaction_id.clone());
        }

        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
        let record = Interaction {
            interaction_id: interaction_id.clone(),
            session_id: request.session_id.clone(),
            step_id: request.step_id.clone(),
            prompt: request.prompt.clone(),
            kind: request.kind,
            status: InteractionStatus::Pending,
            response: None,
            created_at: now,
            responded_at: None,
            expires_at: now.saturating_add(i64::try_from(timeout_ms).unwrap_or(i64::MAX)),
            closed_reason: None,
        };

        if let Err(err) = self.store.save_interaction(&record) {
            self.live().pending_by_session.remove(&request.session_id);
            return Err(err);
        }

        let (sender, receiver) = sync_channel(1);
        let slot = Arc::new(Slot {
            state: AtomicU8::new(PENDING),
            sender,
            receiver: Mutex::new(Some(receiver)),
            record: Mutex::new(record.clone()),
        });
        self.live().slots.insert(interaction_id.clone(), slot);

        append_engine_log(
            &self.state_root,
            LogLevel::Info,
            "interaction.created",
            Some(request.session_id.as_str()),
            &format!(
                "interaction {} ({}) for step {}",
                interaction_id, request.kind, request.step_id
            ),
        );
        events.emit(
            EventKind::InteractionRequest,
            serde_json::json!({
                "interactionId": interaction_id.as_str(),
                "stepId": request.step_id.as_str(),
                "stepIndex": request.step_index,
                "prompt": request.prompt,
                "kind": request.kind.as_str(),
                "expiresAt": record.expires_at,
            }),
        );
        Ok(interaction_id)
    }

    /// Records the first response for a pending interaction and wakes its
    /// waiter. Any later attempt fails with `AlreadyCompleted`.
    pub fn complete(
        &self,
        interaction_id: &InteractionId,
        response: &str,
    ) -> Result<(), ExecutionError> {
        let slot = self.live().slots.get(interaction_id).cloned();
        let Some(slot) = slot else {
            return match self.store.load_interaction(interaction_id)? {
                Some(record) if record.status.is_terminal() => {
                    Err(ExecutionError::AlreadyCompleted {
                        interaction_id: interaction_id.to_string(),
                    })
                }
                _ => Err(ExecutionError::UnknownInteraction {
                    interaction_id: interaction_id.to_string(),
                }),
            };
        };

        if !slot.claim(COMPLETED) {
            return Err(ExecutionError::AlreadyCompleted {
                interaction_id: interaction_id.to_string(),
            });
        }

        let mut record = slot
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        record.status = InteractionStatus::Completed;
        record.responded_at = Some(now_millis());
        record.response = Some(if record.kind == InteractionKind::Password {
            REDACTED_RESPONSE.to_string()
        } else {
            response.to_string()
        });

        // The durable record must say COMPLETED before the waiter acts on the
        // response; on failure the slot goes back to PENDING.
        if let Err(err) = self.store.save_interaction(&record) {
            slot.state.store(PENDING, Ordering::Release);
            append_engine_log(
                &self.state_root,
                LogLevel::Error,
                "interaction.persist_failed",
                Some(record.session_id.as_str()),
                &format!("interaction {interaction_id} response not recorded: {err}"),
            );
            return Err(err);
        }
        *slot
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = record.clone();
        self.release(&slot, &record);
        let _ = slot.sender.try_send(Signal::Completed(response.to_string()));

        append_engine_log(
            &self.state_root,
            LogLevel::Info,
            "interaction.completed",
            Some(record.session_id.as_str()),
            &format!("interaction {interaction_id} completed"),
        );
        Ok(())
    }

    /// Blocks the calling session thread until the interaction is answered,
    /// the timeout fires or the session is cancelled.
    pub fn await_completion(
        &self,
        interaction_id: &InteractionId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        let slot = self
            .live()
            .slots
            .get(interaction_id)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownInteraction {
                interaction_id: interaction_id.to_string(),
            })?;
        let receiver = slot
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| ExecutionError::UnknownInteraction {
                interaction_id: interaction_id.to_string(),
            })?;

        let outcome = self.wait_for_signal(&slot, &receiver, interaction_id, timeout, cancel);
        self.live().slots.remove(interaction_id);
        outcome
    }

    fn wait_for_signal(
        &self,
        slot: &Slot,
        receiver: &Receiver<Signal>,
        interaction_id: &InteractionId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        if cancel.is_cancelled() {
            self.close(slot, "session cancelled", Some(Signal::Cancelled));
        }

        let signal = match receiver.recv_timeout(timeout) {
            Ok(signal) => signal,
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                let reason = format!("no response within {timeout_ms}ms");
                loop {
                    if self.close(slot, &reason, None) {
                        return Err(ExecutionError::InteractionTimeout {
                            interaction_id: interaction_id.to_string(),
                            timeout_ms,
                        });
                    }
                    // A response holds the claim: it either lands on the
                    // channel or is rolled back to PENDING.
                    match receiver.recv_timeout(CLAIM_POLL_INTERVAL) {
                        Ok(signal) => break signal,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break Signal::Cancelled,
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => Signal::Cancelled,
        };

        match signal {
            Signal::Completed(response) => Ok(response),
            Signal::Cancelled => Err(ExecutionError::Cancelled {
                interaction_id: interaction_id.to_string(),
            }),
        }
    }

    /// Closes the session's pending interaction, if any, and wakes its waiter
    /// with `Cancelled`. Returns whether an interaction was closed.
    pub fn cancel_session(&self, session_id: &SessionId) -> bool {
        let slot = {
            let live = self.live();
            live.pending_by_session
                .get(session_id)
                .and_then(|id| live.slots.get(id))
                .cloned()
        };
        match slot {
            Some(slot) => self.close(&slot, "session cancelled", Some(Signal::Cancelled)),
            None => false,
        }
    }

    /// Marks PENDING records with no live waiter as TIMED_OUT. Used when a
    /// session is resumed by a new process.
    pub fn expire_orphaned(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<usize, ExecutionError> {
        let mut expired = 0;
        for mut record in self.store.list_interactions(session_id)? {
            if record.status != InteractionStatus::Pending
                || self.live().slots.contains_key(&record.interaction_id)
            {
                continue;
            }
            record.status = InteractionStatus::TimedOut;
            record.closed_reason = Some(reason.to_string());
            self.store.save_interaction(&record)?;
            expired += 1;
            append_engine_log(
                &self.state_root,
                LogLevel::Warn,
                "interaction.orphaned",
                Some(session_id.as_str()),
                &format!("interaction {} closed: {reason}", record.interaction_id),
            );
        }
        Ok(expired)
    }

    pub fn pending_for_session(&self, session_id: &SessionId) -> Option<Interaction> {
        let slot = {
            let live = self.live();
            live.pending_by_session
                .get(session_id)
                .and_then(|id| live.slots.get(id))
                .cloned()
        }?;
        let record = slot
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Some(record)
    }

    pub fn get(&self, interaction_id: &InteractionId) -> Result<Option<Interaction>, ExecutionError> {
        self.store.load_interaction(interaction_id)
    }

    pub fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Interaction>, ExecutionError> {
        self.store.list_interactions(session_id)
    }

    /// Tries to move the slot to TIMED_OUT. On success persists the closed
    /// record, drops the live entry and sends `signal` if given.
    fn close(&self, slot: &Slot, reason: &str, signal: Option<Signal>) -> bool {
        if !slot.claim(TIMED_OUT) {
            return false;
        }
        let record = {
            let mut record = slot
                .record
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            record.status = InteractionStatus::TimedOut;
            record.closed_reason = Some(reason.to_string());
            record.clone()
        };
        if let Err(err) = self.store.save_interaction(&record) {
            append_engine_log(
                &self.state_root,
                LogLevel::Error,
                "interaction.persist_failed",
                Some(record.session_id.as_str()),
                &err.to_string(),
            );
        }
        self.release(slot, &record);
        if let Some(signal) = signal {
            let _ = slot.sender.try_send(signal);
        }
        append_engine_log(
            &self.state_root,
            LogLevel::Warn,
            "interaction.closed",
            Some(record.session_id.as_str()),
            &format!("interaction {} closed: {reason}", record.interaction_id),
        );
        true
    }

    /// Drops the session's pending marker. The slot itself stays in the live
    /// map until a waiter has taken its receiver, so a response that lands
    /// before `await_completion` is still delivered.
    fn release(&self, slot: &Slot, record: &Interaction) {
        let waiter_attached = slot
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none();
        let mut live = self.live();
        if waiter_attached {
            live.slots.remove(&record.interaction_id);
        }
        if live.pending_by_session.get(&record.session_id) == Some(&record.interaction_id) {
            live.pending_by_session.remove(&record.session_id);
        }
    }
}
