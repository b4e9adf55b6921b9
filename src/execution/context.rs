use crate::execution::error::ExecutionError;
use crate::execution::predicate::{value_text, VarLookup};
use crate::execution::template::is_valid_var_name;
use crate::remote::{ConnectionDescriptor, RemoteCommandRunner};
use crate::shared::ids::SessionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarScope {
    Script,
    Session,
    Global,
}

impl std::fmt::Display for VarScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script => write!(f, "script"),
            Self::Session => write!(f, "session"),
            Self::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub steps_started: u32,
    pub steps_succeeded: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
    pub commands_run: u32,
    pub command_millis: u64,
    pub interactions_answered: u32,
}

/// Durable part of a context: everything needed to resume after the last
/// completed step. Script-scope values, and with them any password, never
/// appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub session_id: SessionId,
    pub cursor: usize,
    #[serde(default)]
    pub last_completed_step: Option<usize>,
    #[serde(default)]
    pub session_vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    pub taken_at: i64,
}

/// The remote connection a context owns for the life of its session.
pub struct RemoteConnection {
    pub descriptor: ConnectionDescriptor,
    pub runner: Box<dyn RemoteCommandRunner>,
}

/// Per-session mutable state. One instance per session, created fresh at
/// session start (or restored from a snapshot) and never shared.
pub struct ExecutionContext {
    session_id: SessionId,
    script_vars: BTreeMap<String, Value>,
    session_vars: BTreeMap<String, Value>,
    global_vars: Arc<BTreeMap<String, Value>>,
    secret_names: BTreeSet<String>,
    connection: RemoteConnection,
    cursor: usize,
    last_completed_step: Option<usize>,
    metrics: ExecutionMetrics,
}

impl ExecutionContext {
    pub fn new(
        session_id: SessionId,
        connection: RemoteConnection,
        global_vars: Arc<BTreeMap<String, Value>>,
    ) -> Self {
        Self {
            session_id,
            script_vars: BTreeMap::new(),
            session_vars: BTreeMap::new(),
            global_vars,
            secret_names: BTreeSet::new(),
            connection,
            cursor: 0,
            last_completed_step: None,
            metrics: ExecutionMetrics::default(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Typed read with script > session > global precedence. A stored value
    /// that does not deserialize into `T` is reported as `TypeMismatch`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ExecutionError> {
        let Some(value) = self.get_value(name) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|_| ExecutionError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>().to_string(),
            })
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.script_vars
            .get(name)
            .or_else(|| self.session_vars.get(name))
            .or_else(|| self.global_vars.get(name))
    }

    /// Text form used by command templates: strings verbatim, other values
    /// as JSON.
    pub fn get_text(&self, name: &str) -> Option<String> {
        self.get_value(name).map(value_text)
    }

    pub fn scope_of(&self, name: &str) -> Option<VarScope> {
        if self.script_vars.contains_key(name) {
            Some(VarScope::Script)
        } else if self.session_vars.contains_key(name) {
            Some(VarScope::Session)
        } else if self.global_vars.contains_key(name) {
            Some(VarScope::Global)
        } else {
            None
        }
    }

    /// Writes always name their scope; the global scope is read-only.
    pub fn set(
        &mut self,
        scope: VarScope,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), ExecutionError> {
        if !is_valid_var_name(name) {
            return Err(ExecutionError::InvalidVariableName {
                name: name.to_string(),
            });
        }
        match scope {
            VarScope::Script => {
                self.script_vars.insert(name.to_string(), value.into());
            }
            VarScope::Session => {
                self.session_vars.insert(name.to_string(), value.into());
            }
            VarScope::Global => {
                return Err(ExecutionError::ReadOnlyScope {
                    name: name.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Stores a secret in script scope and marks it for redaction.
    pub fn set_secret(&mut self, name: &str, value: String) -> Result<(), ExecutionError> {
        self.set(VarScope::Script, name, value)?;
        self.secret_names.insert(name.to_string());
        Ok(())
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.secret_names.contains(name)
    }

    pub fn secret_values(&self) -> Vec<String> {
        self.secret_names
            .iter()
            .filter_map(|name| self.script_vars.get(name))
            .map(value_text)
            .filter(|value| !value.is_empty())
            .collect()
    }

    pub fn clear_script_vars(&mut self) {
        self.script_vars.clear();
        self.secret_names.clear();
    }

    pub fn merge_session_vars(&mut self, vars: &BTreeMap<String, String>) {
        for (name, value) in vars {
            self.session_vars
                .insert(name.clone(), Value::String(value.clone()));
        }
    }

    pub fn session_vars(&self) -> &BTreeMap<String, Value> {
        &self.session_vars
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn last_completed_step(&self) -> Option<usize> {
        self.last_completed_step
    }

    /// Moves the cursor past step `index`, which the session is done with.
    pub fn advance_past(&mut self, index: usize) {
        self.cursor = index + 1;
        self.last_completed_step = Some(index);
    }

    /// Positions a fresh context at `index` without marking anything done.
    pub fn start_at(&mut self, index: usize) {
        self.cursor = index;
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut ExecutionMetrics {
        &mut self.metrics
    }

    pub fn connection(&self) -> &ConnectionDescriptor {
        &self.connection.descriptor
    }

    pub fn runner_mut(&mut self) -> &mut dyn RemoteCommandRunner {
        self.connection.runner.as_mut()
    }

    pub fn snapshot(&self, now: i64) -> ContextSnapshot {
        ContextSnapshot {
            session_id: self.session_id.clone(),
            cursor: self.cursor,
            last_completed_step: self.last_completed_step,
            session_vars: self.session_vars.clone(),
            metrics: self.metrics,
            taken_at: now,
        }
    }

    pub fn restore(&mut self, snapshot: ContextSnapshot) -> Result<(), ExecutionError> {
        if snapshot.session_id != self.session_id {
            return Err(ExecutionError::SnapshotMismatch {
                snapshot: snapshot.session_id.to_string(),
                context: self.session_id.to_string(),
            });
        }
        self.clear_script_vars();
        self.session_vars = snapshot.session_vars;
        self.cursor = snapshot.cursor;
        self.last_completed_step = snapshot.last_completed_step;
        self.metrics = snapshot.metrics;
        Ok(())
    }
}

impl VarLookup for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get_value(name)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script_vars = self
            .script_vars
            .iter()
            .map(|(name, value)| {
                if self.secret_names.contains(name) {
                    (name.clone(), Value::String("***".to_string()))
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect::<BTreeMap<_, _>>();
        f.debug_struct("ExecutionContext")
            .field("session_id", &self.session_id)
            .field("script_vars", &script_vars)
            .field("session_vars", &self.session_vars)
            .field("global_vars", &self.global_vars)
            .field("target", &self.connection.runner.target())
            .field("cursor", &self.cursor)
            .field("last_completed_step", &self.last_completed_step)
            .field("metrics", &self.metrics)
            .finish()
    }
}
