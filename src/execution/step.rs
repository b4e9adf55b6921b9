use crate::execution::builtin::{self, BuiltinName};
use crate::execution::error::ExecutionError;
use crate::execution::predicate::{Condition, StepPredicateEvaluator};
use crate::execution::template::{check_template, is_valid_var_name};
use crate::remote::ConnectionDescriptor;
use crate::shared::ids::{InteractionId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const SESSION_VAR_PREFIX: &str = "session.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    #[default]
    Confirmation,
    TextInput,
    Password,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::TextInput => "text_input",
            Self::Password => "password",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Command {
        command: String,
    },
    Interactive {
        prompt: String,
        #[serde(default)]
        interaction: InteractionKind,
        #[serde(default)]
        response_var: Option<String>,
        #[serde(default)]
        command: Option<String>,
    },
    Builtin {
        builtin: BuiltinName,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

impl StepKind {
    pub fn requires_interaction(&self) -> bool {
        matches!(self, Self::Interactive { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_accepted_exit_codes")]
    pub accepted_exit_codes: Vec<i32>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub capture_stdout_as: Option<String>,
}

impl StepSpec {
    pub fn command(id: &str, command: impl Into<String>) -> Result<Self, ExecutionError> {
        Self::with_kind(
            id,
            StepKind::Command {
                command: command.into(),
            },
        )
    }

    pub fn with_kind(id: &str, kind: StepKind) -> Result<Self, ExecutionError> {
        Ok(Self {
            id: StepId::parse(id).map_err(ExecutionError::InvalidStepList)?,
            name: None,
            kind,
            condition: None,
            accepted_exit_codes: default_accepted_exit_codes(),
            best_effort: false,
            timeout_seconds: None,
            capture_stdout_as: None,
        })
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn accepts_exit_code(&self, exit_code: i32) -> bool {
        self.accepted_exit_codes.contains(&exit_code)
    }
}

fn default_accepted_exit_codes() -> Vec<i32> {
    vec![0]
}

/// An ordered step list bound to one connection, as authored by the
/// script-management side and loaded from YAML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPlan {
    pub name: String,
    pub connection: ConnectionDescriptor,
    pub steps: Vec<StepSpec>,
}

/// A step whose condition has been parsed; produced by [`compile_steps`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    pub spec: StepSpec,
    pub condition: Option<Condition>,
}

/// Validates the whole list up front so a malformed plan fails before any
/// command runs.
pub fn compile_steps(steps: &[StepSpec]) -> Result<Vec<CompiledStep>, ExecutionError> {
    if steps.is_empty() {
        return Err(ExecutionError::InvalidStepList(
            "step list must contain at least one step".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    let mut compiled = Vec::with_capacity(steps.len());
    for step in steps {
        if !seen.insert(step.id.clone()) {
            return Err(ExecutionError::InvalidStepList(format!(
                "duplicate step id `{}`",
                step.id
            )));
        }
        validate_step(step)?;
        let condition = match step.condition.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => Some(StepPredicateEvaluator::compile(expr)?),
            _ => None,
        };
        compiled.push(CompiledStep {
            spec: step.clone(),
            condition,
        });
    }
    Ok(compiled)
}

fn validate_step(step: &StepSpec) -> Result<(), ExecutionError> {
    let invalid = |reason: String| {
        ExecutionError::InvalidStepList(format!("step `{}`: {reason}", step.id))
    };

    if step.accepted_exit_codes.is_empty() {
        return Err(invalid("accepted_exit_codes must not be empty".to_string()));
    }
    if step.timeout_seconds == Some(0) {
        return Err(invalid("timeout_seconds must be greater than 0".to_string()));
    }
    if let Some(name) = &step.capture_stdout_as {
        if !is_valid_var_name(name) {
            return Err(invalid(format!("capture_stdout_as `{name}` is not a variable name")));
        }
    }

    match &step.kind {
        StepKind::Command { command } => {
            if command.trim().is_empty() {
                return Err(invalid("command must be non-empty".to_string()));
            }
            check_template(command).map_err(|err| invalid(err.to_string()))?;
        }
        StepKind::Interactive {
            prompt,
            interaction,
            response_var,
            command,
        } => {
            if prompt.trim().is_empty() {
                return Err(invalid("interactive prompt must be non-empty".to_string()));
            }
            check_template(prompt).map_err(|err| invalid(err.to_string()))?;
            if let Some(var) = response_var {
                let bare = var.strip_prefix(SESSION_VAR_PREFIX).unwrap_or(var);
                if !is_valid_var_name(bare) {
                    return Err(invalid(format!("response_var `{var}` is not a variable name")));
                }
                if *interaction == InteractionKind::Password && var.starts_with(SESSION_VAR_PREFIX)
                {
                    return Err(invalid(
                        "password responses cannot be stored in session scope".to_string(),
                    ));
                }
            } else if *interaction != InteractionKind::Confirmation {
                return Err(invalid(format!(
                    "{interaction} interactions require a response_var"
                )));
            }
            if let Some(command) = command {
                check_template(command).map_err(|err| invalid(err.to_string()))?;
            }
        }
        StepKind::Builtin {
            builtin: name,
            params,
        } => {
            builtin::validate_params(*name, params).map_err(invalid)?;
        }
    }
    Ok(())
}

/// SHA-256 over the canonical JSON form of the step list, hex encoded.
pub fn plan_digest(steps: &[StepSpec]) -> Result<String, ExecutionError> {
    let body = serde_json::to_vec(steps).map_err(|source| ExecutionError::Json {
        path: "<step list>".to_string(),
        source,
    })?;
    let digest = Sha256::digest(&body);
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionSummary {
    pub interaction_id: InteractionId,
    pub kind: InteractionKind,
}

/// Outcome of one step execution. Built once by the engine and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub requires_interaction: bool,
    pub interaction: Option<InteractionSummary>,
    pub output_vars: BTreeMap<String, String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: String::new(),
            error: Some(error.into()),
            requires_interaction: false,
            interaction: None,
            output_vars: BTreeMap::new(),
            duration_ms: 0,
        }
    }

    pub fn with_interaction(mut self, summary: Option<InteractionSummary>) -> Self {
        self.requires_interaction = true;
        self.interaction = summary;
        self
    }
}
