use crate::config::Settings;
use crate::execution::builtin;
use crate::execution::context::{ExecutionContext, VarScope};
use crate::execution::error::ExecutionError;
use crate::execution::events::{EventKind, SessionEvents};
use crate::execution::interaction::{InteractionGateway, InteractionRequest};
use crate::execution::predicate::StepPredicateEvaluator;
use crate::execution::registry::SessionHandle;
use crate::execution::session::{ExecutionSession, SessionStatus};
use crate::execution::step::{
    CompiledStep, InteractionKind, InteractionSummary, StepKind, StepResult, StepSpec,
    SESSION_VAR_PREFIX,
};
use crate::execution::store::SessionStore;
use crate::execution::template::{harvest_output_vars, render_template};
use crate::remote::{CommandRequest, RunnerError};
use crate::shared::logging::{append_engine_log, LogLevel};
use crate::shared::time::now_millis;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STDERR_TAIL_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub state_root: PathBuf,
    pub interaction_timeout: Duration,
    pub command_timeout: Duration,
    pub max_output_bytes: usize,
}

impl EngineSettings {
    pub fn from_settings(settings: &Settings, state_root: PathBuf) -> Self {
        Self {
            state_root,
            interaction_timeout: settings.interaction_timeout(),
            command_timeout: settings.command_timeout(),
            max_output_bytes: settings.max_output_bytes,
        }
    }

    pub fn with_interaction_timeout(mut self, timeout: Duration) -> Self {
        self.interaction_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Everything one engine run owns. Built by the service on the session's
/// own thread and never shared with another session.
pub struct SessionRun {
    pub session: ExecutionSession,
    pub steps: Vec<CompiledStep>,
    pub context: ExecutionContext,
    pub events: SessionEvents,
    pub handle: Arc<SessionHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Terminal {
    status: SessionStatus,
    reason: String,
}

impl Terminal {
    fn new(status: SessionStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// A finished step plus, when the step itself decides the session must
/// stop (transport failure, interaction timeout, cancellation), why.
struct StepOutcome {
    result: StepResult,
    halt: Option<Terminal>,
}

impl StepOutcome {
    fn done(result: StepResult) -> Self {
        Self { result, halt: None }
    }

    fn halt(result: StepResult, status: SessionStatus, reason: impl Into<String>) -> Self {
        Self {
            result,
            halt: Some(Terminal::new(status, reason)),
        }
    }
}

struct RunGuard(Arc<SessionHandle>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.end_run();
    }
}

pub struct ExecutionEngine {
    settings: EngineSettings,
    store: Arc<dyn SessionStore>,
    gateway: Arc<InteractionGateway>,
}

impl ExecutionEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn SessionStore>,
        gateway: Arc<InteractionGateway>,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Drives the session from its context cursor to a terminal status and
    /// publishes exactly one SESSION_DONE. Returns an error only when state
    /// could not be persisted; the session is then marked FAILED.
    pub fn run(&self, run: &mut SessionRun) -> Result<SessionStatus, ExecutionError> {
        let handle = Arc::clone(&run.handle);
        handle.begin_run()?;
        let _guard = RunGuard(handle);

        self.log(
            run,
            LogLevel::Info,
            "session.run",
            &format!(
                "plan `{}` on {}: {} steps from cursor {}",
                run.session.plan_name,
                run.context.connection().target(),
                run.steps.len(),
                run.context.cursor()
            ),
        );

        let mut open_step = None;
        match self.drive(run, &mut open_step) {
            Ok(terminal) => self.finish(run, terminal),
            Err(err) => {
                if let Some(index) = open_step {
                    let step = run.steps[index].spec.clone();
                    let result = StepResult::failed(format!("state persistence failed: {err}"));
                    run.events
                        .emit(EventKind::StepDone, step_done_payload(index, &step, &result));
                }
                let _ = self.finish(
                    run,
                    Terminal::new(SessionStatus::Failed, format!("engine error: {err}")),
                );
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        run: &mut SessionRun,
        open_step: &mut Option<usize>,
    ) -> Result<Terminal, ExecutionError> {
        let total = run.steps.len();
        for index in run.context.cursor()..total {
            let step = run.steps[index].clone();
            let spec = &step.spec;
            if run.handle.is_cancelled() {
                return Ok(Terminal::new(
                    SessionStatus::Cancelled,
                    format!("cancelled before step `{}`", spec.id),
                ));
            }

            run.context.clear_script_vars();
            let predicate =
                StepPredicateEvaluator::should_run(step.condition.as_ref(), &run.context);
            for warning in &predicate.warnings {
                self.warn(run, "condition.warning", warning);
            }
            if !predicate.run {
                run.context.metrics_mut().steps_skipped += 1;
                run.context.advance_past(index);
                self.checkpoint(run)?;
                self.log(
                    run,
                    LogLevel::Info,
                    "step.skipped",
                    &format!("step `{}` condition not met", spec.id),
                );
                run.events.emit(
                    EventKind::Log,
                    json!({
                        "event": "step_skipped",
                        "stepIndex": index,
                        "stepId": spec.id.as_str(),
                        "condition": spec.condition,
                    }),
                );
                continue;
            }

            run.context.metrics_mut().steps_started += 1;
            run.session.cursor = index;
            run.session.current_step_id = Some(spec.id.to_string());
            run.session.updated_at = now_millis();
            self.store.save_session(&run.session)?;
            run.handle.update(|state| state.cursor = index);
            *open_step = Some(index);
            run.events.emit(
                EventKind::StepStart,
                json!({
                    "stepIndex": index,
                    "stepId": spec.id.as_str(),
                    "name": spec.display_name(),
                    "requiresInteraction": spec.kind.requires_interaction(),
                }),
            );
            self.log(
                run,
                LogLevel::Info,
                "step.started",
                &format!("step {} `{}`", index, spec.id),
            );

            let outcome = self.execute_step(run, index, &step)?;
            let result = outcome.result;
            run.context.merge_session_vars(&result.output_vars);

            let halt = outcome.halt.or_else(|| {
                (!result.success && !spec.best_effort).then(|| {
                    Terminal::new(
                        SessionStatus::Failed,
                        format!(
                            "step `{}` failed: {}",
                            spec.id,
                            result.error.as_deref().unwrap_or("unknown error")
                        ),
                    )
                })
            });
            if halt.is_none() && run.session.status == SessionStatus::WaitingInput {
                run.session
                    .transition(SessionStatus::Running, now_millis(), None)?;
                run.handle.update(|state| state.status = SessionStatus::Running);
            }

            let metrics = run.context.metrics_mut();
            if result.success {
                metrics.steps_succeeded += 1;
            } else {
                metrics.steps_failed += 1;
            }
            if halt.is_none() {
                run.context.advance_past(index);
            }
            self.checkpoint(run)?;
            *open_step = None;

            if result.success {
                self.log(
                    run,
                    LogLevel::Info,
                    "step.succeeded",
                    &format!("step `{}` in {}ms", spec.id, result.duration_ms),
                );
            } else if halt.is_none() {
                let message = format!(
                    "best-effort step `{}` failed: {}",
                    spec.id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                self.warn(run, "step.best_effort_failed", &message);
            }
            run.events
                .emit(EventKind::StepDone, step_done_payload(index, spec, &result));

            if let Some(terminal) = halt {
                return Ok(terminal);
            }
        }
        Ok(Terminal::new(
            SessionStatus::Completed,
            format!("all {total} steps processed"),
        ))
    }

    fn execute_step(
        &self,
        run: &mut SessionRun,
        index: usize,
        step: &CompiledStep,
    ) -> Result<StepOutcome, ExecutionError> {
        let started = Instant::now();
        let spec = &step.spec;
        let mut outcome = match &spec.kind {
            StepKind::Command { command } => match render(&run.context, command) {
                Ok(command) => self.run_command(run, spec, command, BTreeMap::new()),
                Err(err) => StepOutcome::done(StepResult::failed(err.to_string())),
            },
            StepKind::Builtin {
                builtin: name,
                params,
            } => match builtin::prepare(*name, params, &run.context) {
                Ok(invocation) => {
                    for warning in &invocation.warnings {
                        self.warn(run, "builtin.warning", warning);
                    }
                    self.run_command(run, spec, invocation.command, invocation.preset_vars)
                }
                Err(err) => StepOutcome::done(StepResult::failed(err)),
            },
            StepKind::Interactive {
                prompt,
                interaction,
                response_var,
                command,
            } => self.run_interactive(
                run,
                index,
                spec,
                prompt,
                *interaction,
                response_var.as_deref(),
                command.as_deref(),
            )?,
        };
        outcome.result.duration_ms = elapsed_ms(started);
        Ok(outcome)
    }

    fn run_command(
        &self,
        run: &mut SessionRun,
        spec: &StepSpec,
        command: String,
        preset_vars: BTreeMap<String, String>,
    ) -> StepOutcome {
        let request = CommandRequest {
            command,
            timeout: spec
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.settings.command_timeout),
            max_output_bytes: self.settings.max_output_bytes,
            cancel: run.handle.cancel_token(),
        };
        let secrets = run.context.secret_values();
        run.context.metrics_mut().commands_run += 1;

        let output = match run.context.runner_mut().run(&request) {
            Ok(output) => output,
            Err(err @ RunnerError::Cancelled { .. }) => {
                return StepOutcome::halt(
                    StepResult::failed(err.to_string()),
                    SessionStatus::Cancelled,
                    format!("cancelled during step `{}`", spec.id),
                );
            }
            Err(err) if err.is_transport() => {
                let message = redact(&err.to_string(), &secrets);
                return StepOutcome::halt(
                    StepResult::failed(message.clone()),
                    SessionStatus::Failed,
                    format!("transport error in step `{}`: {message}", spec.id),
                );
            }
            Err(err) => {
                return StepOutcome::done(StepResult::failed(redact(&err.to_string(), &secrets)))
            }
        };

        run.context.metrics_mut().command_millis += output.duration_ms;
        let harvested = harvest_output_vars(&output.stdout);
        for line in &harvested.rejected {
            let message = format!(
                "ignored malformed output variable line `{}`",
                redact(line, &secrets)
            );
            self.warn(run, "output.rejected", &message);
        }
        if output.stdout_truncated || output.stderr_truncated {
            let message = format!(
                "step `{}` output truncated at {} bytes",
                spec.id, self.settings.max_output_bytes
            );
            self.warn(run, "output.truncated", &message);
        }

        let mut output_vars = harvested.vars;
        if let Some(name) = &spec.capture_stdout_as {
            output_vars.insert(name.clone(), harvested.display.trim().to_string());
        }
        output_vars.extend(preset_vars);

        let success = spec.accepts_exit_code(output.exit_code);
        let error = (!success).then(|| {
            let mut message = format!(
                "exit code {} not in accepted set {:?}",
                output.exit_code, spec.accepted_exit_codes
            );
            let stderr = output.stderr.trim();
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&tail(stderr, STDERR_TAIL_CHARS));
            }
            redact(&message, &secrets)
        });
        self.log(
            run,
            LogLevel::Info,
            "command.finished",
            &format!(
                "step `{}` exit={} duration_ms={}",
                spec.id, output.exit_code, output.duration_ms
            ),
        );

        StepOutcome::done(StepResult {
            success,
            exit_code: Some(output.exit_code),
            output: redact(&harvested.display, &secrets),
            error,
            requires_interaction: false,
            interaction: None,
            output_vars,
            duration_ms: output.duration_ms,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_interactive(
        &self,
        run: &mut SessionRun,
        index: usize,
        spec: &StepSpec,
        prompt: &str,
        kind: InteractionKind,
        response_var: Option<&str>,
        command: Option<&str>,
    ) -> Result<StepOutcome, ExecutionError> {
        let prompt = match render(&run.context, prompt) {
            Ok(prompt) => prompt,
            Err(err) => return Ok(StepOutcome::done(StepResult::failed(err.to_string()))),
        };

        run.session
            .transition(SessionStatus::WaitingInput, now_millis(), None)?;
        self.store.save_session(&run.session)?;
        run.handle
            .update(|state| state.status = SessionStatus::WaitingInput);

        let request = InteractionRequest {
            session_id: run.session.session_id.clone(),
            step_id: spec.id.clone(),
            step_index: index,
            prompt,
            kind,
            timeout: self.settings.interaction_timeout,
        };
        let interaction_id = match self.gateway.create_interaction(&request, &mut run.events) {
            Ok(interaction_id) => interaction_id,
            Err(err) => {
                return Ok(StepOutcome::done(
                    StepResult::failed(err.to_string()).with_interaction(None),
                ))
            }
        };
        let summary = InteractionSummary {
            interaction_id: interaction_id.clone(),
            kind,
        };
        run.session.current_interaction = Some(interaction_id.clone());
        run.session.updated_at = now_millis();
        self.store.save_session(&run.session)?;
        run.handle
            .update(|state| state.current_interaction = Some(interaction_id.clone()));

        let waited = self.gateway.await_completion(
            &interaction_id,
            self.settings.interaction_timeout,
            &run.handle.cancel_token(),
        );
        run.session.current_interaction = None;
        run.handle.update(|state| state.current_interaction = None);

        let response = match waited {
            Ok(response) => response,
            Err(err @ ExecutionError::InteractionTimeout { .. }) => {
                return Ok(StepOutcome::halt(
                    StepResult::failed(err.to_string()).with_interaction(Some(summary)),
                    SessionStatus::TimedOut,
                    format!("step `{}`: {err}", spec.id),
                ));
            }
            Err(err @ ExecutionError::Cancelled { .. }) => {
                return Ok(StepOutcome::halt(
                    StepResult::failed(err.to_string()).with_interaction(Some(summary)),
                    SessionStatus::Cancelled,
                    format!("cancelled while waiting on step `{}`", spec.id),
                ));
            }
            Err(err) => {
                return Ok(StepOutcome::done(
                    StepResult::failed(err.to_string()).with_interaction(Some(summary)),
                ))
            }
        };
        run.context.metrics_mut().interactions_answered += 1;
        run.session
            .transition(SessionStatus::Running, now_millis(), None)?;
        self.store.save_session(&run.session)?;
        run.handle.update(|state| state.status = SessionStatus::Running);
        self.log(
            run,
            LogLevel::Info,
            "interaction.answered",
            &format!("step `{}` received a {kind} response", spec.id),
        );

        let mut session_vars = BTreeMap::new();
        let stored = match kind {
            InteractionKind::Confirmation => {
                let confirmed = normalize_confirmation(&response);
                let stored = response_var.map_or(Ok(()), |var| {
                    store_response(&mut run.context, var, confirmed.to_string(), &mut session_vars)
                });
                if !confirmed {
                    let mut result = StepResult::failed("declined by user");
                    result.output_vars = session_vars;
                    return Ok(StepOutcome::done(result.with_interaction(Some(summary))));
                }
                stored
            }
            InteractionKind::TextInput => response_var.map_or(Ok(()), |var| {
                store_response(&mut run.context, var, response.clone(), &mut session_vars)
            }),
            InteractionKind::Password => response_var.map_or(Ok(()), |var| {
                run.context.set_secret(var, response.clone())
            }),
        };
        if let Err(err) = stored {
            return Ok(StepOutcome::done(
                StepResult::failed(err.to_string()).with_interaction(Some(summary)),
            ));
        }

        let Some(command) = command else {
            let output = if kind == InteractionKind::Password {
                String::new()
            } else {
                response
            };
            return Ok(StepOutcome::done(
                StepResult {
                    success: true,
                    exit_code: None,
                    output,
                    error: None,
                    requires_interaction: true,
                    interaction: None,
                    output_vars: session_vars,
                    duration_ms: 0,
                }
                .with_interaction(Some(summary)),
            ));
        };

        let command = match render(&run.context, command) {
            Ok(command) => command,
            Err(err) => {
                return Ok(StepOutcome::done(
                    StepResult::failed(err.to_string()).with_interaction(Some(summary)),
                ))
            }
        };
        let mut outcome = self.run_command(run, spec, command, session_vars);
        outcome.result = outcome.result.with_interaction(Some(summary));
        Ok(outcome)
    }

    /// Persists the context snapshot and then the session record. Callers
    /// publish STEP_DONE only after this returns.
    fn checkpoint(&self, run: &mut SessionRun) -> Result<(), ExecutionError> {
        let now = now_millis();
        let snapshot = run.context.snapshot(now);
        self.store.save_snapshot(&snapshot)?;
        run.session.cursor = run.context.cursor();
        run.session.last_completed_step = run.context.last_completed_step();
        run.session.updated_at = now;
        self.store.save_session(&run.session)?;
        let cursor = run.context.cursor();
        run.handle.update(|state| {
            state.cursor = cursor;
            state.last_snapshot = Some(snapshot);
        });
        Ok(())
    }

    fn finish(
        &self,
        run: &mut SessionRun,
        terminal: Terminal,
    ) -> Result<SessionStatus, ExecutionError> {
        run.session
            .transition(terminal.status, now_millis(), Some(terminal.reason.clone()))?;
        run.session.current_step_id = None;
        run.session.cursor = run.context.cursor();
        run.session.last_completed_step = run.context.last_completed_step();
        let persisted = self.store.save_session(&run.session);

        let level = match terminal.status {
            SessionStatus::Completed => LogLevel::Info,
            SessionStatus::Cancelled => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        self.log(
            run,
            level,
            "session.finished",
            &format!("{}: {}", terminal.status, terminal.reason),
        );
        let cursor = run.context.cursor();
        run.handle.update(|state| {
            state.status = terminal.status;
            state.cursor = cursor;
            state.current_interaction = None;
        });
        run.events.emit(
            EventKind::SessionDone,
            json!({
                "status": terminal.status.as_str(),
                "reason": terminal.reason,
                "lastCompletedStep": run.context.last_completed_step(),
                "planDigest": run.session.plan_digest,
                "metrics": run.context.metrics(),
            }),
        );
        persisted.map(|()| terminal.status)
    }

    fn log(&self, run: &SessionRun, level: LogLevel, event: &str, message: &str) {
        append_engine_log(
            &self.settings.state_root,
            level,
            event,
            Some(run.session.session_id.as_str()),
            message,
        );
    }

    fn warn(&self, run: &mut SessionRun, event: &str, message: &str) {
        self.log(run, LogLevel::Warn, event, message);
        run.events.log(event, message);
    }
}

fn render(context: &ExecutionContext, template: &str) -> Result<String, ExecutionError> {
    render_template(template, |name| context.get_text(name))
}

/// Response values land in script scope for the rest of the step; a
/// `session.` prefix also queues them for the session merge.
fn store_response(
    context: &mut ExecutionContext,
    var: &str,
    value: String,
    session_vars: &mut BTreeMap<String, String>,
) -> Result<(), ExecutionError> {
    match var.strip_prefix(SESSION_VAR_PREFIX) {
        Some(name) => {
            context.set(VarScope::Script, name, value.clone())?;
            session_vars.insert(name.to_string(), value);
        }
        None => context.set(VarScope::Script, var, value)?,
    }
    Ok(())
}

pub fn normalize_confirmation(response: &str) -> bool {
    matches!(
        response.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "true" | "1" | "confirm"
    )
}

fn step_done_payload(index: usize, spec: &StepSpec, result: &StepResult) -> serde_json::Value {
    json!({
        "stepIndex": index,
        "stepId": spec.id.as_str(),
        "bestEffort": spec.best_effort,
        "result": result,
    })
}

fn redact(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped = text.chars().skip(count - max_chars).collect::<String>();
    format!("...{skipped}")
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
