use crate::config::{load_plan, load_settings, Settings};
use crate::execution::{
    ChannelPublisher, EventKind, ExecutionService, ProgressEvent, StartOptions,
};
use crate::remote;
use crate::shared::ids::{InteractionId, SessionId};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Resume,
    Status,
    Sessions,
    Interactions,
    Recover,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "resume" => CliVerb::Resume,
        "status" => CliVerb::Status,
        "sessions" => CliVerb::Sessions,
        "interactions" => CliVerb::Interactions,
        "recover" => CliVerb::Recover,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: shellpilot [--config <path>] <command> [args]".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  run <plan.yaml> [--var NAME=value]... [--start-at N --plan-digest HEX]".to_string(),
        "                                       Run a plan, answering prompts on stdin"
            .to_string(),
        "  resume <session-id>                  Resume an interrupted session".to_string(),
        "  status <session-id>                  Print the persisted session record".to_string(),
        "  sessions                             List every known session".to_string(),
        "  interactions <session-id>            List a session's interactions".to_string(),
        "  recover                              List sessions that can be resumed".to_string(),
    ]
}

pub fn help_text() -> String {
    cli_help_lines().join("\n")
}

/// Entry point used by the binary: prompts are read from stdin and progress
/// is streamed to stdout.
pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();
    run_cli_with_io(args, &mut input, &mut output)
}

pub fn run_cli_with_io(
    args: Vec<String>,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<String, String> {
    let (config_path, args) = split_config_flag(args)?;
    if args.is_empty() {
        return Ok(help_text());
    }
    let verb = parse_cli_verb(args[0].as_str());
    if verb == CliVerb::Help {
        return Ok(help_text());
    }
    if verb == CliVerb::Unknown {
        return Err(format!("unknown command `{}`", args[0]));
    }

    let settings = load_settings(config_path.as_deref()).map_err(|err| err.to_string())?;
    match verb {
        CliVerb::Run => cmd_run(&settings, &args[1..], input, output),
        CliVerb::Resume => cmd_resume(&settings, &args[1..], input, output),
        CliVerb::Status => cmd_status(&settings, &args[1..]),
        CliVerb::Sessions => cmd_sessions(&settings),
        CliVerb::Interactions => cmd_interactions(&settings, &args[1..]),
        CliVerb::Recover => cmd_recover(&settings),
        CliVerb::Help | CliVerb::Unknown => Ok(help_text()),
    }
}

fn split_config_flag(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>), String> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| "--config requires a path".to_string())?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    Ok((config, rest))
}

fn open_service(settings: &Settings) -> Result<(ExecutionService, Arc<ChannelPublisher>), String> {
    let channel = Arc::new(ChannelPublisher::new());
    let service =
        ExecutionService::from_settings(settings, channel.clone()).map_err(|err| err.to_string())?;
    Ok((service, channel))
}

fn parse_session_id(args: &[String], usage: &str) -> Result<SessionId, String> {
    let raw = args.first().ok_or_else(|| format!("usage: {usage}"))?;
    SessionId::parse(raw)
}

fn parse_run_options(args: &[String]) -> Result<StartOptions, String> {
    let mut options = StartOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--var" => {
                let assignment = iter
                    .next()
                    .ok_or_else(|| "--var requires NAME=value".to_string())?;
                let (name, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| format!("--var `{assignment}` must be NAME=value"))?;
                options
                    .session_vars
                    .insert(name.to_string(), Value::String(value.to_string()));
            }
            "--start-at" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| "--start-at requires a step index".to_string())?;
                options.start_at = Some(
                    raw.parse::<usize>()
                        .map_err(|_| format!("--start-at `{raw}` is not a step index"))?,
                );
            }
            "--plan-digest" => {
                options.plan_digest = Some(
                    iter.next()
                        .ok_or_else(|| "--plan-digest requires a digest".to_string())?
                        .clone(),
                );
            }
            other => return Err(format!("unknown run option `{other}`")),
        }
    }
    Ok(options)
}

fn cmd_run(
    settings: &Settings,
    args: &[String],
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<String, String> {
    let plan_path = args
        .first()
        .ok_or_else(|| "usage: run <plan.yaml> [options]".to_string())?;
    let options = parse_run_options(&args[1..])?;
    let plan = load_plan(&PathBuf::from(plan_path)).map_err(|err| err.to_string())?;
    let runner = remote::connect(&plan.connection, &settings.ssh).map_err(|err| err.to_string())?;

    let (service, channel) = open_service(settings)?;
    let events = channel.subscribe(None);
    let session_id = service
        .start_session(&plan, runner, options)
        .map_err(|err| err.to_string())?;
    write_line(output, &format!("session {session_id} started"))?;
    follow_session(&service, &session_id, &events, input, output)
}

fn cmd_resume(
    settings: &Settings,
    args: &[String],
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<String, String> {
    let session_id = parse_session_id(args, "resume <session-id>")?;
    let (service, channel) = open_service(settings)?;
    let events = channel.subscribe(Some(session_id.clone()));
    service
        .resume_connected(&session_id)
        .map_err(|err| err.to_string())?;
    write_line(output, &format!("session {session_id} resumed"))?;
    follow_session(&service, &session_id, &events, input, output)
}

/// Streams events for one session, answering interaction requests from
/// `input`, until SESSION_DONE arrives.
fn follow_session(
    service: &ExecutionService,
    session_id: &SessionId,
    events: &Receiver<ProgressEvent>,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<String, String> {
    loop {
        let event = match events.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                let alive = service
                    .registry()
                    .lookup(session_id)
                    .is_some_and(|handle| handle.is_running() || handle.thread_alive());
                if alive {
                    continue;
                }
                // The thread may have published its final event just before exiting.
                match events.try_recv() {
                    Ok(event) => event,
                    Err(_) => {
                        return Err(format!(
                            "engine for session {session_id} stopped without a final event"
                        ))
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err("event channel closed".to_string());
            }
        };
        if &event.session_id != session_id {
            continue;
        }

        match event.kind {
            EventKind::InteractionRequest => {
                answer_interaction(service, session_id, &event.payload, input, output)?
            }
            EventKind::SessionDone => {
                let _ = service.join(session_id);
                return Ok(format!(
                    "session {session_id} finished: {} ({})",
                    payload_str(&event.payload, "status"),
                    payload_str(&event.payload, "reason")
                ));
            }
            _ => write_line(output, &format_event(&event))?,
        }
    }
}

fn answer_interaction(
    service: &ExecutionService,
    session_id: &SessionId,
    payload: &Value,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<(), String> {
    let interaction_id = InteractionId::parse(payload_str(payload, "interactionId"))?;
    let kind = payload_str(payload, "kind");
    let hint = match kind {
        "confirmation" => " [y/N]",
        "password" => " (input is not hidden)",
        _ => "",
    };
    write!(output, "? {}{hint} ", payload_str(payload, "prompt")).map_err(|err| err.to_string())?;
    output.flush().map_err(|err| err.to_string())?;

    let mut line = String::new();
    let read = input.read_line(&mut line).map_err(|err| err.to_string())?;
    if read == 0 {
        write_line(output, "")?;
        return service.cancel(session_id).map_err(|err| err.to_string());
    }
    service
        .respond(&interaction_id, line.trim_end_matches(['\r', '\n']))
        .map_err(|err| err.to_string())
}

fn format_event(event: &ProgressEvent) -> String {
    let payload = &event.payload;
    match event.kind {
        EventKind::Log => format!(
            "[log] {}: {}",
            payload_str(payload, "event"),
            payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_else(|| payload_str(payload, "stepId"))
        ),
        EventKind::StepStart => format!(
            "[step {}] {} started",
            payload["stepIndex"],
            payload_str(payload, "name")
        ),
        EventKind::StepDone => {
            let result = &payload["result"];
            let success = result["success"].as_bool().unwrap_or(false);
            let mut line = format!(
                "[step {}] {} {}",
                payload["stepIndex"],
                payload_str(payload, "stepId"),
                if success { "ok" } else { "failed" }
            );
            if let Some(error) = result["error"].as_str() {
                line.push_str(&format!(": {error}"));
            }
            let out = result["output"].as_str().unwrap_or_default().trim();
            if !out.is_empty() {
                line.push('\n');
                line.push_str(out);
            }
            line
        }
        EventKind::InteractionRequest => {
            format!("[input] {}", payload_str(payload, "prompt"))
        }
        EventKind::SessionDone => format!(
            "[done] {}: {}",
            payload_str(payload, "status"),
            payload_str(payload, "reason")
        ),
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn write_line(output: &mut dyn Write, line: &str) -> Result<(), String> {
    writeln!(output, "{line}").map_err(|err| err.to_string())
}

fn cmd_status(settings: &Settings, args: &[String]) -> Result<String, String> {
    let session_id = parse_session_id(args, "status <session-id>")?;
    let (service, _) = open_service(settings)?;
    let session = service.status(&session_id).map_err(|err| err.to_string())?;
    serde_json::to_string_pretty(&session).map_err(|err| err.to_string())
}

fn cmd_sessions(settings: &Settings) -> Result<String, String> {
    let (service, _) = open_service(settings)?;
    let sessions = service.list_sessions().map_err(|err| err.to_string())?;
    if sessions.is_empty() {
        return Ok("no sessions".to_string());
    }
    Ok(sessions
        .iter()
        .map(|session| {
            format!(
                "{} {} plan={} step={}/{}",
                session.session_id,
                session.status,
                session.plan_name,
                session.cursor,
                session.step_count
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn cmd_interactions(settings: &Settings, args: &[String]) -> Result<String, String> {
    let session_id = parse_session_id(args, "interactions <session-id>")?;
    let (service, _) = open_service(settings)?;
    let interactions = service
        .interactions(&session_id)
        .map_err(|err| err.to_string())?;
    if interactions.is_empty() {
        return Ok(format!("no interactions for {session_id}"));
    }
    Ok(interactions
        .iter()
        .map(|interaction| {
            format!(
                "{} {} {} step={} prompt={:?} response={}",
                interaction.interaction_id,
                interaction.status.as_str(),
                interaction.kind,
                interaction.step_id,
                interaction.prompt,
                interaction.response.as_deref().unwrap_or("-")
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn cmd_recover(settings: &Settings) -> Result<String, String> {
    let (service, _) = open_service(settings)?;
    let sessions = service
        .recoverable_sessions()
        .map_err(|err| err.to_string())?;
    if sessions.is_empty() {
        return Ok("no resumable sessions".to_string());
    }
    let mut lines = sessions
        .iter()
        .map(|session| {
            format!(
                "{} {} plan={} resume_at={} last_completed={}",
                session.session_id,
                session.status,
                session.plan_name,
                session.cursor,
                session
                    .last_completed_step
                    .map(|index| index.to_string())
                    .unwrap_or_else(|| "-".to_string())
            )
        })
        .collect::<Vec<_>>();
    lines.push("resume with: shellpilot resume <session-id>".to_string());
    Ok(lines.join("\n"))
}
