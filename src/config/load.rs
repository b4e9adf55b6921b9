use super::{default_global_config_path, ConfigError, Settings};
use crate::execution::step::SessionPlan;
use std::fs;
use std::path::Path;

/// Loads settings from `path`, or from `~/.shellpilot/config.yaml` when no
/// path is given. A missing default file yields the built-in defaults.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = match path {
        Some(path) => Settings::from_path(path)?,
        None => {
            let default_path = default_global_config_path()?;
            if default_path.is_file() {
                Settings::from_path(&default_path)?
            } else {
                Settings::default()
            }
        }
    };
    settings.validate()?;
    Ok(settings)
}

pub fn load_plan(path: &Path) -> Result<SessionPlan, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let plan: SessionPlan = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    if plan.steps.is_empty() {
        return Err(ConfigError::Plan(format!(
            "plan `{}` declares no steps",
            path.display()
        )));
    }
    Ok(plan)
}
