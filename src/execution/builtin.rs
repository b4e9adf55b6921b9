use crate::execution::context::ExecutionContext;
use crate::execution::template::shell_quote;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CHINA_DOCKER_MIRROR: &str = "https://mirror.aliyun.com/docker-ce";
pub const DEFAULT_DOCKER_MIRROR: &str = "https://download.docker.com";
pub const SERVER_LOCATION_VAR: &str = "SERVER_LOCATION";
pub const CHINA_LOCATION: &str = "China";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinName {
    DetectOs,
    InstallDocker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectOsParams {
    #[serde(default)]
    skip_location: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallDockerParams {
    #[serde(default)]
    auto_mirror: bool,
    #[serde(default)]
    mirror: Option<String>,
}

/// The command a builtin renders to, plus variables it decides before the
/// command runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuiltinInvocation {
    pub command: String,
    pub preset_vars: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

pub fn validate_params(name: BuiltinName, params: &Map<String, Value>) -> Result<(), String> {
    match name {
        BuiltinName::DetectOs => parse_params::<DetectOsParams>(params).map(|_| ()),
        BuiltinName::InstallDocker => {
            let parsed = parse_params::<InstallDockerParams>(params)?;
            if let Some(mirror) = &parsed.mirror {
                if !mirror.starts_with("https://") && !mirror.starts_with("http://") {
                    return Err(format!("install_docker mirror `{mirror}` must be an http(s) URL"));
                }
            }
            Ok(())
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|err| format!("invalid builtin params: {err}"))
}

pub fn prepare(
    name: BuiltinName,
    params: &Map<String, Value>,
    context: &ExecutionContext,
) -> Result<BuiltinInvocation, String> {
    match name {
        BuiltinName::DetectOs => {
            let parsed = parse_params::<DetectOsParams>(params)?;
            Ok(BuiltinInvocation {
                command: detect_os_script(parsed.skip_location),
                ..BuiltinInvocation::default()
            })
        }
        BuiltinName::InstallDocker => {
            let parsed = parse_params::<InstallDockerParams>(params)?;
            let mut warnings = Vec::new();
            let mirror = select_docker_mirror(
                parsed.auto_mirror,
                parsed.mirror.as_deref(),
                context,
                &mut warnings,
            );
            Ok(BuiltinInvocation {
                command: install_docker_script(&mirror),
                preset_vars: BTreeMap::from([("DOCKER_MIRROR".to_string(), mirror)]),
                warnings,
            })
        }
    }
}

/// With `auto_mirror`, a server detected in China gets the Aliyun mirror;
/// an explicit mirror otherwise wins over the upstream default.
pub fn select_docker_mirror(
    auto_mirror: bool,
    explicit: Option<&str>,
    context: &ExecutionContext,
    warnings: &mut Vec<String>,
) -> String {
    if auto_mirror {
        let location = match context.get::<String>(SERVER_LOCATION_VAR) {
            Ok(location) => location,
            Err(err) => {
                warnings.push(err.to_string());
                None
            }
        };
        if location.as_deref() == Some(CHINA_LOCATION) {
            return CHINA_DOCKER_MIRROR.to_string();
        }
    }
    explicit.unwrap_or(DEFAULT_DOCKER_MIRROR).to_string()
}

fn detect_os_script(skip_location: bool) -> String {
    let mut script = String::from(
        "if [ -r /etc/os-release ]; then . /etc/os-release; fi; \
         echo \"::set OS_TYPE=${ID:-$(uname -s | tr '[:upper:]' '[:lower:]')}\"; \
         echo \"::set OS_VERSION=${VERSION_ID:-unknown}\"; \
         echo \"::set OS_ARCH=$(uname -m)\"",
    );
    if !skip_location {
        script.push_str(
            "; country=$(curl -fsS --max-time 5 https://ipinfo.io/country 2>/dev/null | tr -d '[:space:]'); \
             if [ \"$country\" = \"CN\" ]; then echo \"::set SERVER_LOCATION=China\"; \
             else echo \"::set SERVER_LOCATION=Global\"; fi",
        );
    }
    script
}

fn install_docker_script(mirror: &str) -> String {
    format!(
        "curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && DOWNLOAD_URL={} sh /tmp/get-docker.sh",
        shell_quote(mirror)
    )
}
