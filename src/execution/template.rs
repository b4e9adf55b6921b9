//! Command templates and output-variable harvesting.
//!
//! Templates reference variables as `{{NAME}}` or `{{NAME:-fallback}}`.
//! Commands export variables back to the session by printing lines of the
//! form `::set NAME=value` on stdout.

use crate::execution::error::ExecutionError;
use std::collections::BTreeMap;

pub const SET_VAR_PREFIX: &str = "::set ";

pub fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

struct Placeholder<'a> {
    name: &'a str,
    fallback: Option<&'a str>,
}

fn parse_placeholder(token: &str) -> Result<Placeholder<'_>, ExecutionError> {
    let (name, fallback) = match token.split_once(":-") {
        Some((name, fallback)) => (name.trim(), Some(fallback)),
        None => (token.trim(), None),
    };
    if !is_valid_var_name(name) {
        return Err(ExecutionError::InvalidTemplate(format!(
            "placeholder `{{{{{token}}}}}` does not name a variable"
        )));
    }
    Ok(Placeholder { name, fallback })
}

fn walk_placeholders<F>(template: &str, mut on_placeholder: F) -> Result<String, ExecutionError>
where
    F: FnMut(Placeholder<'_>) -> Result<String, ExecutionError>,
{
    let mut rendered = String::with_capacity(template.len());
    let mut cursor = template;

    while let Some(start) = cursor.find("{{") {
        rendered.push_str(&cursor[..start]);
        let after_open = &cursor[start + 2..];
        let Some(close_offset) = after_open.find("}}") else {
            return Err(ExecutionError::InvalidTemplate(
                "unclosed placeholder in template".to_string(),
            ));
        };
        let token = after_open[..close_offset].trim();
        if token.is_empty() {
            return Err(ExecutionError::InvalidTemplate(
                "empty placeholder in template".to_string(),
            ));
        }
        rendered.push_str(&on_placeholder(parse_placeholder(token)?)?);
        cursor = &after_open[close_offset + 2..];
    }

    rendered.push_str(cursor);
    Ok(rendered)
}

/// Checks template syntax without resolving anything.
pub fn check_template(template: &str) -> Result<(), ExecutionError> {
    walk_placeholders(template, |_| Ok(String::new())).map(|_| ())
}

/// Renders `template`, resolving each placeholder through `lookup`.
/// An unresolved placeholder without a fallback is an error.
pub fn render_template<F>(template: &str, mut lookup: F) -> Result<String, ExecutionError>
where
    F: FnMut(&str) -> Option<String>,
{
    walk_placeholders(template, |placeholder| {
        match (lookup(placeholder.name), placeholder.fallback) {
            (Some(value), _) => Ok(value),
            (None, Some(fallback)) => Ok(fallback.to_string()),
            (None, None) => Err(ExecutionError::UndefinedVariable {
                name: placeholder.name.to_string(),
            }),
        }
    })
}

/// Single-quotes `value` for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HarvestedOutput {
    pub display: String,
    pub vars: BTreeMap<String, String>,
    pub rejected: Vec<String>,
}

/// Splits `::set NAME=value` lines out of command stdout. Later assignments
/// of the same name win. Malformed lines are reported in `rejected`.
pub fn harvest_output_vars(stdout: &str) -> HarvestedOutput {
    let mut harvested = HarvestedOutput::default();
    let mut display_lines = Vec::new();
    for line in stdout.lines() {
        let Some(assignment) = line.trim_start().strip_prefix(SET_VAR_PREFIX) else {
            display_lines.push(line);
            continue;
        };
        match assignment.split_once('=') {
            Some((name, value)) if is_valid_var_name(name.trim()) => {
                harvested
                    .vars
                    .insert(name.trim().to_string(), value.trim_end().to_string());
            }
            _ => harvested.rejected.push(line.to_string()),
        }
    }
    harvested.display = display_lines.join("\n");
    harvested
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("OS_TYPE", "debian"), ("PORT", "8080")])
    }

    #[test]
    fn renders_placeholders_and_fallbacks() {
        let vars = vars();
        let rendered = render_template(
            "install {{OS_TYPE}} on {{ PORT }} via {{MIRROR:-default}}",
            |name| vars.get(name).map(|v| v.to_string()),
        )
        .expect("render");
        assert_eq!(rendered, "install debian on 8080 via default");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = render_template("echo {{MISSING}}", |_| None).expect_err("undefined");
        assert!(matches!(err, ExecutionError::UndefinedVariable { name } if name == "MISSING"));
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(check_template("echo {{OPEN").is_err());
        assert!(check_template("echo {{}}").is_err());
        assert!(check_template("echo {{not a name}}").is_err());
        assert!(check_template("echo ${HOME} {{OK}}").is_ok());
    }

    #[test]
    fn harvests_set_lines() {
        let out = harvest_output_vars(
            "checking\n::set OS_TYPE=ubuntu\n  ::set SERVER_LOCATION=China\n::set bad-name=1\ndone\n",
        );
        assert_eq!(out.vars.get("OS_TYPE").map(String::as_str), Some("ubuntu"));
        assert_eq!(
            out.vars.get("SERVER_LOCATION").map(String::as_str),
            Some("China")
        );
        assert_eq!(out.display, "checking\ndone");
        assert_eq!(out.rejected, vec!["::set bad-name=1".to_string()]);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
