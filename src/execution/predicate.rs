//! Step run-conditions.
//!
//! Grammar:
//!
//! ```text
//! expr     := and (("||" | "or") and)*
//! and      := unary (("&&" | "and") unary)*
//! unary    := ("!" | "not") unary | primary
//! primary  := "(" expr ")" | "defined" "(" NAME ")" | operand (cmp operand)?
//! cmp      := "==" | "!=" | "<" | "<=" | ">" | ">="
//!           | "contains" | "starts_with" | "ends_with"
//! operand  := NAME | "{{" NAME "}}" | 'text' | "text" | number | true | false
//! ```

use crate::execution::error::ExecutionError;
use crate::execution::template::is_valid_var_name;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Text(String),
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(Operand),
    Defined(String),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

/// Read access to variables, in whatever precedence the source applies.
pub trait VarLookup {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl VarLookup for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PredicateOutcome {
    pub run: bool,
    pub warnings: Vec<String>,
}

pub struct StepPredicateEvaluator;

impl StepPredicateEvaluator {
    pub fn compile(expression: &str) -> Result<Condition, ExecutionError> {
        let invalid = |reason: String| ExecutionError::InvalidCondition {
            expression: expression.to_string(),
            reason,
        };
        let tokens = tokenize(expression).map_err(invalid)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let condition = parser.parse_or().map_err(invalid)?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {token:?}")));
        }
        Ok(condition)
    }

    /// A step without a condition always runs. Type problems never abort:
    /// the offending variable is treated as absent and a warning returned.
    pub fn should_run(condition: Option<&Condition>, vars: &dyn VarLookup) -> PredicateOutcome {
        let mut warnings = Vec::new();
        let run = match condition {
            Some(condition) => evaluate(condition, vars, &mut warnings),
            None => true,
        };
        PredicateOutcome { run, warnings }
    }
}

fn evaluate(condition: &Condition, vars: &dyn VarLookup, warnings: &mut Vec<String>) -> bool {
    match condition {
        Condition::Truthy(operand) => resolve(operand, vars).is_some_and(|v| truthy(&v)),
        Condition::Defined(name) => vars.lookup(name).is_some(),
        Condition::Not(inner) => !evaluate(inner, vars, warnings),
        Condition::All(items) => items.iter().all(|c| evaluate(c, vars, warnings)),
        Condition::Any(items) => items.iter().any(|c| evaluate(c, vars, warnings)),
        Condition::Compare { left, op, right } => {
            compare(left, *op, right, vars, warnings)
        }
    }
}

fn compare(
    left: &Operand,
    op: CompareOp,
    right: &Operand,
    vars: &dyn VarLookup,
    warnings: &mut Vec<String>,
) -> bool {
    let lhs = resolve(left, vars);
    let rhs = resolve(right, vars);
    match op {
        CompareOp::Eq => matches!((&lhs, &rhs), (Some(a), Some(b)) if values_equal(a, b)),
        CompareOp::Ne => !matches!((&lhs, &rhs), (Some(a), Some(b)) if values_equal(a, b)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let (Some(a), Some(b)) = (&lhs, &rhs) else {
                return false;
            };
            let (Some(x), Some(y)) = (as_number(a), as_number(b)) else {
                warnings.push(format!(
                    "non-numeric operand in ordered comparison ({} vs {}); treated as absent",
                    value_text(a),
                    value_text(b)
                ));
                return false;
            };
            match op {
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
                CompareOp::Gt => x > y,
                _ => x >= y,
            }
        }
        CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
            let (Some(a), Some(b)) = (&lhs, &rhs) else {
                return false;
            };
            let (haystack, needle) = (value_text(a), value_text(b));
            match op {
                CompareOp::Contains => haystack.contains(&needle),
                CompareOp::StartsWith => haystack.starts_with(&needle),
                _ => haystack.ends_with(&needle),
            }
        }
    }
}

fn resolve(operand: &Operand, vars: &dyn VarLookup) -> Option<Value> {
    match operand {
        Operand::Var(name) => vars.lookup(name).cloned(),
        Operand::Text(text) => Some(Value::String(text.clone())),
        Operand::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        Operand::Bool(b) => Some(Value::Bool(*b)),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Bool(x), _) => value_text(b).eq_ignore_ascii_case(&x.to_string()),
        (_, Value::Bool(y)) => value_text(a).eq_ignore_ascii_case(&y.to_string()),
        _ => value_text(a) == value_text(b),
    }
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            !matches!(lowered.as_str(), "" | "false" | "0" | "no" | "off")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Cmp(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars = input.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let with_eq = next == Some('=');
                tokens.push(Token::Cmp(match (ch, with_eq) {
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    (_, true) => CompareOp::Ge,
                    _ => CompareOp::Gt,
                }));
                i += if with_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = ch;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(c) if *c == quote => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            text.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '{' if next == Some('{') => {
                let rest = chars[i + 2..].iter().collect::<String>();
                let Some(close) = rest.find("}}") else {
                    return Err("unclosed `{{` variable reference".to_string());
                };
                let name = rest[..close].trim().to_string();
                if !is_valid_var_name(&name) {
                    return Err(format!("`{{{{{name}}}}}` does not name a variable"));
                }
                i += 2 + rest[..close].chars().count() + 2;
                tokens.push(Token::Ident(name));
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw = chars[start..i].iter().collect::<String>();
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{raw}`"))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word = chars[start..i].iter().collect::<String>();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Cmp(CompareOp::Contains),
                    "starts_with" => Token::Cmp(CompareOp::StartsWith),
                    "ends_with" => Token::Cmp(CompareOp::EndsWith),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unknown operator `{other}`")),
        }
    }
    Ok(tokens)
}

/// Deepest run of nested `(` and `!` a condition may use.
pub const MAX_CONDITION_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, String>,
    ) -> Result<T, String> {
        if self.depth >= MAX_CONDITION_DEPTH {
            return Err(format!("nesting deeper than {MAX_CONDITION_DEPTH} levels"));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::Any(items)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::All(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.nested(Self::parse_or)?;
            if self.bump() != Some(Token::RParen) {
                return Err("expected `)`".to_string());
            }
            return Ok(inner);
        }

        if matches!(self.peek(), Some(Token::Ident(word)) if word == "defined")
            && self.tokens.get(self.pos + 1) == Some(&Token::LParen)
        {
            self.pos += 2;
            let Some(Token::Ident(name)) = self.bump() else {
                return Err("defined(...) expects a variable name".to_string());
            };
            if self.bump() != Some(Token::RParen) {
                return Err("expected `)` after defined(...)".to_string());
            }
            return Ok(Condition::Defined(name));
        }

        let left = self.parse_operand()?;
        match self.peek().cloned() {
            Some(Token::Cmp(op)) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Condition::Compare { left, op, right })
            }
            Some(Token::Ident(word)) => Err(format!("unknown operator `{word}`")),
            Some(Token::Str(_)) | Some(Token::Num(_)) => {
                Err("missing operator between operands".to_string())
            }
            _ => Ok(Condition::Truthy(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.bump() {
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Operand::Bool(true),
                "false" => Operand::Bool(false),
                _ => Operand::Var(word),
            }),
            Some(Token::Str(text)) => Ok(Operand::Text(text)),
            Some(Token::Num(n)) => Ok(Operand::Number(n)),
            Some(other) => Err(format!("expected an operand, found {other:?}")),
            None => Err("expected an operand, found end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("OS_TYPE".to_string(), json!("debian")),
            ("SERVER_LOCATION".to_string(), json!("China")),
            ("CPU_COUNT".to_string(), json!(4)),
            ("FORCE".to_string(), json!(false)),
            ("VERSION".to_string(), json!("22.04")),
        ])
    }

    fn check(expr: &str) -> bool {
        let condition = StepPredicateEvaluator::compile(expr).expect("compile");
        StepPredicateEvaluator::should_run(Some(&condition), &vars()).run
    }

    #[test]
    fn string_and_numeric_comparisons() {
        assert!(check("OS_TYPE == 'debian'"));
        assert!(check("{{SERVER_LOCATION}} == \"China\""));
        assert!(!check("OS_TYPE != \"debian\""));
        assert!(check("CPU_COUNT >= 2 && CPU_COUNT < 8"));
        assert!(check("VERSION starts_with '22'"));
        assert!(check("CPU_COUNT == '4'"));
    }

    #[test]
    fn boolean_logic_and_truthiness() {
        assert!(check("!FORCE"));
        assert!(check("FORCE == false"));
        assert!(check("OS_TYPE == 'centos' or (SERVER_LOCATION == 'China' and not FORCE)"));
        assert!(!check("MISSING"));
        assert!(check("MISSING != 'x'"));
        assert!(check("defined(OS_TYPE) && !defined(MISSING)"));
    }

    #[test]
    fn type_mismatch_is_a_warning_not_an_error() {
        let condition = StepPredicateEvaluator::compile("OS_TYPE > 3").expect("compile");
        let outcome = StepPredicateEvaluator::should_run(Some(&condition), &vars());
        assert!(!outcome.run);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn no_condition_always_runs() {
        assert!(StepPredicateEvaluator::should_run(None, &vars()).run);
    }

    #[test]
    fn rejects_unknown_operators_and_garbage() {
        for expr in [
            "OS_TYPE LIKE 'deb'",
            "OS_TYPE = 'debian'",
            "OS_TYPE =~ 'deb'",
            "OS_TYPE == ",
            "(OS_TYPE == 'a'",
            "'a' 'b'",
            "OS_TYPE == 'unterminated",
        ] {
            assert!(
                StepPredicateEvaluator::compile(expr).is_err(),
                "expected compile error for {expr}"
            );
        }
    }

    #[test]
    fn deep_nesting_is_rejected_instead_of_recursing() {
        let parens = format!("{}FORCE{}", "(".repeat(10_000), ")".repeat(10_000));
        let bangs = format!("{}FORCE", "!".repeat(10_000));
        for expr in [parens, bangs] {
            let err = StepPredicateEvaluator::compile(&expr).expect_err("too deep");
            assert!(
                matches!(err, ExecutionError::InvalidCondition { ref reason, .. } if reason.contains("nesting")),
                "{err}"
            );
        }

        let fine = format!("{}FORCE{}", "(".repeat(10), ")".repeat(10));
        assert!(StepPredicateEvaluator::compile(&fine).is_ok());
        assert!(check("!!!FORCE"));
    }
}
