//! Small evaluators used by the logic tasks
//!
//! - switch conditions: `${var} op literal` with `== != > < >= <=`
//! - dependence lists: `[{task, state}]` joined by AND or OR
//! - `${var}` placeholder substitution

use crate::model::TaskState;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

// Two-character operators first so `>=` is not read as `>`
const OPERATORS: [(&str, Operator); 6] = [
    ("==", Operator::Eq),
    ("!=", Operator::Ne),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
];

fn split_condition(expr: &str) -> Option<(&str, Operator, &str)> {
    OPERATORS.iter().find_map(|(token, op)| {
        expr.find(token)
            .map(|idx| (expr[..idx].trim(), *op, expr[idx + token.len()..].trim()))
    })
}

/// Resolve one side: `${name}` reads the pool, anything else is a literal
fn resolve<'a>(operand: &'a str, vars: &'a HashMap<String, String>) -> Option<&'a str> {
    if let Some(name) = operand.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        return vars.get(name.trim()).map(String::as_str);
    }
    let unquoted = operand
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| operand.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')))
        .unwrap_or(operand);
    Some(unquoted)
}

fn compare(lhs: &str, rhs: &str) -> Ordering {
    match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => lhs.cmp(rhs),
    }
}

/// Evaluate a switch condition against the variable pool
///
/// A reference to a missing variable, or an expression without an operator,
/// evaluates to false.
pub fn evaluate_condition(expr: &str, vars: &HashMap<String, String>) -> bool {
    let Some((lhs, op, rhs)) = split_condition(expr) else {
        return false;
    };
    let (Some(lhs), Some(rhs)) = (resolve(lhs, vars), resolve(rhs, vars)) else {
        return false;
    };
    let ordering = compare(lhs, rhs);
    match op {
        Operator::Eq => ordering == Ordering::Equal,
        Operator::Ne => ordering != Ordering::Equal,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::Lt => ordering == Ordering::Less,
        Operator::Ge => ordering != Ordering::Less,
        Operator::Le => ordering != Ordering::Greater,
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Replace `${name}` placeholders with pool values
///
/// Unknown names and anything that is not a plain `${name}` (such as a
/// `${setValue(..)}` marker) are copied through unchanged.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let name = &after[..name_len];
        match (after[name_len..].starts_with('}'), vars.get(name)) {
            (true, Some(value)) if !name.is_empty() => {
                out.push_str(value);
                rest = &after[name_len + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Relation {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependItem {
    /// Node code within the same workflow instance
    pub task: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dependence {
    #[serde(default)]
    pub relation: Relation,
    #[serde(default)]
    pub items: Vec<DependItem>,
}

impl Dependence {
    /// An empty list holds
    pub fn evaluate(&self, node_states: &HashMap<String, TaskState>) -> bool {
        let holds = |item: &DependItem| node_states.get(&item.task) == Some(&item.state);
        if self.items.is_empty() {
            return true;
        }
        match self.relation {
            Relation::And => self.items.iter().all(holds),
            Relation::Or => self.items.iter().any(holds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_numeric_and_string_comparisons() {
        let pool = vars(&[("rows", "42"), ("env", "prod")]);
        assert!(evaluate_condition("${rows} > 10", &pool));
        assert!(evaluate_condition("${rows} >= 42", &pool));
        assert!(!evaluate_condition("${rows} < 42", &pool));
        // 42 vs 9 compares numerically, not lexically
        assert!(evaluate_condition("${rows} > 9", &pool));
        assert!(evaluate_condition("${env} == \"prod\"", &pool));
        assert!(evaluate_condition("${env} != 'dev'", &pool));
        assert!(!evaluate_condition("${missing} == 1", &pool));
        assert!(!evaluate_condition("no operator", &pool));
    }

    #[test]
    fn test_substitute_keeps_unknown_placeholders() {
        let pool = vars(&[("date", "2024-01-01")]);
        assert_eq!(substitute("load ${date} ${other}", &pool), "load 2024-01-01 ${other}");
        assert_eq!(substitute("unterminated ${date", &pool), "unterminated ${date");
        assert_eq!(
            substitute("${setValue(day=${date})}", &pool),
            "${setValue(day=2024-01-01)}"
        );
    }

    #[test]
    fn test_dependence_relations() {
        let states: HashMap<String, TaskState> = [
            ("a".to_string(), TaskState::Success),
            ("b".to_string(), TaskState::Failure),
        ]
        .into_iter()
        .collect();
        let items = vec![
            DependItem { task: "a".to_string(), state: TaskState::Success },
            DependItem { task: "b".to_string(), state: TaskState::Success },
        ];

        let and = Dependence { relation: Relation::And, items: items.clone() };
        let or = Dependence { relation: Relation::Or, items };
        assert!(!and.evaluate(&states));
        assert!(or.evaluate(&states));
        assert!(Dependence::default().evaluate(&states));
    }

    #[test]
    fn test_dependence_parses_from_params() {
        let json = serde_json::json!({
            "relation": "OR",
            "items": [{"task": "extract", "state": "FAILURE"}]
        });
        let dep: Dependence = serde_json::from_value(json).unwrap();
        assert_eq!(dep.relation, Relation::Or);
        assert_eq!(dep.items[0].state, TaskState::Failure);
    }
}
