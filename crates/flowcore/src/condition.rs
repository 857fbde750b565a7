//! Rule evaluation for Condition nodes
//!
//! A condition node carries an ordered list of rules in its config:
//!
//! ```json
//! {
//!   "rules": [
//!     {"label": "urgent", "field": "classification.severity", "op": "eq", "value": "high"},
//!     {"label": "review", "field": "score", "op": "lt", "value": 0.4}
//!   ],
//!   "default": "archive"
//! }
//! ```
//!
//! The first matching rule picks the outgoing edge label.

use crate::value::lookup;
use crate::{NodeError, Value, Variables};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
    Truthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRule {
    pub label: String,
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSpec {
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
    #[serde(default)]
    pub default: Option<String>,
}

impl ConditionSpec {
    pub fn from_config(config: &HashMap<String, Value>) -> Result<Self, NodeError> {
        let json = Value::Object(config.clone()).to_json();
        serde_json::from_value(json)
            .map_err(|e| NodeError::Configuration(format!("Invalid condition rules: {}", e)))
    }

    /// Every label the rules can produce
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .map(|r| r.label.as_str())
            .chain(self.default.as_deref())
    }

    /// Label of the first matching rule, or the default
    pub fn evaluate(&self, vars: &Variables) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(vars))
            .map(|rule| rule.label.as_str())
            .or(self.default.as_deref())
    }
}

impl ConditionRule {
    pub fn matches(&self, vars: &Variables) -> bool {
        let actual = lookup(vars, &self.field);
        let expected = self.value.as_ref().unwrap_or(&Value::Null);

        match self.op {
            Operator::Exists => actual.is_some_and(|v| !v.is_null()),
            Operator::Truthy => actual.is_some_and(Value::is_truthy),
            Operator::Eq => actual.unwrap_or(&Value::Null) == expected,
            Operator::Ne => actual.unwrap_or(&Value::Null) != expected,
            Operator::Gt => compare(actual, expected) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(actual, expected) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => match (actual, expected) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
        }
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: serde_json::Value) -> ConditionSpec {
        let config = match Value::from(json) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        ConditionSpec::from_config(&config).unwrap()
    }

    fn vars(json: serde_json::Value) -> Variables {
        match Value::from(json) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let spec = spec(serde_json::json!({
            "rules": [
                {"label": "urgent", "field": "severity", "op": "eq", "value": "high"},
                {"label": "scored", "field": "score", "op": "gte", "value": 0.5}
            ],
            "default": "archive"
        }));

        assert_eq!(spec.evaluate(&vars(serde_json::json!({"severity": "high", "score": 0.9}))), Some("urgent"));
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"severity": "low", "score": 0.5}))), Some("scored"));
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"severity": "low"}))), Some("archive"));
    }

    #[test]
    fn no_match_without_default_is_none() {
        let spec = spec(serde_json::json!({
            "rules": [{"label": "tagged", "field": "tags", "op": "contains", "value": "election"}]
        }));
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"tags": ["sport"]}))), None);
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"tags": ["election"]}))), Some("tagged"));
    }

    #[test]
    fn exists_and_truthy_on_nested_fields() {
        let spec = spec(serde_json::json!({
            "rules": [
                {"label": "has_author", "field": "article.author", "op": "exists"},
                {"label": "flagged", "field": "flagged", "op": "truthy"}
            ]
        }));
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"article": {"author": "x"}}))), Some("has_author"));
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"flagged": 1}))), Some("flagged"));
        assert_eq!(spec.evaluate(&vars(serde_json::json!({"flagged": ""}))), None);
    }

    #[test]
    fn malformed_rules_are_configuration_errors() {
        let mut config = HashMap::new();
        config.insert("rules".to_string(), Value::from("not a list"));
        assert!(matches!(
            ConditionSpec::from_config(&config),
            Err(NodeError::Configuration(_))
        ));
    }
}
