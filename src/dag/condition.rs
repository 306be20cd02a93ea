// src/dag/condition.rs

//! Predicates over a predecessor's result payload, used on conditional edges.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A condition is evaluated once, when the predecessor reaches a terminal
/// state, against its result. A predecessor that did not complete never
/// satisfies a condition, negated or not.
///
/// `pointer` is a JSON pointer (RFC 6901) into the result; the empty pointer
/// selects the whole result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Condition {
    /// True whenever the predecessor completed.
    Always,
    Equals {
        #[serde(default)]
        pointer: String,
        value: Value,
    },
    NotEquals {
        #[serde(default)]
        pointer: String,
        value: Value,
    },
    Exists {
        #[serde(default)]
        pointer: String,
    },
    /// Present and not `null`, `false`, `0`, `""`, `[]` or `{}`.
    Truthy {
        #[serde(default)]
        pointer: String,
    },
    /// String value (or the JSON text of a non-string) matches the regex.
    Matches {
        #[serde(default)]
        pointer: String,
        pattern: String,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

impl Condition {
    pub fn equals(pointer: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals {
            pointer: pointer.into(),
            value: value.into(),
        }
    }

    pub fn truthy(pointer: impl Into<String>) -> Self {
        Condition::Truthy {
            pointer: pointer.into(),
        }
    }

    pub fn exists(pointer: impl Into<String>) -> Self {
        Condition::Exists {
            pointer: pointer.into(),
        }
    }

    pub fn negate(self) -> Self {
        Condition::Not {
            condition: Box::new(self),
        }
    }

    /// Evaluate against the predecessor's result; `None` means the
    /// predecessor did not complete.
    pub fn evaluate(&self, result: Option<&Value>) -> bool {
        match result {
            Some(result) => self.holds(result),
            None => false,
        }
    }

    fn holds(&self, result: &Value) -> bool {
        match self {
            Condition::Always => true,
            Condition::Equals { pointer, value } => result.pointer(pointer) == Some(value),
            Condition::NotEquals { pointer, value } => result.pointer(pointer) != Some(value),
            Condition::Exists { pointer } => result.pointer(pointer).is_some(),
            Condition::Truthy { pointer } => result.pointer(pointer).is_some_and(is_truthy),
            Condition::Matches { pointer, pattern } => {
                let Some(found) = result.pointer(pointer) else {
                    return false;
                };
                match Regex::new(pattern) {
                    Ok(re) => match found {
                        Value::String(s) => re.is_match(s),
                        other => re.is_match(&other.to_string()),
                    },
                    Err(err) => {
                        warn!(%pattern, error = %err, "invalid regex in condition; treating as false");
                        false
                    }
                }
            }
            Condition::All { conditions } => conditions.iter().all(|c| c.holds(result)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.holds(result)),
            Condition::Not { condition } => !condition.holds(result),
        }
    }

    /// Check pointers and regexes up front, so a bad condition is rejected
    /// when the edge is added rather than silently evaluating to false.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Condition::Always => Ok(()),
            Condition::Equals { pointer, .. }
            | Condition::NotEquals { pointer, .. }
            | Condition::Exists { pointer }
            | Condition::Truthy { pointer } => validate_pointer(pointer),
            Condition::Matches { pointer, pattern } => {
                validate_pointer(pointer)?;
                Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| format!("invalid regex {pattern:?}: {e}"))
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().try_for_each(Condition::validate)
            }
            Condition::Not { condition } => condition.validate(),
        }
    }
}

fn validate_pointer(pointer: &str) -> Result<(), String> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(format!("JSON pointer {pointer:?} must be empty or start with '/'"))
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pointer_conditions() {
        let result = json!({"approved": true, "score": 0, "label": "needs-review"});

        assert!(Condition::equals("/approved", true).evaluate(Some(&result)));
        assert!(!Condition::truthy("/score").evaluate(Some(&result)));
        assert!(Condition::exists("/score").evaluate(Some(&result)));
        assert!(!Condition::exists("/missing").evaluate(Some(&result)));

        let matches = Condition::Matches {
            pointer: "/label".into(),
            pattern: "^needs-".into(),
        };
        assert!(matches.evaluate(Some(&result)));
    }

    #[test]
    fn nothing_holds_without_a_result() {
        assert!(!Condition::Always.evaluate(None));
        assert!(!Condition::truthy("").evaluate(None));
        assert!(!Condition::truthy("").negate().evaluate(None));
        assert!(Condition::truthy("/x").negate().evaluate(Some(&json!({}))));
    }

    #[test]
    fn combinators() {
        let result = json!({"a": 1, "b": "x"});
        let both = Condition::All {
            conditions: vec![Condition::equals("/a", 1), Condition::exists("/b")],
        };
        let either = Condition::Any {
            conditions: vec![Condition::equals("/a", 2), Condition::exists("/c")],
        };
        assert!(both.evaluate(Some(&result)));
        assert!(!either.evaluate(Some(&result)));
    }

    #[test]
    fn validate_rejects_bad_pointer_and_regex() {
        assert!(Condition::exists("approved").validate().is_err());
        let bad = Condition::Matches {
            pointer: String::new(),
            pattern: "(".into(),
        };
        assert!(bad.validate().is_err());
        assert!(Condition::truthy("/ok").negate().validate().is_ok());
    }

    #[test]
    fn deserializes_tagged_form() {
        let cond: Condition =
            serde_json::from_value(json!({"op": "equals", "pointer": "/ok", "value": true}))
                .unwrap();
        assert_eq!(cond, Condition::equals("/ok", true));
    }
}
