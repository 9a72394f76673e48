//! Typed condition expressions evaluated against earlier step results.
//!
//! ```yaml
//! condition:
//!   operator: and
//!   conditions:
//!     - operator: equals
//!       left: { step_result: 0, path: status }
//!       right: completed
//!     - operator: greater_than
//!       left: { step_result: 0, path: details.freed_gb }
//!       right: 10
//! ```

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum Expr {
    Equals { left: Operand, right: Operand },
    NotEquals { left: Operand, right: Operand },
    GreaterThan { left: Operand, right: Operand },
    LessThan { left: Operand, right: Operand },
    Contains { left: Operand, right: Operand },
    And { conditions: Vec<Expr> },
    Or { conditions: Vec<Expr> },
    Not { condition: Box<Expr> },
}

/// Either a reference into the result of an earlier step or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    StepResult {
        step_result: usize,
        /// Dotted path into the result; array elements by index.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Value(Value),
}

impl Operand {
    pub fn step(index: usize, path: &str) -> Self {
        Self::StepResult {
            step_result: index,
            path: Some(path.to_string()),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }
}

/// Results of the steps completed so far, keyed `step_<index>`.
pub struct StepContext<'a> {
    results: &'a BTreeMap<String, Value>,
}

pub fn result_key(index: usize) -> String {
    format!("step_{index}")
}

impl<'a> StepContext<'a> {
    pub fn new(results: &'a BTreeMap<String, Value>) -> Self {
        Self { results }
    }

    /// Missing steps and paths resolve to `null`.
    pub fn resolve<'b>(&'b self, operand: &'b Operand) -> Cow<'b, Value> {
        match operand {
            Operand::Value(v) => Cow::Borrowed(v),
            Operand::StepResult { step_result, path } => {
                let Some(mut cur) = self.results.get(&result_key(*step_result)) else {
                    return Cow::Owned(Value::Null);
                };
                for seg in path.iter().flat_map(|p| p.split('.')).filter(|s| !s.is_empty()) {
                    let next = match cur {
                        Value::Object(map) => map.get(seg),
                        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                        _ => None,
                    };
                    match next {
                        Some(v) => cur = v,
                        None => return Cow::Owned(Value::Null),
                    }
                }
                Cow::Borrowed(cur)
            }
        }
    }
}

impl Expr {
    pub fn evaluate(&self, ctx: &StepContext<'_>) -> bool {
        match self {
            Expr::Equals { left, right } => values_equal(&ctx.resolve(left), &ctx.resolve(right)),
            Expr::NotEquals { left, right } => {
                !values_equal(&ctx.resolve(left), &ctx.resolve(right))
            }
            Expr::GreaterThan { left, right } => {
                compare(&ctx.resolve(left), &ctx.resolve(right)) == Some(Ordering::Greater)
            }
            Expr::LessThan { left, right } => {
                compare(&ctx.resolve(left), &ctx.resolve(right)) == Some(Ordering::Less)
            }
            Expr::Contains { left, right } => contains(&ctx.resolve(left), &ctx.resolve(right)),
            Expr::And { conditions } => conditions.iter().all(|c| c.evaluate(ctx)),
            Expr::Or { conditions } => conditions.iter().any(|c| c.evaluate(ctx)),
            Expr::Not { condition } => !condition.evaluate(ctx),
        }
    }

    /// Every step index this expression reads.
    pub fn step_refs(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<usize>) {
        match self {
            Expr::Equals { left, right }
            | Expr::NotEquals { left, right }
            | Expr::GreaterThan { left, right }
            | Expr::LessThan { left, right }
            | Expr::Contains { left, right } => {
                for operand in [left, right] {
                    if let Operand::StepResult { step_result, .. } = operand {
                        out.push(*step_result);
                    }
                }
            }
            Expr::And { conditions } | Expr::Or { conditions } => {
                for c in conditions {
                    c.collect_refs(out);
                }
            }
            Expr::Not { condition } => condition.collect_refs(out),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|i| values_equal(i, n)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
