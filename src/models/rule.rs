// Rules for step conditions and custom success criteria

//! # Rule Model
//!
//! Rules gate chain steps and express custom success criteria. A rule is
//! evaluated against a single JSON document: for step conditions that is the
//! flat map of outputs produced so far (keyed by `step_<n>` and by step name);
//! for success criteria it is the run summary.
//!
//! Field names are dotted paths, so `step_1.trends.0` reaches into the first
//! element of the `trends` array produced by step 1.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive Enums
//! The `RuleCondition` enum is recursive - `And` and `Or` variants contain
//! vectors of `Rule` structs, which themselves contain `RuleCondition` enums.
//!
//! ### Serde Tag for JSON Serialization
//! `#[serde(tag = "type")]` creates flat, tagged JSON:
//! `{"type": "FieldEquals", "field": "status", "value": "approved"}`

use serde::{Deserialize, Serialize};

/// A single named rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub condition: RuleCondition,
}

/// Condition logic for a rule
///
/// ## Rust Learning Notes:
///
/// ### Box<Rule> for Recursion
/// The `Not` variant uses `Box<Rule>` because Rust enums must have a known size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleCondition {
    /// The field is present and not null
    FieldExists { field: String },

    /// The field equals the given JSON value exactly
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },

    /// The field is a number strictly greater than `value`
    FieldGreaterThan { field: String, value: f64 },

    /// The field is a number strictly less than `value`
    FieldLessThan { field: String, value: f64 },

    /// The field is a string containing `substring`, or an array containing it as an element
    FieldContains { field: String, substring: String },

    /// All nested rules pass. Empty is true.
    And { rules: Vec<Rule> },

    /// At least one nested rule passes. Empty is false.
    Or { rules: Vec<Rule> },

    /// The nested rule fails
    Not { rule: Box<Rule> },
}

/// Detailed results of rule evaluation
#[derive(Debug, Clone)]
pub struct RuleEvaluationResult {
    pub rule_id: String,
    pub passed: bool,
    /// (rule_id, passed) for each sub-rule of And/Or/Not
    pub sub_results: Vec<(String, bool)>,
    pub explanation: String,
}

/// Resolve a dotted path inside a JSON document
///
/// Array elements are addressed by their index (`items.0.name`).
pub fn lookup_path<'a>(data: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(data);
    }
    path.split('.').try_fold(data, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

impl Rule {
    /// Evaluate this rule against a JSON document
    pub fn evaluate(&self, data: &serde_json::Value) -> bool {
        self.condition.evaluate(data)
    }

    /// Evaluate with sub-results and a human-readable explanation
    pub fn evaluate_detailed(&self, data: &serde_json::Value) -> RuleEvaluationResult {
        let passed = self.evaluate(data);
        let (sub_results, explanation) = self.condition.evaluate_detailed(data);

        RuleEvaluationResult {
            rule_id: self.id.clone(),
            passed,
            sub_results,
            explanation,
        }
    }
}

impl RuleCondition {
    pub fn evaluate(&self, data: &serde_json::Value) -> bool {
        match self {
            RuleCondition::FieldExists { field } => {
                lookup_path(data, field).map_or(false, |v| !v.is_null())
            }

            RuleCondition::FieldEquals { field, value } => lookup_path(data, field) == Some(value),

            RuleCondition::FieldGreaterThan { field, value } => lookup_path(data, field)
                .and_then(|v| v.as_f64())
                .map_or(false, |v| v > *value),

            RuleCondition::FieldLessThan { field, value } => lookup_path(data, field)
                .and_then(|v| v.as_f64())
                .map_or(false, |v| v < *value),

            RuleCondition::FieldContains { field, substring } => match lookup_path(data, field) {
                Some(serde_json::Value::String(s)) => s.contains(substring.as_str()),
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(substring.as_str())),
                _ => false,
            },

            RuleCondition::And { rules } => rules.iter().all(|rule| rule.evaluate(data)),

            RuleCondition::Or { rules } => rules.iter().any(|rule| rule.evaluate(data)),

            RuleCondition::Not { rule } => !rule.evaluate(data),
        }
    }

    fn evaluate_detailed(&self, data: &serde_json::Value) -> (Vec<(String, bool)>, String) {
        match self {
            RuleCondition::FieldExists { field } => {
                let explanation = if self.evaluate(data) {
                    format!("Field '{}' exists", field)
                } else {
                    format!("Field '{}' does not exist", field)
                };
                (vec![], explanation)
            }

            RuleCondition::FieldEquals { field, value } => {
                let explanation = if self.evaluate(data) {
                    format!("Field '{}' equals {}", field, value)
                } else {
                    format!("Field '{}' does not equal {}", field, value)
                };
                (vec![], explanation)
            }

            RuleCondition::FieldGreaterThan { field, value } => {
                let explanation = match lookup_path(data, field).and_then(|v| v.as_f64()) {
                    Some(v) if v > *value => format!("Field '{}' ({}) > {}", field, v, value),
                    Some(v) => format!("Field '{}' ({}) <= {}", field, v, value),
                    None => format!("Field '{}' is not a number", field),
                };
                (vec![], explanation)
            }

            RuleCondition::FieldLessThan { field, value } => {
                let explanation = match lookup_path(data, field).and_then(|v| v.as_f64()) {
                    Some(v) if v < *value => format!("Field '{}' ({}) < {}", field, v, value),
                    Some(v) => format!("Field '{}' ({}) >= {}", field, v, value),
                    None => format!("Field '{}' is not a number", field),
                };
                (vec![], explanation)
            }

            RuleCondition::FieldContains { field, substring } => {
                let explanation = if self.evaluate(data) {
                    format!("Field '{}' contains '{}'", field, substring)
                } else {
                    format!("Field '{}' does not contain '{}'", field, substring)
                };
                (vec![], explanation)
            }

            RuleCondition::And { rules } | RuleCondition::Or { rules } => {
                let sub_results: Vec<(String, bool)> = rules
                    .iter()
                    .map(|rule| (rule.id.clone(), rule.evaluate(data)))
                    .collect();
                let label = if matches!(self, RuleCondition::And { .. }) { "AND" } else { "OR" };
                let explanation = format!(
                    "{}: {} of {} rules passed",
                    label,
                    sub_results.iter().filter(|(_, passed)| *passed).count(),
                    sub_results.len()
                );
                (sub_results, explanation)
            }

            RuleCondition::Not { rule } => {
                let passed = rule.evaluate(data);
                let explanation = format!(
                    "NOT: nested rule '{}' {}",
                    rule.id,
                    if passed { "passed (so NOT fails)" } else { "failed (so NOT passes)" }
                );
                (vec![(rule.id.clone(), !passed)], explanation)
            }
        }
    }
}

impl Rule {
    /// Rule whose description is generated from its condition
    ///
    /// ## Example:
    /// ```
    /// use agent_chain::models::Rule;
    ///
    /// let rule = Rule::field_exists("has_trends", "step_1.trends");
    /// assert_eq!(rule.description, "step_1.trends is present");
    /// ```
    pub fn new(id: impl Into<String>, condition: RuleCondition) -> Self {
        Rule {
            id: id.into(),
            description: condition.describe(),
            condition,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn field_exists(id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(id, RuleCondition::FieldExists { field: field.into() })
    }

    pub fn field_equals(id: impl Into<String>, field: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(id, RuleCondition::FieldEquals { field: field.into(), value })
    }

    pub fn field_greater_than(id: impl Into<String>, field: impl Into<String>, value: f64) -> Self {
        Self::new(id, RuleCondition::FieldGreaterThan { field: field.into(), value })
    }

    pub fn field_less_than(id: impl Into<String>, field: impl Into<String>, value: f64) -> Self {
        Self::new(id, RuleCondition::FieldLessThan { field: field.into(), value })
    }

    pub fn field_contains(id: impl Into<String>, field: impl Into<String>, substring: impl Into<String>) -> Self {
        Self::new(
            id,
            RuleCondition::FieldContains {
                field: field.into(),
                substring: substring.into(),
            },
        )
    }

    pub fn all_of(id: impl Into<String>, rules: impl IntoIterator<Item = Rule>) -> Self {
        Self::new(id, RuleCondition::And { rules: rules.into_iter().collect() })
    }

    pub fn any_of(id: impl Into<String>, rules: impl IntoIterator<Item = Rule>) -> Self {
        Self::new(id, RuleCondition::Or { rules: rules.into_iter().collect() })
    }

    pub fn negate(id: impl Into<String>, rule: Rule) -> Self {
        Self::new(id, RuleCondition::Not { rule: Box::new(rule) })
    }
}

impl RuleCondition {
    /// Short human-readable form, e.g. `step_1.score > 0.5`
    pub fn describe(&self) -> String {
        let joined = |rules: &[Rule], separator: &str| {
            rules
                .iter()
                .map(|r| format!("({})", r.description))
                .collect::<Vec<_>>()
                .join(separator)
        };
        match self {
            RuleCondition::FieldExists { field } => format!("{} is present", field),
            RuleCondition::FieldEquals { field, value } => format!("{} == {}", field, value),
            RuleCondition::FieldGreaterThan { field, value } => format!("{} > {}", field, value),
            RuleCondition::FieldLessThan { field, value } => format!("{} < {}", field, value),
            RuleCondition::FieldContains { field, substring } => format!("{} contains '{}'", field, substring),
            RuleCondition::And { rules } if rules.is_empty() => "always".to_string(),
            RuleCondition::And { rules } => joined(rules, " and "),
            RuleCondition::Or { rules } if rules.is_empty() => "never".to_string(),
            RuleCondition::Or { rules } => joined(rules, " or "),
            RuleCondition::Not { rule } => format!("not ({})", rule.description),
        }
    }
}
