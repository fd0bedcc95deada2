//! The query tree: a recursive boolean filter of rules and groups, in the wire
//! shape produced by the portal's query builder.
//!
//! ```json
//! {"combinator": "and", "rules": [
//!     {"field": "declination", "operator": "greaterThan", "value": "0"},
//!     {"combinator": "or", "rules": [ ... ]}
//! ]}
//! ```
//!
//! Rule values are a tagged union ([`RuleValue`]) and are checked against the
//! field catalog into a typed [`Operand`] before anything reaches the store.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::catalog::{FieldCatalog, FieldDescriptor, ValueType};
use crate::error::{PortalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Combinator {
    #[default]
    #[serde(rename = "and", alias = "AND", alias = "And")]
    And,
    #[serde(rename = "or", alias = "OR", alias = "Or")]
    Or,
}
impl Combinator {
    pub fn sql(&self) -> &'static str {
        match self {
            Combinator::And => " AND ",
            Combinator::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "equals", alias = "=")]
    Equals,
    #[serde(rename = "notEquals", alias = "!=")]
    NotEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "beginsWith")]
    BeginsWith,
    #[serde(rename = "endsWith")]
    EndsWith,
    #[serde(rename = "greaterThan", alias = ">")]
    GreaterThan,
    #[serde(rename = "lessThan", alias = "<")]
    LessThan,
    #[serde(rename = "greaterThanOrEqual", alias = ">=", alias = "greaterThanOrEquals")]
    GreaterThanOrEqual,
    #[serde(rename = "lessThanOrEqual", alias = "<=", alias = "lessThanOrEquals")]
    LessThanOrEqual,
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "notNull")]
    NotNull,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notIn")]
    NotIn,
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::Contains,
        Operator::BeginsWith,
        Operator::EndsWith,
        Operator::GreaterThan,
        Operator::LessThan,
        Operator::GreaterThanOrEqual,
        Operator::LessThanOrEqual,
        Operator::Null,
        Operator::NotNull,
        Operator::In,
        Operator::NotIn,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "notEquals",
            Operator::Contains => "contains",
            Operator::BeginsWith => "beginsWith",
            Operator::EndsWith => "endsWith",
            Operator::GreaterThan => "greaterThan",
            Operator::LessThan => "lessThan",
            Operator::GreaterThanOrEqual => "greaterThanOrEqual",
            Operator::LessThanOrEqual => "lessThanOrEqual",
            Operator::Null => "null",
            Operator::NotNull => "notNull",
            Operator::In => "in",
            Operator::NotIn => "notIn",
        }
    }

    /// Whether the operator may be used on a field of the given type.
    pub fn applies_to(&self, value_type: ValueType) -> bool {
        match self {
            Operator::Contains | Operator::BeginsWith | Operator::EndsWith => {
                value_type == ValueType::String
            }
            Operator::GreaterThan
            | Operator::LessThan
            | Operator::GreaterThanOrEqual
            | Operator::LessThanOrEqual => value_type == ValueType::Number,
            _ => true,
        }
    }

    /// Operators offered for a field type, in display order.
    pub fn for_type(value_type: ValueType) -> Vec<Operator> {
        Self::ALL.into_iter().filter(|o| o.applies_to(value_type)).collect()
    }

    pub fn takes_value(&self) -> bool {
        !matches!(self, Operator::Null | Operator::NotNull)
    }

    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(t) => f.write_str(t),
        }
    }
}

/// The value of a rule as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    #[default]
    None,
    Number(f64),
    Text(String),
    List(Vec<Scalar>),
}

impl RuleValue {
    /// Missing values and blank strings both count as "no value".
    pub fn is_blank(&self) -> bool {
        match self {
            RuleValue::None => true,
            RuleValue::Text(t) => t.trim().is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for RuleValue {
    fn from(value: &str) -> Self {
        RuleValue::Text(value.to_string())
    }
}
impl From<f64> for RuleValue {
    fn from(value: f64) -> Self {
        RuleValue::Number(value)
    }
}
impl From<Vec<&str>> for RuleValue {
    fn from(values: Vec<&str>) -> Self {
        RuleValue::List(values.into_iter().map(|v| Scalar::Text(v.to_string())).collect())
    }
}

/// A rule value checked against its field's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Number(f64),
    Text(String),
    Numbers(Vec<f64>),
    Texts(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRule {
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "RuleValue::is_blank")]
    pub value: RuleValue,
}

impl QueryRule {
    pub fn new(field: &str, operator: Operator, value: impl Into<RuleValue>) -> Self {
        Self { field: field.to_string(), operator, value: value.into() }
    }

    /// A rule for the value-less operators `null` and `notNull`.
    pub fn bare(field: &str, operator: Operator) -> Self {
        Self { field: field.to_string(), operator, value: RuleValue::None }
    }

    /// Checks the operator against the field's type and converts the value.
    pub fn operand(&self, field: &FieldDescriptor) -> Result<Operand> {
        if !self.operator.applies_to(field.value_type) {
            return Err(self.mismatch(format!(
                "the operator does not apply to {} fields",
                type_name(field.value_type)
            )));
        }
        if !self.operator.takes_value() {
            return if self.value.is_blank() {
                Ok(Operand::None)
            } else {
                Err(self.mismatch("the operator takes no value".into()))
            };
        }
        if self.value.is_blank() {
            return Err(self.empty());
        }
        if self.operator.takes_list() {
            let items = match &self.value {
                RuleValue::List(items) => items.clone(),
                RuleValue::Text(text) => text
                    .split(',')
                    .map(str::trim)
                    .filter(|piece| !piece.is_empty())
                    .map(|piece| Scalar::Text(piece.to_string()))
                    .collect(),
                RuleValue::Number(n) => vec![Scalar::Number(*n)],
                RuleValue::None => Vec::new(),
            };
            return match field.value_type {
                ValueType::Number => items
                    .iter()
                    .map(|item| self.number(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Operand::Numbers),
                _ => Ok(Operand::Texts(items.iter().map(|item| item.to_string()).collect())),
            };
        }
        let scalar = match &self.value {
            RuleValue::Number(n) => Scalar::Number(*n),
            RuleValue::Text(t) => Scalar::Text(t.clone()),
            RuleValue::List(_) => return Err(self.mismatch("the operator expects a single value, not a list".into())),
            RuleValue::None => return Err(self.empty()),
        };
        match field.value_type {
            ValueType::Number => self.number(&scalar).map(Operand::Number),
            _ => Ok(Operand::Text(scalar.to_string())),
        }
    }

    fn number(&self, scalar: &Scalar) -> Result<f64> {
        let parsed = match scalar {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(t) => t.trim().parse::<f64>().ok(),
        };
        match parsed {
            Some(n) if n.is_finite() => Ok(n),
            _ => Err(self.mismatch(format!("`{scalar}` is not a number"))),
        }
    }

    fn empty(&self) -> PortalError {
        PortalError::EmptyValue {
            field: self.field.clone(),
            operator: self.operator.name().to_string(),
        }
    }

    fn mismatch(&self, reason: String) -> PortalError {
        PortalError::OperatorTypeMismatch {
            field: self.field.clone(),
            operator: self.operator.name().to_string(),
            reason,
        }
    }
}

fn type_name(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::Number => "number",
        ValueType::String => "string",
        ValueType::Enum => "enum",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryGroup {
    #[serde(default)]
    pub combinator: Combinator,
    pub rules: Vec<QueryNode>,
}

impl Default for QueryGroup {
    fn default() -> Self {
        Self::new(Combinator::And)
    }
}

impl QueryGroup {
    pub fn new(combinator: Combinator) -> Self {
        Self { combinator, rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: QueryRule) -> Self {
        self.rules.push(QueryNode::Rule(rule));
        self
    }

    pub fn with_group(mut self, group: QueryGroup) -> Self {
        self.rules.push(QueryNode::Group(group));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules in the whole tree.
    pub fn rule_count(&self) -> usize {
        self.rules
            .iter()
            .map(|node| match node {
                QueryNode::Rule(_) => 1,
                QueryNode::Group(group) => group.rule_count(),
            })
            .sum()
    }

    /// Validates every rule of the tree against the catalog.
    pub fn validate(&self, catalog: &FieldCatalog) -> Result<()> {
        for node in &self.rules {
            match node {
                QueryNode::Rule(rule) => {
                    rule.operand(catalog.get_field(&rule.field)?)?;
                }
                QueryNode::Group(group) => group.validate(catalog)?,
            }
        }
        Ok(())
    }

    /// Combines a previous query with a new one under a new `or` root. The
    /// children of an `or` root or of a single-rule root move up as they are;
    /// any other root keeps its meaning by becoming a nested group.
    pub fn merge_or(previous: QueryGroup, next: QueryGroup) -> QueryGroup {
        let mut rules = Vec::new();
        for root in [previous, next] {
            if !root.is_empty() && (root.combinator == Combinator::Or || root.rules.len() == 1) {
                rules.extend(root.rules);
            } else {
                rules.push(QueryNode::Group(root));
            }
        }
        QueryGroup { combinator: Combinator::Or, rules }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryNode {
    Rule(QueryRule),
    Group(QueryGroup),
}

// Nodes carrying `rules` are groups. Deciding up front keeps serde's error for
// a bad rule (say an unknown operator) instead of a generic untagged failure.
impl<'de> Deserialize<'de> for QueryNode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("rules").is_some() {
            serde_json::from_value(value).map(QueryNode::Group).map_err(de::Error::custom)
        } else {
            serde_json::from_value(value).map(QueryNode::Rule).map_err(de::Error::custom)
        }
    }
}
