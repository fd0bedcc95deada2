//! Lowering of a query tree into parameterised SQL over the four AGN relations.
//!
//! Every rule becomes one predicate. Rules on source fields test the source row
//! directly; rules on photometry, redshift or classification fields become a
//! correlated `EXISTS` over that relation, so each such rule is satisfied when
//! *any* related row satisfies it. Two child rules joined by `and` are checked
//! independently and may be satisfied by different related rows.
//!
//! Result rows carry one row per source. Child columns are taken from the
//! related row with the lowest key, which is also the row used when sorting by
//! a child field.

use std::sync::Arc;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{FieldCatalog, ValueType};
use crate::error::Result;
use crate::query::{Operand, Operator, QueryGroup, QueryNode, QueryRule};

const MATCH_ALL: &str = "1 = 1";
const MATCH_NONE: &str = "1 = 0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    #[serde(rename = "asc", alias = "ASC")]
    Asc,
    #[serde(rename = "desc", alias = "DESC")]
    Desc,
}
impl SortDirection {
    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}
impl SortSpec {
    pub fn new(field: &str, direction: SortDirection) -> Self {
        Self { field: field.to_string(), direction }
    }
}

/// A translated query, ready for the executor.
#[derive(Debug, Clone)]
pub struct ExecutableQuery {
    /// Projected, ordered rows without any limit.
    pub select_sql: String,
    /// Number of matching sources.
    pub count_sql: String,
    /// Positional parameters shared by both statements.
    pub params: Vec<Value>,
    /// Field names of the projected columns, in catalog order.
    pub columns: Arc<[String]>,
}

pub struct Translator<'c> {
    catalog: &'c FieldCatalog,
}

impl<'c> Translator<'c> {
    pub fn new(catalog: &'c FieldCatalog) -> Self {
        Self { catalog }
    }

    pub fn translate(&self, tree: &QueryGroup, sort: Option<&SortSpec>) -> Result<ExecutableQuery> {
        let mut params = Vec::new();
        let filter = self.lower_group(tree, &mut params)?;
        let order = self.order_by(sort)?;

        let fields = self.catalog.list_fields();
        let projection = fields
            .iter()
            .map(|f| format!("{}.{}", f.entity.alias(), f.column))
            .collect::<Vec<_>>()
            .join(", ");
        let mut from = String::from("source_agn s");
        for entity in self.catalog.entities().into_iter().filter(|e| e.is_child()) {
            let (table, alias, key) = (entity.table(), entity.alias(), entity.key_column());
            from.push_str(&format!(
                " LEFT JOIN {table} {alias} ON {alias}.{key} = (SELECT MIN(r.{key}) FROM {table} r WHERE r.agn_id = s.agn_id)"
            ));
        }

        let select_sql = format!("SELECT {projection} FROM {from} WHERE {filter} ORDER BY {order}");
        let count_sql = format!("SELECT COUNT(*) FROM source_agn s WHERE {filter}");
        debug!(sql = %select_sql, params = params.len(), "translated query");
        Ok(ExecutableQuery {
            select_sql,
            count_sql,
            params,
            columns: self.catalog.field_names().into(),
        })
    }

    fn lower_group(&self, group: &QueryGroup, params: &mut Vec<Value>) -> Result<String> {
        if group.is_empty() {
            return Ok(MATCH_ALL.to_string());
        }
        let mut parts = Vec::with_capacity(group.rules.len());
        for node in &group.rules {
            parts.push(match node {
                QueryNode::Rule(rule) => self.lower_rule(rule, params)?,
                QueryNode::Group(nested) => self.lower_group(nested, params)?,
            });
        }
        Ok(format!("({})", parts.join(group.combinator.sql())))
    }

    fn lower_rule(&self, rule: &QueryRule, params: &mut Vec<Value>) -> Result<String> {
        let field = self.catalog.get_field(&rule.field)?;
        let operand = rule.operand(field)?;
        let child = field.entity.is_child();
        let column = if child {
            format!("e.{}", field.column)
        } else {
            format!("s.{}", field.column)
        };
        let text = field.value_type != ValueType::Number;
        let predicate = match predicate(&column, rule.operator, operand, text, params) {
            Some(sql) => sql,
            // empty in/notIn lists decide the rule on their own
            None if rule.operator == Operator::In => return Ok(MATCH_NONE.to_string()),
            None => return Ok(MATCH_ALL.to_string()),
        };
        if !child {
            return Ok(predicate);
        }
        let table = field.entity.table();
        let related = format!("SELECT 1 FROM {table} e WHERE e.agn_id = s.agn_id");
        if rule.operator == Operator::Null {
            // a source without related rows has no value either
            Ok(format!("(EXISTS ({related} AND {predicate}) OR NOT EXISTS ({related}))"))
        } else {
            Ok(format!("EXISTS ({related} AND {predicate})"))
        }
    }

    fn order_by(&self, sort: Option<&SortSpec>) -> Result<String> {
        let Some(sort) = sort else {
            return Ok("s.agn_id ASC".to_string());
        };
        let field = self.catalog.get_field(&sort.field)?;
        let column = format!("{}.{}", field.entity.alias(), field.column);
        let collate = if field.value_type == ValueType::Number { "" } else { " COLLATE NOCASE" };
        // nulls last in both directions, agn_id keeps pages stable
        Ok(format!(
            "{column} IS NULL, {column}{collate} {}, s.agn_id ASC",
            sort.direction.sql()
        ))
    }
}

/// SQL for one comparison, or `None` for an empty `in`/`notIn` list.
fn predicate(
    column: &str,
    operator: Operator,
    operand: Operand,
    text: bool,
    params: &mut Vec<Value>,
) -> Option<String> {
    let collate = if text { " COLLATE NOCASE" } else { "" };
    let sql = match operator {
        Operator::Equals => {
            params.push(scalar(operand));
            format!("{column} = ?{collate}")
        }
        Operator::NotEquals => {
            params.push(scalar(operand));
            format!("{column} <> ?{collate}")
        }
        Operator::GreaterThan => {
            params.push(scalar(operand));
            format!("{column} > ?")
        }
        Operator::LessThan => {
            params.push(scalar(operand));
            format!("{column} < ?")
        }
        Operator::GreaterThanOrEqual => {
            params.push(scalar(operand));
            format!("{column} >= ?")
        }
        Operator::LessThanOrEqual => {
            params.push(scalar(operand));
            format!("{column} <= ?")
        }
        Operator::Contains | Operator::BeginsWith | Operator::EndsWith => {
            let needle = match operand {
                Operand::Text(t) => escape_like(&t),
                other => escape_like(&scalar_text(other)),
            };
            let pattern = match operator {
                Operator::Contains => format!("%{needle}%"),
                Operator::BeginsWith => format!("{needle}%"),
                _ => format!("%{needle}"),
            };
            params.push(Value::Text(pattern));
            // LIKE ignores ASCII case on its own
            format!("{column} LIKE ? ESCAPE '!'")
        }
        Operator::Null => format!("{column} IS NULL"),
        Operator::NotNull => format!("{column} IS NOT NULL"),
        Operator::In | Operator::NotIn => {
            let values = list(operand);
            if values.is_empty() {
                return None;
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            params.extend(values);
            let negate = if operator == Operator::NotIn { "NOT " } else { "" };
            format!("{column}{collate} {negate}IN ({placeholders})")
        }
    };
    Some(sql)
}

fn scalar(operand: Operand) -> Value {
    match operand {
        Operand::Number(n) => Value::Real(n),
        Operand::Text(t) => Value::Text(t),
        other => Value::Text(scalar_text(other)),
    }
}

fn scalar_text(operand: Operand) -> String {
    match operand {
        Operand::Number(n) => n.to_string(),
        Operand::Text(t) => t,
        _ => String::new(),
    }
}

fn list(operand: Operand) -> Vec<Value> {
    match operand {
        Operand::Numbers(ns) => ns.into_iter().map(Value::Real).collect(),
        Operand::Texts(ts) => ts.into_iter().map(Value::Text).collect(),
        Operand::None => Vec::new(),
        single => vec![scalar(single)],
    }
}

pub fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        match c {
            '!' | '%' | '_' => {
                out.push('!');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
