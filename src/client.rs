//! State behind the portal's query builder and result grid.
//!
//! Nodes of the tree being edited are addressed by paths of child indices
//! from the root: `[]` is the root group, `[1, 0]` the first child of the
//! group that is the root's second child. Column visibility and grid sorting
//! are display state only and never touch the query tree.

use std::cmp::Ordering;

use crate::catalog::FieldCatalog;
use crate::datatype::{CellValue, ResultRow};
use crate::error::{PortalError, Result};
use crate::query::{Combinator, Operator, QueryGroup, QueryNode, QueryRule};
use crate::translate::SortDirection;

pub struct QueryBuilder<'c> {
    catalog: &'c FieldCatalog,
    root: QueryGroup,
}

impl<'c> QueryBuilder<'c> {
    pub fn new(catalog: &'c FieldCatalog) -> Self {
        Self { catalog, root: QueryGroup::default() }
    }

    pub fn root(&self) -> &QueryGroup {
        &self.root
    }

    /// Operators offered for a field.
    pub fn operators_for(&self, field: &str) -> Result<Vec<Operator>> {
        Ok(Operator::for_type(self.catalog.get_field(field)?.value_type))
    }

    /// Appends a rule to the group at `path` and returns the new rule's path.
    /// The value may still be blank while the user is editing.
    pub fn add_rule(&mut self, path: &[usize], rule: QueryRule) -> Result<Vec<usize>> {
        self.check_operator(&rule)?;
        let group = self.group_mut(path)?;
        group.rules.push(QueryNode::Rule(rule));
        Ok(child_path(path, group.rules.len() - 1))
    }

    /// Appends an empty group to the group at `path` and returns its path.
    pub fn add_group(&mut self, path: &[usize], combinator: Combinator) -> Result<Vec<usize>> {
        let group = self.group_mut(path)?;
        group.rules.push(QueryNode::Group(QueryGroup::new(combinator)));
        Ok(child_path(path, group.rules.len() - 1))
    }

    /// Removes the rule or group at `path`. The root itself cannot be removed.
    pub fn remove(&mut self, path: &[usize]) -> Result<QueryNode> {
        let Some((&last, parent)) = path.split_last() else {
            return Err(PortalError::InvalidPath(path.to_vec()));
        };
        let group = self.group_mut(parent)?;
        if last >= group.rules.len() {
            return Err(PortalError::InvalidPath(path.to_vec()));
        }
        Ok(group.rules.remove(last))
    }

    pub fn set_combinator(&mut self, path: &[usize], combinator: Combinator) -> Result<()> {
        self.group_mut(path)?.combinator = combinator;
        Ok(())
    }

    /// Replaces the rule at `path`.
    pub fn update_rule(&mut self, path: &[usize], rule: QueryRule) -> Result<()> {
        self.check_operator(&rule)?;
        match self.node_mut(path)? {
            QueryNode::Rule(existing) => {
                *existing = rule;
                Ok(())
            }
            QueryNode::Group(_) => Err(PortalError::InvalidPath(path.to_vec())),
        }
    }

    /// The tree to submit, fully validated.
    pub fn build(&self) -> Result<QueryGroup> {
        self.root.validate(self.catalog)?;
        Ok(self.root.clone())
    }

    fn check_operator(&self, rule: &QueryRule) -> Result<()> {
        let field = self.catalog.get_field(&rule.field)?;
        if rule.operator.applies_to(field.value_type) {
            Ok(())
        } else {
            Err(PortalError::OperatorTypeMismatch {
                field: rule.field.clone(),
                operator: rule.operator.name().to_string(),
                reason: "the operator is not offered for this field".into(),
            })
        }
    }

    fn group_mut(&mut self, path: &[usize]) -> Result<&mut QueryGroup> {
        let mut group = &mut self.root;
        for &index in path {
            group = match group.rules.get_mut(index) {
                Some(QueryNode::Group(child)) => child,
                _ => return Err(PortalError::InvalidPath(path.to_vec())),
            };
        }
        Ok(group)
    }

    fn node_mut(&mut self, path: &[usize]) -> Result<&mut QueryNode> {
        let Some((&last, parent)) = path.split_last() else {
            return Err(PortalError::InvalidPath(path.to_vec()));
        };
        self.group_mut(parent)?
            .rules
            .get_mut(last)
            .ok_or_else(|| PortalError::InvalidPath(path.to_vec()))
    }
}

fn child_path(parent: &[usize], index: usize) -> Vec<usize> {
    let mut path = parent.to_vec();
    path.push(index);
    path
}

/// Which result columns are shown. One flag per catalog field is the only
/// state; checkboxes and the grid both read it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnVisibility {
    columns: Vec<(String, bool)>,
}

impl ColumnVisibility {
    pub fn new(catalog: &FieldCatalog) -> Self {
        Self { columns: catalog.field_names().into_iter().map(|name| (name, true)).collect() }
    }

    pub fn set(&mut self, field: &str, visible: bool) -> Result<()> {
        let entry = self
            .columns
            .iter_mut()
            .find(|(name, _)| name == field)
            .ok_or_else(|| PortalError::UnknownField(field.to_string()))?;
        entry.1 = visible;
        Ok(())
    }

    pub fn toggle(&mut self, field: &str) -> Result<bool> {
        let visible = !self.is_visible(field)?;
        self.set(field, visible)?;
        Ok(visible)
    }

    pub fn show_all(&mut self) {
        self.columns.iter_mut().for_each(|(_, visible)| *visible = true);
    }

    pub fn hide_all(&mut self) {
        self.columns.iter_mut().for_each(|(_, visible)| *visible = false);
    }

    pub fn is_visible(&self, field: &str) -> Result<bool> {
        self.columns
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, visible)| *visible)
            .ok_or_else(|| PortalError::UnknownField(field.to_string()))
    }

    /// Visible columns in catalog order.
    pub fn visible_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, visible)| *visible)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Local ordering of the rows already on screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridSort {
    pub column: Option<String>,
    pub direction: SortDirection,
}

impl GridSort {
    /// Clicking a column sorts ascending; clicking it again flips the direction.
    pub fn click(&mut self, column: &str) {
        if self.column.as_deref() == Some(column) {
            self.direction = match self.direction {
                SortDirection::Asc => SortDirection::Desc,
                SortDirection::Desc => SortDirection::Asc,
            };
        } else {
            self.column = Some(column.to_string());
            self.direction = SortDirection::Asc;
        }
    }

    /// Sorts rows in place, nulls last in either direction. Stable, so equal
    /// values keep their server order.
    pub fn apply(&self, rows: &mut [ResultRow]) {
        let Some(column) = &self.column else {
            return;
        };
        rows.sort_by(|a, b| {
            let (x, y) = (a.get(column), b.get(column));
            match (x.is_none_or(CellValue::is_null), y.is_none_or(CellValue::is_null)) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ordering = compare_cells(x, y);
                    match self.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                }
            }
        });
    }
}

fn compare_cells(x: Option<&CellValue>, y: Option<&CellValue>) -> Ordering {
    match (x, y) {
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(m), Some(n)) => m.total_cmp(&n),
            _ => a.to_string().to_lowercase().cmp(&b.to_string().to_lowercase()),
        },
        _ => Ordering::Equal,
    }
}

/// What to do with a new query while earlier results are still shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resubmission {
    Replace,
    CombineOr,
}

/// Tracks the last submitted query and whether its results are on screen.
#[derive(Debug, Clone, Default)]
pub struct SearchSession {
    last: Option<QueryGroup>,
    has_results: bool,
}

impl SearchSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether submitting now requires a [`Resubmission`] choice.
    pub fn needs_choice(&self) -> bool {
        self.has_results && self.last.is_some()
    }

    /// Returns the tree to send for `next`.
    pub fn submit(&mut self, next: QueryGroup, choice: Option<Resubmission>) -> Result<QueryGroup> {
        let tree = if self.needs_choice() {
            match (choice, self.last.take()) {
                (Some(Resubmission::CombineOr), Some(previous)) => QueryGroup::merge_or(previous, next),
                (Some(Resubmission::Replace), _) => next,
                (None, previous) => {
                    self.last = previous;
                    return Err(PortalError::Malformed(
                        "results are shown; choose to replace them or to combine the queries".into(),
                    ));
                }
                (Some(Resubmission::CombineOr), None) => next,
            }
        } else {
            next
        };
        self.last = Some(tree.clone());
        self.has_results = false;
        Ok(tree)
    }

    pub fn record_results(&mut self, total: u64) {
        self.has_results = total > 0;
    }

    pub fn current(&self) -> Option<&QueryGroup> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn builds_nested_trees_by_path() {
        let catalog = FieldCatalog::agn();
        let mut builder = QueryBuilder::new(&catalog);
        builder.add_rule(&[], QueryRule::new("declination", Operator::GreaterThan, "0")).unwrap();
        let group = builder.add_group(&[], Combinator::Or).unwrap();
        assert_eq!(group, vec![1]);
        builder.add_rule(&group, QueryRule::new("best_class", Operator::Equals, "Quasar")).unwrap();
        let z = builder.add_rule(&group, QueryRule::new("z_value", Operator::GreaterThanOrEqual, "")).unwrap();
        assert_eq!(z, vec![1, 1]);
        assert!(matches!(builder.build(), Err(PortalError::EmptyValue { .. })));
        builder.update_rule(&z, QueryRule::new("z_value", Operator::GreaterThanOrEqual, "2.5")).unwrap();
        assert_eq!(builder.build().unwrap().rule_count(), 3);
        builder.set_combinator(&[], Combinator::Or).unwrap();
        assert_eq!(builder.root().combinator, Combinator::Or);
    }

    #[test]
    fn rejects_bad_paths_and_operators() {
        let catalog = FieldCatalog::agn();
        let mut builder = QueryBuilder::new(&catalog);
        builder.add_rule(&[], QueryRule::bare("ra", Operator::NotNull)).unwrap();
        assert!(matches!(builder.add_rule(&[0], QueryRule::bare("ra", Operator::Null)), Err(PortalError::InvalidPath(_))));
        assert!(matches!(builder.remove(&[]), Err(PortalError::InvalidPath(_))));
        assert!(matches!(builder.remove(&[3]), Err(PortalError::InvalidPath(_))));
        assert!(matches!(
            builder.add_rule(&[], QueryRule::new("best_class", Operator::Contains, "Q")),
            Err(PortalError::OperatorTypeMismatch { .. })
        ));
        assert!(matches!(builder.remove(&[0]).unwrap(), QueryNode::Rule(_)));
        assert!(builder.root().is_empty());
    }

    #[test]
    fn operator_choices_follow_field_type() {
        let catalog = FieldCatalog::agn();
        let builder = QueryBuilder::new(&catalog);
        assert!(builder.operators_for("mag_value").unwrap().contains(&Operator::LessThan));
        assert!(!builder.operators_for("filter_name").unwrap().contains(&Operator::LessThan));
        assert!(builder.operators_for("filter_name").unwrap().contains(&Operator::EndsWith));
    }

    #[test]
    fn hide_all_hides_identity_columns_too() {
        let catalog = FieldCatalog::agn();
        let mut columns = ColumnVisibility::new(&catalog);
        columns.hide_all();
        assert!(columns.visible_columns().is_empty());
        assert!(!columns.is_visible("agn_id").unwrap());
        columns.set("ra", true).unwrap();
        assert_eq!(columns.visible_columns(), vec!["ra"]);
        assert!(columns.toggle("agn_id").unwrap());
        assert_eq!(columns.visible_columns(), vec!["agn_id", "ra"]);
        columns.show_all();
        assert_eq!(columns.visible_columns().len(), 17);
        assert!(matches!(columns.set("flux", true), Err(PortalError::UnknownField(_))));
    }

    #[test]
    fn grid_sort_puts_nulls_last() {
        let columns: Arc<[String]> = vec!["agn_id".to_string(), "z_value".to_string()].into();
        let row = |id, z: Option<f64>| {
            ResultRow::new(columns.clone(), vec![CellValue::Integer(id), z.map_or(CellValue::Null, CellValue::Real)])
        };
        let mut rows = vec![row(1, None), row(2, Some(0.5)), row(3, Some(2.0))];
        let mut sort = GridSort::default();
        sort.click("z_value");
        sort.apply(&mut rows);
        let ids = |rows: &[ResultRow]| rows.iter().map(|r| r.get("agn_id").cloned()).collect::<Vec<_>>();
        assert_eq!(ids(&rows), vec![Some(CellValue::Integer(2)), Some(CellValue::Integer(3)), Some(CellValue::Integer(1))]);
        sort.click("z_value");
        sort.apply(&mut rows);
        assert_eq!(ids(&rows), vec![Some(CellValue::Integer(3)), Some(CellValue::Integer(2)), Some(CellValue::Integer(1))]);
    }

    #[test]
    fn resubmission_replaces_or_combines() {
        let first = QueryGroup::default().with_rule(QueryRule::new("ra", Operator::LessThan, 10.0));
        let second = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"));
        let mut session = SearchSession::new();
        assert_eq!(session.submit(first.clone(), None).unwrap(), first);
        session.record_results(4);
        assert!(session.needs_choice());
        assert!(matches!(session.submit(second.clone(), None), Err(PortalError::Malformed(_))));
        assert_eq!(session.current(), Some(&first));
        let combined = session.submit(second.clone(), Some(Resubmission::CombineOr)).unwrap();
        assert_eq!(combined.combinator, Combinator::Or);
        assert_eq!(combined.rules.len(), 2);
        session.record_results(1);
        assert_eq!(session.submit(second.clone(), Some(Resubmission::Replace)).unwrap(), second);
        session.record_results(0);
        assert!(!session.needs_choice());
    }
}
