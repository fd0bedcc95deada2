//! The field catalog: every field a query rule may reference, a search may sort
//! by, or an export may select.
//!
//! A catalog is built once at startup and handed to the translator, the export
//! pipeline and the client-side builder. Field order is part of the contract:
//! source identity first, then redshift, then classification, then photometry,
//! with fields outside the preferred list appended alphabetically.

use std::collections::{BTreeMap, HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::error::{PortalError, Result};

lazy_static! {
    // field names and columns end up inside generated SQL
    static ref IDENTIFIER: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
}

/// The relation a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Source,
    Photometry,
    Redshift,
    Classification,
}
impl Entity {
    pub const ALL: [Entity; 4] = [
        Entity::Source,
        Entity::Photometry,
        Entity::Redshift,
        Entity::Classification,
    ];
    pub fn table(&self) -> &'static str {
        match self {
            Entity::Source => "source_agn",
            Entity::Photometry => "photometry",
            Entity::Redshift => "redshift_measurement",
            Entity::Classification => "classification",
        }
    }
    /// Alias of the relation in projected result queries.
    pub fn alias(&self) -> &'static str {
        match self {
            Entity::Source => "s",
            Entity::Photometry => "p",
            Entity::Redshift => "z",
            Entity::Classification => "c",
        }
    }
    /// Primary key of the relation. For child relations this also picks the
    /// representative row shown for a source.
    pub fn key_column(&self) -> &'static str {
        match self {
            Entity::Source => "agn_id",
            Entity::Photometry => "phot_id",
            Entity::Redshift => "redshift_id",
            Entity::Classification => "class_id",
        }
    }
    pub fn is_child(&self) -> bool {
        *self != Entity::Source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    String,
    Enum,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub label: String,
    pub entity: Entity,
    pub value_type: ValueType,
    pub category: String,
    #[serde(skip)]
    pub column: String,
    #[serde(skip)]
    pub integral: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FieldDescriptor {
    pub fn new(name: &str, label: &str, entity: Entity, value_type: ValueType, category: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            entity,
            value_type,
            category: category.to_string(),
            column: name.to_string(),
            integral: false,
            options: Vec::new(),
        }
    }
    pub fn number(name: &str, label: &str, entity: Entity) -> Self {
        Self::new(name, label, entity, ValueType::Number, category_of(entity))
    }
    pub fn string(name: &str, label: &str, entity: Entity) -> Self {
        Self::new(name, label, entity, ValueType::String, category_of(entity))
    }
    pub fn enumeration(name: &str, label: &str, entity: Entity, options: &[&str]) -> Self {
        let mut field = Self::new(name, label, entity, ValueType::Enum, category_of(entity));
        field.options = options.iter().map(|o| o.to_string()).collect();
        field
    }
    /// Marks a number field as holding whole numbers only.
    pub fn integral(mut self) -> Self {
        self.integral = true;
        self
    }
    /// Maps the field onto a column whose name differs from the field name.
    pub fn with_column(mut self, column: &str) -> Self {
        self.column = column.to_string();
        self
    }
    /// VO-table datatype, known before any row is read.
    pub fn vo_datatype(&self) -> &'static str {
        match (self.value_type, self.integral) {
            (ValueType::Number, true) => "long",
            (ValueType::Number, false) => "double",
            _ => "char",
        }
    }
}

fn category_of(entity: Entity) -> &'static str {
    match entity {
        Entity::Source => "source",
        Entity::Photometry => "photometry",
        Entity::Redshift => "redshift",
        Entity::Classification => "classification",
    }
}

/// Preferred presentation order of the AGN fields.
pub const PREFERRED_ORDER: [&str; 17] = [
    "agn_id",
    "ra",
    "declination",
    "redshift_type",
    "z_value",
    "z_error",
    "best_class",
    "spec_class",
    "gen_class",
    "xray_class",
    "image_class",
    "sed_class",
    "band_label",
    "filter_name",
    "mag_value",
    "mag_error",
    "extinction",
];

pub const BEST_CLASSES: [&str; 6] = [
    "Seyfert 1",
    "Seyfert 1.5",
    "Seyfert 2",
    "Quasar",
    "LINER",
    "AGN Candidate",
];
pub const SPEC_CLASSES: [&str; 2] = ["BLAGN", "NLAGN"];
pub const XRAY_CLASSES: [&str; 2] = ["Type 1", "Type 2"];
pub const IMAGE_CLASSES: [&str; 2] = ["Point Source", "Extended"];
pub const SED_CLASSES: [&str; 3] = ["Blue Continuum", "Red Continuum", "Flat Continuum"];
pub const REDSHIFT_TYPES: [&str; 2] = ["spectroscopic", "photometric"];

/// Immutable, ordered set of field descriptors.
#[derive(Debug, Clone)]
pub struct FieldCatalog {
    fields: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
}

impl FieldCatalog {
    /// Builds a catalog, ordering `fields` by `preferred` and then by name.
    pub fn new(fields: Vec<FieldDescriptor>, preferred: &[&str]) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !IDENTIFIER.is_match(&field.name) || !IDENTIFIER.is_match(&field.column) {
                return Err(PortalError::Catalog(format!(
                    "field `{}` is not a plain lowercase identifier",
                    field.name
                )));
            }
            if !seen.insert(field.name.clone()) {
                return Err(PortalError::Catalog(format!("field `{}` is declared twice", field.name)));
            }
        }
        if !fields.iter().any(|f| f.entity == Entity::Source) {
            return Err(PortalError::Catalog("a catalog needs at least one source field".into()));
        }
        Ok(Self::ordered(fields, preferred))
    }

    fn ordered(mut fields: Vec<FieldDescriptor>, preferred: &[&str]) -> Self {
        let rank = |name: &str| preferred.iter().position(|p| *p == name).unwrap_or(usize::MAX);
        fields.sort_by(|a, b| rank(&a.name).cmp(&rank(&b.name)).then_with(|| a.name.cmp(&b.name)));
        let index = fields.iter().enumerate().map(|(i, f)| (f.name.clone(), i)).collect();
        Self { fields, index }
    }

    /// The catalog of the AGN portal schema.
    pub fn agn() -> Self {
        let fields = vec![
            FieldDescriptor::number("agn_id", "AGN ID", Entity::Source).integral(),
            FieldDescriptor::number("ra", "Right Ascension (deg)", Entity::Source),
            FieldDescriptor::number("declination", "Declination (deg)", Entity::Source),
            FieldDescriptor::string("band_label", "Band", Entity::Photometry),
            FieldDescriptor::string("filter_name", "Filter", Entity::Photometry),
            FieldDescriptor::number("mag_value", "Magnitude", Entity::Photometry),
            FieldDescriptor::number("mag_error", "Magnitude Error", Entity::Photometry),
            FieldDescriptor::number("extinction", "Extinction", Entity::Photometry),
            FieldDescriptor::enumeration("redshift_type", "Redshift Type", Entity::Redshift, &REDSHIFT_TYPES),
            FieldDescriptor::number("z_value", "Redshift (z)", Entity::Redshift),
            FieldDescriptor::number("z_error", "Redshift Error", Entity::Redshift),
            FieldDescriptor::enumeration("spec_class", "Spectral Class", Entity::Classification, &SPEC_CLASSES),
            FieldDescriptor::enumeration("gen_class", "General Class", Entity::Classification, &BEST_CLASSES),
            FieldDescriptor::enumeration("xray_class", "X-ray Class", Entity::Classification, &XRAY_CLASSES),
            FieldDescriptor::enumeration("best_class", "Best Class", Entity::Classification, &BEST_CLASSES),
            FieldDescriptor::enumeration("image_class", "Image Class", Entity::Classification, &IMAGE_CLASSES),
            FieldDescriptor::enumeration("sed_class", "SED Class", Entity::Classification, &SED_CLASSES),
        ];
        Self::ordered(fields, &PREFERRED_ORDER)
    }

    pub fn list_fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn get_field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.index
            .get(name)
            .map(|i| &self.fields[*i])
            .ok_or_else(|| PortalError::UnknownField(name.to_string()))
    }

    /// Position of a field in catalog order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Field names grouped by category, each group in catalog order.
    pub fn categorize(&self) -> BTreeMap<String, Vec<String>> {
        let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for field in &self.fields {
            categories
                .entry(field.category.clone())
                .or_default()
                .push(field.name.clone());
        }
        categories
    }

    /// Entities referenced by at least one field, in schema order.
    pub fn entities(&self) -> Vec<Entity> {
        Entity::ALL
            .into_iter()
            .filter(|e| self.fields.iter().any(|f| f.entity == *e))
            .collect()
    }

    /// Resolves a selection of field names into descriptors in catalog order.
    pub fn select(&self, names: &[String]) -> Result<Vec<FieldDescriptor>> {
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let position = self
                .position(name)
                .ok_or_else(|| PortalError::UnknownField(name.clone()))?;
            if !positions.contains(&position) {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions.into_iter().map(|i| self.fields[i].clone()).collect())
    }
}
