//! Streaming export of a whole query result as CSV or as a VO-table document.
//!
//! Rows go from the executor straight into the serializer, which writes to any
//! `io::Write` in chunks of `export_chunk_bytes`. When a run fails halfway the
//! output simply stops: a VO-table document is left without its closing tags,
//! so a truncated download never looks complete.

use std::io::{BufWriter, Write};

use chrono::{SecondsFormat, Utc};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{FieldCatalog, FieldDescriptor, ValueType};
use crate::datatype::ResultRow;
use crate::error::{PortalError, Result};
use crate::execute::{Deadline, Executor};
use crate::interface::CancelToken;
use crate::query::QueryGroup;
use crate::translate::{ExecutableQuery, SortSpec, Translator};

const TITLE: &str = "AGN-DB Export";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExportFormat {
    #[default]
    #[serde(rename = "csv", alias = "tabular", alias = "CSV")]
    Csv,
    #[serde(rename = "votable", alias = "vo-table", alias = "VOTable")]
    VoTable,
}
impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::VoTable => "application/xml",
        }
    }
    pub fn filename(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "export.csv",
            ExportFormat::VoTable => "agn_db_export.xml",
        }
    }
}

fn include_metadata_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default)]
    pub format: ExportFormat,
    /// Absent means every field.
    #[serde(default)]
    pub selected_fields: Option<Vec<String>>,
    #[serde(default = "include_metadata_default")]
    pub include_metadata: bool,
}
impl Default for ExportOptions {
    fn default() -> Self {
        Self { format: ExportFormat::Csv, selected_fields: None, include_metadata: true }
    }
}
impl ExportOptions {
    pub fn new(format: ExportFormat, fields: &[&str]) -> Self {
        Self {
            format,
            selected_fields: Some(fields.iter().map(|f| f.to_string()).collect()),
            include_metadata: true,
        }
    }
}

/// A validated export, ready to run.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub query: ExecutableQuery,
    pub fields: Vec<FieldDescriptor>,
    positions: Vec<usize>,
    pub format: ExportFormat,
    pub include_metadata: bool,
}

impl ExportPlan {
    pub fn prepare(
        catalog: &FieldCatalog,
        tree: &QueryGroup,
        options: &ExportOptions,
        sort: Option<&SortSpec>,
    ) -> Result<Self> {
        let fields = match &options.selected_fields {
            None => catalog.list_fields().to_vec(),
            Some(names) if names.is_empty() => {
                return Err(PortalError::Malformed("select at least one field to export".into()));
            }
            Some(names) => catalog.select(names)?,
        };
        let query = Translator::new(catalog).translate(tree, sort)?;
        let positions = fields
            .iter()
            .map(|field| {
                query
                    .columns
                    .iter()
                    .position(|column| *column == field.name)
                    .ok_or_else(|| PortalError::Invariant(format!("field `{}` is not projected", field.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            query,
            fields,
            positions,
            format: options.format,
            include_metadata: options.include_metadata,
        })
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    pub fn filename(&self) -> &'static str {
        self.format.filename()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    fn cells(&self, row: &ResultRow) -> impl Iterator<Item = String> {
        self.positions.iter().map(move |&i| row.cells()[i].to_string())
    }
}

/// Counts, checks the row ceiling, then streams every matching row into `out`.
/// Returns the number of rows written.
pub fn run<W: Write>(plan: &ExportPlan, executor: &Executor, cancel: &CancelToken, out: W) -> Result<u64> {
    let limits = executor.limits();
    let deadline = Deadline::after(limits.export_timeout);
    let total = executor.count(&plan.query, cancel, deadline)?;
    if total > limits.export_row_ceiling {
        return Err(PortalError::ExportTooLarge { rows: total, ceiling: limits.export_row_ceiling });
    }
    debug!(total, format = ?plan.format, fields = plan.fields.len(), "export started");
    let written = match plan.format {
        ExportFormat::Csv => write_csv(plan, executor, cancel, deadline, total, out),
        ExportFormat::VoTable => write_votable(plan, executor, cancel, deadline, total, out),
    }
    .map_err(|e| if cancel.is_cancelled() { PortalError::Cancelled } else { e })?;
    info!(rows = written, format = ?plan.format, "export finished");
    Ok(written)
}

fn generated() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn write_csv<W: Write>(
    plan: &ExportPlan,
    executor: &Executor,
    cancel: &CancelToken,
    deadline: Deadline,
    total: u64,
    out: W,
) -> Result<u64> {
    let mut out = BufWriter::with_capacity(executor.limits().export_chunk_bytes, out);
    if plan.include_metadata {
        writeln!(out, "# {TITLE}")?;
        writeln!(out, "# Generated: {}", generated())?;
        writeln!(out, "# Fields: {}", plan.field_names().join(", "))?;
        writeln!(out, "# Total records: {total}")?;
        writeln!(out, "# ")?;
    }
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .buffer_capacity(executor.limits().export_chunk_bytes)
        .from_writer(out);
    writer.write_record(plan.fields.iter().map(|f| f.label.as_str()))?;
    let written = executor.stream(&plan.query, cancel, deadline, |row| {
        writer.write_record(plan.cells(row))?;
        Ok(())
    })?;
    writer.flush()?;
    Ok(written)
}

fn write_votable<W: Write>(
    plan: &ExportPlan,
    executor: &Executor,
    cancel: &CancelToken,
    deadline: Deadline,
    total: u64,
    out: W,
) -> Result<u64> {
    let mut out = BufWriter::with_capacity(executor.limits().export_chunk_bytes, out);
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        out,
        r#"<VOTABLE version="1.4" xmlns="http://www.ivoa.net/xml/VOTable/v1.4" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:schemaLocation="http://www.ivoa.net/xml/VOTable/v1.4 http://www.ivoa.net/xml/VOTable/v1.4">"#
    )?;
    writeln!(out, r#"<RESOURCE name="{TITLE}">"#)?;
    if plan.include_metadata {
        writeln!(
            out,
            "<DESCRIPTION>{}</DESCRIPTION>",
            escape_xml(&format!(
                "Data exported from AGN-DB on {}. Total records: {total}. Fields: {}",
                generated(),
                plan.field_names().join(", ")
            ))
        )?;
    }
    writeln!(out, r#"<TABLE name="results">"#)?;
    for field in &plan.fields {
        let name = escape_xml(&field.name);
        let arraysize = if field.value_type == ValueType::Number { "" } else { r#" arraysize="*""# };
        writeln!(
            out,
            r#"<FIELD name="{name}" ID="{name}" datatype="{}"{arraysize}/>"#,
            field.vo_datatype()
        )?;
    }
    writeln!(out, "<DATA>")?;
    writeln!(out, "<TABLEDATA>")?;
    let written = executor.stream(&plan.query, cancel, deadline, |row| {
        out.write_all(b"<TR>")?;
        for cell in plan.cells(row) {
            write!(out, "<TD>{}</TD>", escape_xml(&cell))?;
        }
        out.write_all(b"</TR>\n")?;
        Ok(())
    })?;
    writeln!(out, "</TABLEDATA>")?;
    writeln!(out, "</DATA>")?;
    writeln!(out, "</TABLE>")?;
    writeln!(out, "</RESOURCE>")?;
    writeln!(out, "</VOTABLE>")?;
    out.flush()?;
    Ok(written)
}

pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
