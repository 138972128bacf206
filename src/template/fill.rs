use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::discover;
use super::document::{Block, Document};
use crate::notify::Notifier;
use crate::store::{DocumentStore, StoreError};

static SUBJECT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Subject:(.*)").expect("Invalid regex pattern"));

#[derive(Debug, Error)]
pub enum FillError {
    #[error("email template {0:?} has no subject line")]
    MissingSubject(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A marker replaced by `display_text` linked to `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HyperlinkSubstitution {
    pub marker: String,
    pub url: String,
    pub display_text: String,
}

/// Resolved values for one document, keyed by marker name (no brackets).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldSet {
    pub values: BTreeMap<String, String>,
    pub links: Vec<HyperlinkSubstitution>,
    pub table_rows: Vec<FieldSet>,
}

impl FieldSet {
    pub fn set(&mut self, marker: &str, value: impl Into<String>) {
        self.values.insert(marker.to_string(), value.into());
    }

    fn value(&self, marker: &str) -> Option<&str> {
        self.values
            .get(marker)
            .or_else(|| {
                self.values
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(marker))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }
}

/// Copy `template_id` to `filename` and fill the copy. Returns the copy's id;
/// the caller owns the copy and is responsible for deleting it.
pub fn fill(
    documents: &mut dyn DocumentStore,
    template_id: &str,
    fields: &FieldSet,
    folder: Option<&str>,
    filename: &str,
    replace_empty: bool,
    notifier: &dyn Notifier,
) -> Result<String, FillError> {
    let copy_id = documents.copy(template_id, filename, folder)?;
    let mut document = documents.open(&copy_id)?;
    fill_document(&mut document, fields, replace_empty, notifier);
    documents.save(&document)?;
    tracing::debug!(template = template_id, copy = %copy_id, "filled template");
    Ok(copy_id)
}

/// Apply `fields` to `document` in place.
///
/// Table rows are expanded first, then hyperlinks, then plain text. With
/// `replace_empty` unset a marker without a value keeps its placeholder.
pub fn fill_document(
    document: &mut Document,
    fields: &FieldSet,
    replace_empty: bool,
    notifier: &dyn Notifier,
) {
    let mut merged = FieldSet {
        values: fields.values.clone(),
        links: fields.links.clone(),
        table_rows: Vec::new(),
    };

    if !fields.table_rows.is_empty() {
        // Header rows stay; the last row is the per-entry template.
        let template_row = document.first_table_mut().and_then(|table| {
            let template_row = table.rows.pop()?;
            for index in 0..fields.table_rows.len() {
                let mut row = template_row.clone();
                row.suffix_markers(index);
                table.rows.push(row);
            }
            Some(template_row)
        });
        if template_row.is_some() {
            for (index, row_fields) in fields.table_rows.iter().enumerate() {
                for (marker, value) in &row_fields.values {
                    merged.values.insert(format!("{marker}{index}"), value.clone());
                }
                merged
                    .links
                    .extend(row_fields.links.iter().map(|link| HyperlinkSubstitution {
                        marker: format!("{}{index}", link.marker),
                        ..link.clone()
                    }));
            }
        } else {
            notifier.warn(&format!(
                "Table rows were given, but no table was found in template {:?}",
                document.name
            ));
        }
    }

    for link in &merged.links {
        let replaced = document.replace_all(
            &format!("<{}>", link.marker),
            &link.display_text,
            Some(&link.url),
        );
        tracing::trace!(marker = %link.marker, replaced, "applied hyperlink");
    }

    for marker in discover(&document.text()) {
        let value = merged.value(&marker).unwrap_or_default();
        if value.is_empty() && !replace_empty {
            continue;
        }
        document.replace_all(&format!("<{marker}>"), value, None);
    }
}

/// Take the subject from the first paragraph containing `Subject:` and drop
/// that paragraph together with everything above it.
pub fn extract_subject(document: &mut Document) -> Result<String, FillError> {
    let index = document
        .find_paragraph("Subject:")
        .ok_or_else(|| FillError::MissingSubject(document.name.clone()))?;
    let line = match &document.body[index] {
        Block::Paragraph(paragraph) => paragraph.text(),
        Block::Table(_) => String::new(),
    };
    let subject = SUBJECT_PATTERN
        .captures(&line)
        .map(|captures| captures[1].trim().to_string())
        .unwrap_or_default();
    document.body.drain(..=index);
    Ok(subject)
}
