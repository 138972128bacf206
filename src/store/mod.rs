pub mod fs;
#[cfg(test)]
pub mod memory;

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::CellValue;
use crate::notify::Notifier;
use crate::template::document::Document;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workbook {0:?} not found")]
    BookNotFound(String),

    #[error("sheet {sheet:?} not found in workbook {book:?}")]
    SheetNotFound { book: String, sheet: String },

    #[error("document {0:?} not found")]
    DocumentNotFound(String),

    #[error("form {0:?} not found")]
    FormNotFound(String),

    #[error("trigger {0:?} not found")]
    TriggerNotFound(String),

    #[error("mail transport rejected message to {recipient}: {reason}")]
    MailRejected { recipient: String, reason: String },

    #[error("invalid url {0:?}")]
    InvalidUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BookNotFound(_)
                | StoreError::SheetNotFound { .. }
                | StoreError::DocumentNotFound(_)
                | StoreError::FormNotFound(_)
                | StoreError::TriggerNotFound(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("{0} has no account compatible with silent sharing")]
    NoCompatibleAccount(String),

    #[error("sharing {file} with {email} failed: {reason}")]
    Failed {
        file: String,
        email: String,
        reason: String,
    },
}

static BLANK: CellValue = CellValue::Blank;

/// An in-memory copy of one sheet. Rows and columns are 1-based at the API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub id: String,
    pub name: String,
    rows: Vec<Vec<CellValue>>,
    formulas: BTreeMap<(usize, usize), String>,
    pub backgrounds: BTreeMap<usize, String>,
    pub wrap: bool,
    revision: u64,
}

impl Sheet {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_rows(
        id: impl Into<String>,
        name: impl Into<String>,
        rows: Vec<Vec<CellValue>>,
    ) -> Self {
        Self {
            rows,
            ..Self::new(id, name)
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        if row == 0 || col == 0 {
            return &BLANK;
        }
        self.rows
            .get(row - 1)
            .and_then(|cells| cells.get(col - 1))
            .unwrap_or(&BLANK)
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: CellValue) {
        if row == 0 || col == 0 {
            return;
        }
        if self.rows.len() < row {
            self.rows.resize_with(row, Vec::new);
        }
        let cells = &mut self.rows[row - 1];
        if cells.len() < col {
            cells.resize(col, CellValue::Blank);
        }
        cells[col - 1] = value;
        self.formulas.remove(&(row, col));
    }

    pub fn formula(&self, row: usize, col: usize) -> Option<&str> {
        self.formulas.get(&(row, col)).map(String::as_str)
    }

    pub fn set_formula(&mut self, row: usize, col: usize, formula: impl Into<String>) {
        if self.rows.len() < row {
            self.rows.resize_with(row, Vec::new);
        }
        self.formulas.insert((row, col), formula.into());
    }

    pub fn formulas(&self) -> impl Iterator<Item = (&(usize, usize), &String)> {
        self.formulas.iter()
    }

    /// Number of physical rows, populated or not.
    pub fn max_rows(&self) -> usize {
        self.rows.len()
    }

    /// Last row holding a value or a formula; 0 for an empty sheet.
    pub fn last_row(&self) -> usize {
        let from_values = self
            .rows
            .iter()
            .rposition(|cells| cells.iter().any(|cell| !cell.is_blank()))
            .map_or(0, |index| index + 1);
        let from_formulas = self.formulas.keys().map(|(row, _)| *row).max().unwrap_or(0);
        from_values.max(from_formulas)
    }

    /// Last column holding a value or a formula in any row.
    pub fn last_column(&self) -> usize {
        let from_values = self
            .rows
            .iter()
            .filter_map(|cells| cells.iter().rposition(|cell| !cell.is_blank()))
            .map(|index| index + 1)
            .max()
            .unwrap_or(0);
        let from_formulas = self.formulas.keys().map(|(_, col)| *col).max().unwrap_or(0);
        from_values.max(from_formulas)
    }

    /// Header text for `row`; formula cells read as their (blank) value.
    pub fn header_row(&self, row: usize) -> Vec<String> {
        (1..=self.last_column())
            .map(|col| self.cell(row, col).to_raw())
            .collect()
    }

    /// Blank every value and formula from `row` down, keeping the rows.
    pub fn clear_rows_from(&mut self, row: usize) {
        for cells in self.rows.iter_mut().skip(row.saturating_sub(1)) {
            cells.iter_mut().for_each(|cell| *cell = CellValue::Blank);
        }
        self.formulas.retain(|(r, _), _| *r < row);
        self.backgrounds.retain(|r, _| *r < row);
    }

    /// Physically remove every row from `row` down.
    pub fn delete_rows_from(&mut self, row: usize) {
        let keep = row.saturating_sub(1);
        if keep < self.rows.len() {
            self.rows.truncate(keep);
            self.formulas.retain(|(r, _), _| *r < row);
            self.backgrounds.retain(|r, _| *r < row);
            self.revision += 1;
        }
    }

    /// Remove all contents and formatting.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.formulas.clear();
        self.backgrounds.clear();
        self.wrap = false;
        self.revision += 1;
    }
}

/// A workbook/sheet addressable store of grids.
pub trait TabularStore {
    fn load_sheet(&self, book: &str, sheet: &str) -> Result<Sheet, StoreError>;

    fn save_sheet(&mut self, book: &str, sheet: &Sheet) -> Result<(), StoreError>;

    /// Create an empty workbook and return its id.
    fn create_book(&mut self, title: &str, folder: Option<&str>) -> Result<String, StoreError>;

    fn book_url(&self, book: &str) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareRole {
    Reader,
    Writer,
}

pub trait DocumentStore {
    fn open(&self, id: &str) -> Result<Document, StoreError>;

    fn save(&mut self, document: &Document) -> Result<(), StoreError>;

    /// Duplicate `id` under `name` and return the copy's id.
    fn copy(&mut self, id: &str, name: &str, folder: Option<&str>) -> Result<String, StoreError>;

    fn delete(&mut self, id: &str) -> Result<(), StoreError>;

    /// Share any stored file or folder with `email`.
    fn share(
        &mut self,
        id: &str,
        email: &str,
        role: ShareRole,
        notify: bool,
    ) -> Result<(), ShareError>;

    fn url(&self, id: &str) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormItem {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormResponse {
    pub submitted_at: NaiveDateTime,
    pub answers: BTreeMap<String, String>,
}

impl FormResponse {
    pub fn answer(&self, title: &str) -> Option<&str> {
        self.answers
            .get(title)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

pub trait FormStore {
    fn title(&self, form: &str) -> Result<String, StoreError>;

    fn items(&self, form: &str) -> Result<Vec<FormItem>, StoreError>;

    fn responses(&self, form: &str) -> Result<Vec<FormResponse>, StoreError>;

    /// Responder URL with the given items pre-answered.
    fn prefilled_url(&self, form: &str, answers: &[(FormItem, String)])
        -> Result<String, StoreError>;

    fn form_url(&self, form: &str) -> Result<String, StoreError>;

    fn set_accepting_responses(&mut self, form: &str, accepting: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to: String,
    pub bcc: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub attachment: Option<String>,
}

pub trait MailTransport {
    fn send(&mut self, message: &OutgoingMessage) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    DailyEmail,
    FormSubmit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub kind: TriggerKind,
    pub hour: Option<u32>,
}

pub trait TriggerInstaller {
    fn list(&self) -> Result<Vec<Trigger>, StoreError>;

    fn install(&mut self, kind: TriggerKind, hour: Option<u32>) -> Result<String, StoreError>;

    fn remove(&mut self, id: &str) -> Result<(), StoreError>;
}

/// Every collaborator one invocation needs, injected as trait objects.
pub struct Gateways<'a> {
    pub sheets: &'a mut dyn TabularStore,
    pub documents: &'a mut dyn DocumentStore,
    pub forms: &'a mut dyn FormStore,
    pub mail: &'a mut dyn MailTransport,
    pub triggers: &'a mut dyn TriggerInstaller,
    pub notifier: &'a dyn Notifier,
}

/// Responder URL with `answers` prefilled as `entry.<item id>` parameters.
pub(crate) fn prefill_query(
    responder_url: &str,
    answers: &[(FormItem, String)],
) -> Result<String, StoreError> {
    let params = std::iter::once(("usp".to_string(), "pp_url".to_string())).chain(
        answers
            .iter()
            .map(|(item, value)| (format!("entry.{}", item.id), value.clone())),
    );
    url::Url::parse_with_params(responder_url, params)
        .map(String::from)
        .map_err(|_| StoreError::InvalidUrl(responder_url.to_string()))
}

/// Extract a resource id from a store URL (`.../d/<id>/edit`) or return the
/// trimmed input when it is already an id.
pub fn resource_id(url_or_id: &str) -> String {
    let trimmed = url_or_id.trim();
    if let Some((_, rest)) = trimmed.split_once("/d/") {
        return rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .to_string();
    }
    trimmed.to_string()
}
