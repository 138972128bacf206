//! Workspace-directory gateways.
//!
//! Layout under the workspace root:
//!
//! ```text
//! books/<book>/book.json          title and folder
//! books/<book>/<sheet>.csv        cell values; `=`-prefixed cells are formulas
//! books/<book>/<sheet>.meta.json  header backgrounds and wrap
//! documents/<id>.json             rich documents (`<id>.txt` also accepted)
//! documents/shares.json           share log
//! documents/accounts.json         addresses that accept silent shares
//! folders/<id>/                   shareable folders (workbooks are shareable too)
//! forms/<id>.json                 title, items, accepting flag, responses
//! outbox/<id>.json                sent messages
//! triggers.json                   installed triggers
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    prefill_query, DocumentStore, FormItem, FormResponse, FormStore, Gateways, MailTransport,
    OutgoingMessage, ShareError, ShareRole, Sheet, StoreError, TabularStore, Trigger,
    TriggerInstaller, TriggerKind,
};
use crate::models::CellValue;
use crate::notify::Notifier;
use crate::template::document::Document;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// File name for a sheet; path separators in the name are percent-escaped.
fn sheet_file(sheet: &str, extension: &str) -> String {
    let mut name = String::with_capacity(sheet.len() + extension.len() + 1);
    for c in sheet.chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            _ => name.push(c),
        }
    }
    name.push('.');
    name.push_str(extension);
    name
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookMeta {
    title: String,
    #[serde(default)]
    folder: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SheetMeta {
    #[serde(default)]
    backgrounds: BTreeMap<usize, String>,
    #[serde(default)]
    wrap: bool,
}

#[derive(Debug, Clone)]
pub struct FsSheets {
    root: PathBuf,
}

impl FsSheets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn book_dir(&self, book: &str) -> PathBuf {
        self.root.join("books").join(book)
    }
}

impl TabularStore for FsSheets {
    fn load_sheet(&self, book: &str, sheet: &str) -> Result<Sheet, StoreError> {
        let dir = self.book_dir(book);
        if !dir.is_dir() {
            return Err(StoreError::BookNotFound(book.to_string()));
        }
        let csv_path = dir.join(sheet_file(sheet, "csv"));
        if !csv_path.is_file() {
            return Err(StoreError::SheetNotFound {
                book: book.to_string(),
                sheet: sheet.to_string(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&csv_path)?;
        let mut rows = Vec::new();
        let mut formulas = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let mut cells = Vec::with_capacity(record.len());
            for (col, raw) in record.iter().enumerate() {
                if raw.starts_with('=') {
                    formulas.push((index + 1, col + 1, raw.to_string()));
                    cells.push(CellValue::Blank);
                } else {
                    cells.push(CellValue::parse(raw));
                }
            }
            rows.push(cells);
        }

        let mut loaded = Sheet::from_rows(format!("{book}/{sheet}"), sheet, rows);
        for (row, col, formula) in formulas {
            loaded.set_formula(row, col, formula);
        }
        let meta_path = dir.join(sheet_file(sheet, "meta.json"));
        if meta_path.is_file() {
            let meta: SheetMeta = read_json(&meta_path)?;
            loaded.backgrounds = meta.backgrounds;
            loaded.wrap = meta.wrap;
        }
        tracing::trace!(book, sheet, rows = loaded.max_rows(), "loaded sheet");
        Ok(loaded)
    }

    fn save_sheet(&mut self, book: &str, sheet: &Sheet) -> Result<(), StoreError> {
        let dir = self.book_dir(book);
        if !dir.is_dir() {
            return Err(StoreError::BookNotFound(book.to_string()));
        }

        let width = sheet
            .rows()
            .iter()
            .map(Vec::len)
            .chain(sheet.formulas().map(|((_, col), _)| *col))
            .max()
            .unwrap_or(0);
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(dir.join(sheet_file(&sheet.name, "csv")))?;
        for row in 1..=sheet.max_rows() {
            let cells: Vec<String> = (1..=width)
                .map(|col| match sheet.formula(row, col) {
                    Some(formula) => formula.to_string(),
                    None => sheet.cell(row, col).to_raw(),
                })
                .collect();
            writer.write_record(&cells)?;
        }
        writer.flush()?;

        let meta = SheetMeta {
            backgrounds: sheet.backgrounds.clone(),
            wrap: sheet.wrap,
        };
        let meta_path = dir.join(sheet_file(&sheet.name, "meta.json"));
        if meta.backgrounds.is_empty() && !meta.wrap {
            if meta_path.is_file() {
                fs::remove_file(meta_path)?;
            }
        } else {
            write_json(&meta_path, &meta)?;
        }
        Ok(())
    }

    fn create_book(&mut self, title: &str, folder: Option<&str>) -> Result<String, StoreError> {
        let id = new_id();
        let meta = BookMeta {
            title: title.to_string(),
            folder: folder.map(str::to_string),
        };
        write_json(&self.book_dir(&id).join("book.json"), &meta)?;
        tracing::debug!(book = %id, title, "created workbook");
        Ok(id)
    }

    fn book_url(&self, book: &str) -> String {
        format!("https://sheets.example.com/d/{book}/edit")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShareEntry {
    file: String,
    email: String,
    role: ShareRole,
    notified: bool,
}

#[derive(Debug, Clone)]
pub struct FsDocuments {
    root: PathBuf,
}

impl FsDocuments {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn json_path(&self, id: &str) -> PathBuf {
        self.root.join("documents").join(format!("{id}.json"))
    }

    fn text_path(&self, id: &str) -> PathBuf {
        self.root.join("documents").join(format!("{id}.txt"))
    }

    fn shares_path(&self) -> PathBuf {
        self.root.join("documents").join("shares.json")
    }

    /// Without an accounts list every address accepts silent shares.
    fn has_account(&self, email: &str) -> Result<bool, StoreError> {
        let path = self.root.join("documents").join("accounts.json");
        if !path.is_file() {
            return Ok(true);
        }
        let accounts: Vec<String> = read_json(&path)?;
        Ok(accounts.iter().any(|account| account.eq_ignore_ascii_case(email)))
    }

    fn exists(&self, id: &str) -> bool {
        self.json_path(id).is_file()
            || self.text_path(id).is_file()
            || self.root.join("folders").join(id).is_dir()
            || self.root.join("books").join(id).is_dir()
    }
}

impl DocumentStore for FsDocuments {
    fn open(&self, id: &str) -> Result<Document, StoreError> {
        let json = self.json_path(id);
        if json.is_file() {
            return read_json(&json);
        }
        let text = self.text_path(id);
        if text.is_file() {
            return Ok(Document::from_text(id, id, &fs::read_to_string(text)?));
        }
        Err(StoreError::DocumentNotFound(id.to_string()))
    }

    fn save(&mut self, document: &Document) -> Result<(), StoreError> {
        write_json(&self.json_path(&document.id), document)
    }

    fn copy(&mut self, id: &str, name: &str, folder: Option<&str>) -> Result<String, StoreError> {
        let mut copy = self.open(id)?;
        copy.id = new_id();
        copy.name = name.to_string();
        copy.folder = folder.map(str::to_string);
        self.save(&copy)?;
        Ok(copy.id)
    }

    fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        let mut removed = false;
        for path in [self.json_path(id), self.text_path(id)] {
            if path.is_file() {
                fs::remove_file(path)?;
                removed = true;
            }
        }
        if !removed {
            return Err(StoreError::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }

    fn share(
        &mut self,
        id: &str,
        email: &str,
        role: ShareRole,
        notify: bool,
    ) -> Result<(), ShareError> {
        let failed = |reason: String| ShareError::Failed {
            file: id.to_string(),
            email: email.to_string(),
            reason,
        };
        if !self.exists(id) {
            return Err(failed("file not found".to_string()));
        }
        if !notify && !self.has_account(email).map_err(|err| failed(err.to_string()))? {
            return Err(ShareError::NoCompatibleAccount(email.to_string()));
        }
        let path = self.shares_path();
        let mut shares: Vec<ShareEntry> = if path.is_file() {
            read_json(&path).map_err(|err| failed(err.to_string()))?
        } else {
            Vec::new()
        };
        shares.push(ShareEntry {
            file: id.to_string(),
            email: email.to_string(),
            role,
            notified: notify,
        });
        write_json(&path, &shares).map_err(|err| failed(err.to_string()))
    }

    fn url(&self, id: &str) -> String {
        format!("https://docs.example.com/document/d/{id}/edit")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FormFile {
    title: String,
    items: Vec<FormItem>,
    #[serde(default = "accepting_default")]
    accepting: bool,
    #[serde(default)]
    responses: Vec<FormResponse>,
}

fn accepting_default() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct FsForms {
    root: PathBuf,
}

impl FsForms {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, form: &str) -> PathBuf {
        self.root.join("forms").join(format!("{form}.json"))
    }

    fn load(&self, form: &str) -> Result<FormFile, StoreError> {
        let path = self.path(form);
        if !path.is_file() {
            return Err(StoreError::FormNotFound(form.to_string()));
        }
        read_json(&path)
    }
}

impl FormStore for FsForms {
    fn title(&self, form: &str) -> Result<String, StoreError> {
        Ok(self.load(form)?.title)
    }

    fn items(&self, form: &str) -> Result<Vec<FormItem>, StoreError> {
        Ok(self.load(form)?.items)
    }

    fn responses(&self, form: &str) -> Result<Vec<FormResponse>, StoreError> {
        Ok(self.load(form)?.responses)
    }

    fn prefilled_url(
        &self,
        form: &str,
        answers: &[(FormItem, String)],
    ) -> Result<String, StoreError> {
        prefill_query(&self.form_url(form)?, answers)
    }

    fn form_url(&self, form: &str) -> Result<String, StoreError> {
        self.load(form)?;
        Ok(format!("https://forms.example.com/d/{form}/viewform"))
    }

    fn set_accepting_responses(&mut self, form: &str, accepting: bool) -> Result<(), StoreError> {
        let mut file = self.load(form)?;
        file.accepting = accepting;
        write_json(&self.path(form), &file)
    }
}

/// Drops every message as a JSON file into `outbox/`.
#[derive(Debug, Clone)]
pub struct FsOutbox {
    root: PathBuf,
}

impl FsOutbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MailTransport for FsOutbox {
    fn send(&mut self, message: &OutgoingMessage) -> Result<(), StoreError> {
        if !message.to.contains('@') {
            return Err(StoreError::MailRejected {
                recipient: message.to.clone(),
                reason: "not an email address".to_string(),
            });
        }
        let path = self.root.join("outbox").join(format!("{}.json", new_id()));
        write_json(&path, message)?;
        tracing::debug!(to = %message.to, path = %path.display(), "queued message");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FsTriggers {
    root: PathBuf,
}

impl FsTriggers {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self) -> PathBuf {
        self.root.join("triggers.json")
    }

    fn store(&self, triggers: &[Trigger]) -> Result<(), StoreError> {
        write_json(&self.path(), &triggers)
    }
}

impl TriggerInstaller for FsTriggers {
    fn list(&self) -> Result<Vec<Trigger>, StoreError> {
        let path = self.path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    fn install(&mut self, kind: TriggerKind, hour: Option<u32>) -> Result<String, StoreError> {
        let mut triggers = self.list()?;
        let id = new_id();
        triggers.push(Trigger {
            id: id.clone(),
            kind,
            hour,
        });
        self.store(&triggers)?;
        Ok(id)
    }

    fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        let mut triggers = self.list()?;
        let before = triggers.len();
        triggers.retain(|trigger| trigger.id != id);
        if triggers.len() == before {
            return Err(StoreError::TriggerNotFound(id.to_string()));
        }
        self.store(&triggers)
    }
}

/// Every workspace gateway rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    pub sheets: FsSheets,
    pub documents: FsDocuments,
    pub forms: FsForms,
    pub outbox: FsOutbox,
    pub triggers: FsTriggers,
}

impl FsWorkspace {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        if !root.is_dir() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("workspace {} does not exist", root.display()),
            )));
        }
        Ok(Self {
            sheets: FsSheets::new(root),
            documents: FsDocuments::new(root),
            forms: FsForms::new(root),
            outbox: FsOutbox::new(root),
            triggers: FsTriggers::new(root),
        })
    }

    pub fn gateways<'a>(&'a mut self, notifier: &'a dyn Notifier) -> Gateways<'a> {
        Gateways {
            sheets: &mut self.sheets,
            documents: &mut self.documents,
            forms: &mut self.forms,
            mail: &mut self.outbox,
            triggers: &mut self.triggers,
            notifier,
        }
    }
}
