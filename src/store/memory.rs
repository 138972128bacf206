use std::collections::{BTreeMap, BTreeSet};

use super::{
    prefill_query, DocumentStore, FormItem, FormResponse, FormStore, Gateways, MailTransport,
    OutgoingMessage, ShareError, ShareRole, Sheet, StoreError, TabularStore, Trigger,
    TriggerInstaller, TriggerKind,
};
use crate::notify::Notifier;
use crate::template::document::Document;

#[derive(Debug, Clone, Default)]
struct Book {
    title: String,
    folder: Option<String>,
    sheets: BTreeMap<String, Sheet>,
}

#[derive(Debug, Default)]
pub struct MemorySheets {
    books: BTreeMap<String, Book>,
    created: usize,
}

impl MemorySheets {
    /// Store `sheet` under `book`, creating the book when needed.
    pub fn insert(&mut self, book: &str, mut sheet: Sheet) {
        sheet.id = format!("{book}/{}", sheet.name);
        self.books
            .entry(book.to_string())
            .or_insert_with(|| Book {
                title: book.to_string(),
                ..Book::default()
            })
            .sheets
            .insert(sheet.name.clone(), sheet);
    }

    pub fn sheet(&self, book: &str, name: &str) -> Option<&Sheet> {
        self.books.get(book)?.sheets.get(name)
    }

    /// (id, title, folder) of every book, for assertions.
    pub fn books(&self) -> Vec<(String, String, Option<String>)> {
        self.books
            .iter()
            .map(|(id, book)| (id.clone(), book.title.clone(), book.folder.clone()))
            .collect()
    }
}

impl TabularStore for MemorySheets {
    fn load_sheet(&self, book: &str, sheet: &str) -> Result<Sheet, StoreError> {
        let found = self
            .books
            .get(book)
            .ok_or_else(|| StoreError::BookNotFound(book.to_string()))?;
        found
            .sheets
            .get(sheet)
            .cloned()
            .ok_or_else(|| StoreError::SheetNotFound {
                book: book.to_string(),
                sheet: sheet.to_string(),
            })
    }

    fn save_sheet(&mut self, book: &str, sheet: &Sheet) -> Result<(), StoreError> {
        let found = self
            .books
            .get_mut(book)
            .ok_or_else(|| StoreError::BookNotFound(book.to_string()))?;
        found.sheets.insert(sheet.name.clone(), sheet.clone());
        Ok(())
    }

    fn create_book(&mut self, title: &str, folder: Option<&str>) -> Result<String, StoreError> {
        self.created += 1;
        let id = format!("book-{}", self.created);
        self.books.insert(
            id.clone(),
            Book {
                title: title.to_string(),
                folder: folder.map(str::to_string),
                sheets: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn book_url(&self, book: &str) -> String {
        format!("https://sheets.example.com/d/{book}/edit")
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocuments {
    documents: BTreeMap<String, Document>,
    copies: usize,
    pub folders: BTreeSet<String>,
    pub incompatible_accounts: BTreeSet<String>,
    pub shares: Vec<(String, String, ShareRole, bool)>,
    pub deleted: Vec<String>,
}

impl MemoryDocuments {
    pub fn insert(&mut self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentStore for MemoryDocuments {
    fn open(&self, id: &str) -> Result<Document, StoreError> {
        self.documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))
    }

    fn save(&mut self, document: &Document) -> Result<(), StoreError> {
        self.documents.insert(document.id.clone(), document.clone());
        Ok(())
    }

    fn copy(&mut self, id: &str, name: &str, folder: Option<&str>) -> Result<String, StoreError> {
        let mut copy = self.open(id)?;
        self.copies += 1;
        copy.id = format!("{id}-copy-{}", self.copies);
        copy.name = name.to_string();
        copy.folder = folder.map(str::to_string);
        let copy_id = copy.id.clone();
        self.insert(copy);
        Ok(copy_id)
    }

    fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        self.documents
            .remove(id)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        self.deleted.push(id.to_string());
        Ok(())
    }

    fn share(
        &mut self,
        id: &str,
        email: &str,
        role: ShareRole,
        notify: bool,
    ) -> Result<(), ShareError> {
        if !self.documents.contains_key(id) && !self.folders.contains(id) {
            return Err(ShareError::Failed {
                file: id.to_string(),
                email: email.to_string(),
                reason: "file not found".to_string(),
            });
        }
        if !notify && self.incompatible_accounts.contains(email) {
            return Err(ShareError::NoCompatibleAccount(email.to_string()));
        }
        self.shares
            .push((id.to_string(), email.to_string(), role, notify));
        Ok(())
    }

    fn url(&self, id: &str) -> String {
        format!("https://docs.example.com/document/d/{id}/edit")
    }
}

#[derive(Debug, Clone)]
struct Form {
    title: String,
    items: Vec<FormItem>,
    accepting: bool,
    responses: Vec<FormResponse>,
}

#[derive(Debug, Default)]
pub struct MemoryForms {
    forms: BTreeMap<String, Form>,
}

impl MemoryForms {
    pub fn add_form(&mut self, id: &str, title: &str, questions: &[&str]) {
        let items = questions
            .iter()
            .enumerate()
            .map(|(index, question)| FormItem {
                id: (1000 + index).to_string(),
                title: question.to_string(),
            })
            .collect();
        self.forms.insert(
            id.to_string(),
            Form {
                title: title.to_string(),
                items,
                accepting: true,
                responses: Vec::new(),
            },
        );
    }

    pub fn submit(&mut self, id: &str, response: FormResponse) {
        if let Some(form) = self.forms.get_mut(id) {
            form.responses.push(response);
        }
    }

    pub fn is_accepting(&self, id: &str) -> Option<bool> {
        self.forms.get(id).map(|form| form.accepting)
    }

    fn form(&self, id: &str) -> Result<&Form, StoreError> {
        self.forms
            .get(id)
            .ok_or_else(|| StoreError::FormNotFound(id.to_string()))
    }
}

impl FormStore for MemoryForms {
    fn title(&self, form: &str) -> Result<String, StoreError> {
        Ok(self.form(form)?.title.clone())
    }

    fn items(&self, form: &str) -> Result<Vec<FormItem>, StoreError> {
        Ok(self.form(form)?.items.clone())
    }

    fn responses(&self, form: &str) -> Result<Vec<FormResponse>, StoreError> {
        Ok(self.form(form)?.responses.clone())
    }

    fn prefilled_url(
        &self,
        form: &str,
        answers: &[(FormItem, String)],
    ) -> Result<String, StoreError> {
        prefill_query(&self.form_url(form)?, answers)
    }

    fn form_url(&self, form: &str) -> Result<String, StoreError> {
        self.form(form)?;
        Ok(format!("https://forms.example.com/d/{form}/viewform"))
    }

    fn set_accepting_responses(&mut self, form: &str, accepting: bool) -> Result<(), StoreError> {
        let found = self
            .forms
            .get_mut(form)
            .ok_or_else(|| StoreError::FormNotFound(form.to_string()))?;
        found.accepting = accepting;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMail {
    pub sent: Vec<OutgoingMessage>,
    pub reject: BTreeSet<String>,
}

impl MailTransport for MemoryMail {
    fn send(&mut self, message: &OutgoingMessage) -> Result<(), StoreError> {
        if self.reject.contains(&message.to) {
            return Err(StoreError::MailRejected {
                recipient: message.to.clone(),
                reason: "mailbox unavailable".to_string(),
            });
        }
        self.sent.push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryTriggers {
    pub triggers: Vec<Trigger>,
    installed: usize,
    pub fail_on: Option<TriggerKind>,
}

impl TriggerInstaller for MemoryTriggers {
    fn list(&self) -> Result<Vec<Trigger>, StoreError> {
        Ok(self.triggers.clone())
    }

    fn install(&mut self, kind: TriggerKind, hour: Option<u32>) -> Result<String, StoreError> {
        if self.fail_on == Some(kind) {
            return Err(StoreError::Io(std::io::Error::other(format!(
                "cannot install {kind:?} trigger"
            ))));
        }
        self.installed += 1;
        let id = format!("trigger-{}", self.installed);
        self.triggers.push(Trigger {
            id: id.clone(),
            kind,
            hour,
        });
        Ok(id)
    }

    fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        let before = self.triggers.len();
        self.triggers.retain(|trigger| trigger.id != id);
        if self.triggers.len() == before {
            return Err(StoreError::TriggerNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Every in-memory gateway in one place.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    pub sheets: MemorySheets,
    pub documents: MemoryDocuments,
    pub forms: MemoryForms,
    pub mail: MemoryMail,
    pub triggers: MemoryTriggers,
}

impl MemoryWorkspace {
    pub fn gateways<'a>(&'a mut self, notifier: &'a dyn Notifier) -> Gateways<'a> {
        Gateways {
            sheets: &mut self.sheets,
            documents: &mut self.documents,
            forms: &mut self.forms,
            mail: &mut self.mail,
            triggers: &mut self.triggers,
            notifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CellValue;

    #[test]
    fn sheets_round_trip_through_load_and_save() {
        let mut sheets = MemorySheets::default();
        sheets.insert("cohort", Sheet::new("", "Email Flow"));
        let mut sheet = sheets.load_sheet("cohort", "Email Flow").unwrap();
        assert_eq!(sheet.id, "cohort/Email Flow");
        sheet.set_cell(1, 1, CellValue::from("Recipient"));
        sheets.save_sheet("cohort", &sheet).unwrap();
        assert_eq!(
            sheets.sheet("cohort", "Email Flow").unwrap().cell(1, 1),
            &CellValue::from("Recipient")
        );
        assert!(sheets.load_sheet("cohort", "Nope").unwrap_err().is_not_found());
    }

    #[test]
    fn removing_an_unknown_trigger_fails() {
        let mut triggers = MemoryTriggers::default();
        let id = triggers.install(TriggerKind::DailyEmail, Some(6)).unwrap();
        triggers.remove(&id).unwrap();
        assert!(triggers.remove(&id).is_err());
    }
}
