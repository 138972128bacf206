use anyhow::Context;
use uuid::Uuid;

use crate::config::CohortLayout;
use crate::models::{keys, Record};
use crate::rows::{read_records, update_in_place, ReadOptions, WriteOptions};
use crate::settings::{names, CohortSettings};
use crate::store::{resource_id, Sheet, TabularStore};

pub const PARTICIPANT_ID_HEADER: &str = "Participant ID";

/// Goal fields copied from the goals sheet onto each participant.
const GOAL_FIELDS: [&str; 3] = [
    keys::ORIGINAL_PROGRAM_GOAL,
    keys::FINAL_PROGRAM_GOAL,
    keys::MANAGER_PROGRAM_GOAL,
];

#[derive(Debug, Clone)]
pub struct Roster {
    pub book: String,
    pub sheet: Sheet,
    pub records: Vec<Record>,
    header_row: usize,
    dirty: bool,
}

/// Workbook holding the participant list: the `Participant List` setting,
/// or the cohort workbook itself.
pub fn participant_book(settings: &CohortSettings, layout: &CohortLayout) -> String {
    settings
        .raw(names::PARTICIPANT_LIST)
        .map(|reference| resource_id(&reference))
        .unwrap_or_else(|| layout.cohort_book.clone())
}

impl Roster {
    pub fn load(
        sheets: &dyn TabularStore,
        settings: &CohortSettings,
        layout: &CohortLayout,
    ) -> anyhow::Result<Self> {
        let book = participant_book(settings, layout);
        let options = ReadOptions::default().headers_row(layout.participant_header_row);

        let sheet = sheets
            .load_sheet(&book, &layout.participant_sheet)
            .with_context(|| format!("failed to load participant list from {book}"))?;
        let mut records = read_records(&sheet, &options)?;

        match sheets.load_sheet(&book, &layout.goals_sheet) {
            Ok(goals_sheet) => {
                let goals = read_records(&goals_sheet, &options)?;
                join_goals(&mut records, &goals);
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(book = %book, "no program goals sheet to join");
            }
            Err(err) => return Err(err).context("failed to load program goals"),
        }

        tracing::debug!(book = %book, participants = records.len(), "loaded participant roster");
        Ok(Self {
            book,
            sheet,
            records,
            header_row: layout.participant_header_row,
            dirty: false,
        })
    }

    /// Give every participant without an id a fresh one, written back to the
    /// `Participant ID` column at the participant's own row.
    pub fn ensure_ids(&mut self) -> anyhow::Result<usize> {
        let mut assigned = Vec::new();
        for record in &mut self.records {
            if record.raw(keys::PARTICIPANT_ID).is_none() {
                record.set(keys::PARTICIPANT_ID, Uuid::new_v4().to_string());
                assigned.push(record.clone());
            }
        }
        if assigned.is_empty() {
            return Ok(0);
        }
        let options = WriteOptions::default()
            .headers_row(self.header_row)
            .only(PARTICIPANT_ID_HEADER)
            .preserve_formulas();
        update_in_place(&mut self.sheet, &assigned, &options)
            .context("failed to write participant ids")?;
        self.dirty = true;
        tracing::info!(count = assigned.len(), "assigned participant ids");
        Ok(assigned.len())
    }

    pub fn find(&self, participant_id: &str) -> Option<&Record> {
        self.records
            .iter()
            .find(|record| record.raw(keys::PARTICIPANT_ID).as_deref() == Some(participant_id))
    }

    /// Write `record` back to its row, limited to the column `header`.
    pub fn write_column(&mut self, record: &Record, header: &str) -> anyhow::Result<()> {
        let options = WriteOptions::default()
            .headers_row(self.header_row)
            .only(header)
            .preserve_formulas();
        update_in_place(&mut self.sheet, std::slice::from_ref(record), &options)
            .with_context(|| format!("failed to write {header:?} to participant list"))?;
        self.dirty = true;
        Ok(())
    }

    /// Persist the participant sheet when anything changed.
    pub fn save(&mut self, sheets: &mut dyn TabularStore) -> anyhow::Result<()> {
        if self.dirty {
            sheets
                .save_sheet(&self.book, &self.sheet)
                .context("failed to save participant list")?;
            self.dirty = false;
        }
        Ok(())
    }
}

fn join_goals(participants: &mut [Record], goals: &[Record]) {
    for participant in participants.iter_mut() {
        let Some(id) = participant.raw(keys::PARTICIPANT_ID) else {
            continue;
        };
        let Some(goal_row) = goals
            .iter()
            .find(|row| row.raw(keys::PARTICIPANT_ID).as_deref() == Some(id.as_str()))
        else {
            tracing::debug!(participant = %id, "participant not on program goals sheet");
            continue;
        };
        for key in GOAL_FIELDS {
            if let Some(value) = goal_row.get(key).filter(|value| !value.is_blank()) {
                participant.set(key, value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CellValue;
    use crate::store::memory::MemorySheets;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<CellValue>> {
        rows.iter()
            .map(|cells| cells.iter().map(|raw| CellValue::parse(raw)).collect())
            .collect()
    }

    fn store() -> MemorySheets {
        let mut sheets = MemorySheets::default();
        sheets.insert(
            "people",
            Sheet::from_rows(
                "",
                "Participant List",
                grid(&[
                    &["Spring cohort"],
                    &[""],
                    &["Participant ID", "Participant Name", "Email"],
                    &["p1", "Avery", "avery@x.com"],
                    &["", "Jules", "jules@x.com"],
                ]),
            ),
        );
        sheets.insert(
            "people",
            Sheet::from_rows(
                "",
                "Program Goals",
                grid(&[
                    &[""],
                    &[""],
                    &["Participant ID", "Original Program Goal"],
                    &["p1", "Delegate more"],
                ]),
            ),
        );
        sheets
    }

    #[test]
    fn joins_goals_and_assigns_missing_ids() {
        let mut sheets = store();
        let settings = CohortSettings::from_pairs([(
            names::PARTICIPANT_LIST,
            "https://sheets.example.com/d/people/edit",
        )]);
        let layout = CohortLayout::default();
        let mut roster = Roster::load(&sheets, &settings, &layout).unwrap();
        assert_eq!(roster.book, "people");
        assert_eq!(
            roster.records[0].text(keys::ORIGINAL_PROGRAM_GOAL).as_deref(),
            Some("Delegate more")
        );

        assert_eq!(roster.ensure_ids().unwrap(), 1);
        assert_eq!(roster.ensure_ids().unwrap(), 0);
        roster.save(&mut sheets).unwrap();

        let saved = sheets.sheet("people", "Participant List").unwrap();
        let id = saved.cell(5, 1).to_raw();
        assert!(Uuid::parse_str(&id).is_ok(), "{id}");
        assert_eq!(saved.cell(5, 2), &CellValue::from("Jules"));
        assert_eq!(roster.find(&id).and_then(|p| p.text(keys::EMAIL)).as_deref(), Some("jules@x.com"));
    }
}
