use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::models::CellValue;
use crate::notify::Notifier;
use crate::store::Sheet;

/// Setting keys are the exact display strings of column A.
pub mod names {
    pub const PARTICIPANT_LIST: &str = "Participant List";
    pub const PARTICIPANT_NAME_FIELD: &str = "Participant Name Field";
    pub const FACILITATOR_EMAIL: &str = "Facilitator Email";
    pub const HR_EMAIL: &str = "HR Email";
    pub const COHORT_NAME: &str = "Cohort Name";
    pub const COHORT_FOLDER_ID: &str = "Cohort Folder ID";
    pub const SURVEY_RESULTS_FOLDER_ID: &str = "Survey Results Folder ID";
    pub const RESPONDENT_ROLE_FIELD: &str = "Respondent Role Field";
    pub const PROGRAM_GOAL_FIELD: &str = "Program Goal Field";
    pub const MANAGER_GOAL_FIELD: &str = "Manager Goal Field";
    pub const CAPTURE_INITIAL_PROGRAM_GOAL: &str = "Capture Initial Program Goal";
    pub const CAPTURE_MANAGER_GOAL: &str = "Capture Manager Goal";
    pub const COHORT_STATUS: &str = "Cohort Status";
    pub const COMPLETED: &str = "Completed";
    pub const DISC_DUE_DATE: &str = "DISC Assessment Due Date";
}

/// Immutable snapshot of the settings sheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CohortSettings {
    values: BTreeMap<String, CellValue>,
}

impl CohortSettings {
    /// Column A is the key (not normalized), column B the value. Rows with
    /// a blank key are ignored.
    pub fn load(sheet: &Sheet) -> Self {
        Self::from_pairs((1..=sheet.last_row()).filter_map(|row| {
            let key = sheet.cell(row, 1).to_raw().trim().to_string();
            (!key.is_empty()).then(|| (key, sheet.cell(row, 2).clone()))
        }))
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<CellValue>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&CellValue> {
        self.values.get(key).filter(|value| !value.is_blank())
    }

    /// Display text (dates formatted for templates), trimmed.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|value| value.display().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    /// Raw text, for ids and addresses.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|value| value.to_raw().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(CellValue::is_truthy)
    }

    pub fn date(&self, key: &str) -> Option<NaiveDate> {
        self.get(key).and_then(CellValue::as_date)
    }

    /// Raw text for `key`, warning the channel when it is missing.
    pub fn require(&self, key: &str, notifier: &dyn Notifier) -> Option<String> {
        let value = self.raw(key);
        if value.is_none() {
            notifier.warn(&format!("Cohort setting {key:?} is not set"));
        }
        value
    }
}

/// Update `key` in the settings sheet, appending a row when it is absent.
pub fn set_setting(sheet: &mut Sheet, key: &str, value: impl Into<CellValue>) {
    let existing = (1..=sheet.last_row()).find(|row| sheet.cell(*row, 1).to_raw().trim() == key);
    let row = existing.unwrap_or(sheet.last_row() + 1);
    if existing.is_none() {
        sheet.set_cell(row, 1, CellValue::from(key));
    }
    sheet.set_cell(row, 2, value.into());
    tracing::debug!(setting = key, row, "updated cohort setting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Level, OpsChannel};

    fn settings_sheet() -> Sheet {
        Sheet::from_rows(
            "cohort/Cohort Settings",
            "Cohort Settings",
            vec![
                vec!["Cohort Name".into(), "Spring Leaders".into()],
                vec![CellValue::Blank, "orphan".into()],
                vec!["Capture Manager Goal".into(), CellValue::Bool(true)],
                vec!["Capture Initial Program Goal".into(), "No".into()],
                vec![
                    "DISC Assessment Due Date".into(),
                    NaiveDate::from_ymd_opt(2020, 7, 21).unwrap().into(),
                ],
            ],
        )
    }

    #[test]
    fn loads_exact_keys_and_ignores_blank_ones() {
        let settings = CohortSettings::load(&settings_sheet());
        assert_eq!(settings.text(names::COHORT_NAME).as_deref(), Some("Spring Leaders"));
        assert!(settings.flag(names::CAPTURE_MANAGER_GOAL));
        assert!(!settings.flag(names::CAPTURE_INITIAL_PROGRAM_GOAL));
        assert_eq!(settings.text(names::DISC_DUE_DATE).as_deref(), Some("Jul 21, 2020"));
        assert_eq!(settings.get("cohortName"), None);
    }

    #[test]
    fn missing_required_setting_warns() {
        let channel = OpsChannel::new();
        let settings = CohortSettings::load(&settings_sheet());
        assert_eq!(settings.require(names::HR_EMAIL, &channel), None);
        assert_eq!(channel.messages(Level::Warning).len(), 1);
    }

    #[test]
    fn set_setting_updates_or_appends() {
        let mut sheet = settings_sheet();
        set_setting(&mut sheet, names::COHORT_NAME, "Fall Leaders");
        set_setting(&mut sheet, names::COHORT_STATUS, "Active");
        let settings = CohortSettings::load(&sheet);
        assert_eq!(settings.text(names::COHORT_NAME).as_deref(), Some("Fall Leaders"));
        assert_eq!(settings.text(names::COHORT_STATUS).as_deref(), Some("Active"));
        assert_eq!(sheet.last_row(), 6);
    }
}
