use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Normalized field keys used across the participant, flow and response sheets.
pub mod keys {
    pub const PARTICIPANT_ID: &str = "participantId";
    pub const PARTICIPANT_NAME: &str = "participantName";
    pub const EMAIL: &str = "email";
    pub const MANAGER_EMAIL: &str = "managerEmail";
    pub const MANAGER_NAME: &str = "managerName";
    pub const DIRECT_REPORTS_EMAILS: &str = "directReportsEmails";
    pub const DISC_STYLE: &str = "discStyle";
    pub const RESULTS_SUMMARY: &str = "resultsSummary";
    pub const ORIGINAL_PROGRAM_GOAL: &str = "originalProgramGoal";
    pub const FINAL_PROGRAM_GOAL: &str = "finalProgramGoal";
    pub const MANAGER_PROGRAM_GOAL: &str = "managerProgramGoal";

    pub const NUMBER: &str = "number";
    pub const RECIPIENT: &str = "recipient";
    pub const SURVEY_LINK: &str = "surveyLink";
    pub const SURVEY_DUE_DATE: &str = "surveyDueDate";
    pub const COACHING_CALL_DATE: &str = "coachingCallDate";
}

/// Form question titles the automation relies on.
pub mod questions {
    pub const SURVEY_ID: &str = "Survey ID";
    pub const RESPONDENT_EMAIL: &str = "Your email address";
}

/// A single cell as held by the tabular store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Blank,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl CellValue {
    /// Blank cells and empty strings are both "empty" to the row mapper.
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Blank => true,
            CellValue::Text(text) => text.is_empty(),
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Dates and timestamps both carry a calendar date.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(date) => Some(*date),
            CellValue::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            CellValue::Blank => false,
            CellValue::Bool(b) => *b,
            CellValue::Number(n) => *n != 0.0,
            CellValue::Text(text) => {
                let lowered = text.trim().to_ascii_lowercase();
                !matches!(lowered.as_str(), "" | "false" | "no" | "0" | "n")
            }
            CellValue::Date(_) | CellValue::Timestamp(_) => true,
        }
    }

    /// Parse the raw text form used by CSV sheets.
    pub fn parse(raw: &str) -> CellValue {
        if raw.is_empty() {
            return CellValue::Blank;
        }
        if raw.eq_ignore_ascii_case("true") {
            return CellValue::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return CellValue::Bool(false);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
            return CellValue::Date(date);
        }
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
            return CellValue::Timestamp(ts);
        }
        if let Ok(n) = raw.trim().parse::<f64>() {
            if n.is_finite() && !raw.trim().is_empty() {
                return CellValue::Number(n);
            }
        }
        CellValue::Text(raw.to_string())
    }

    /// Inverse of [`CellValue::parse`].
    pub fn to_raw(&self) -> String {
        match self {
            CellValue::Blank => String::new(),
            CellValue::Text(text) => text.clone(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            CellValue::Date(date) => date.format(DATE_FORMAT).to_string(),
            CellValue::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Text substituted into templates: dates render as `Jul 23, 2020`.
    pub fn display(&self) -> String {
        match self {
            CellValue::Date(date) => date.format("%b %-d, %Y").to_string(),
            CellValue::Timestamp(ts) => ts.date().format("%b %-d, %Y").to_string(),
            other => other.to_raw(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        CellValue::Date(value)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        CellValue::Timestamp(value)
    }
}

/// Identity of a record's source row, captured at read time.
///
/// `row` is 1-based like the tabular store. `revision` is the sheet's
/// structural revision at read time; a mismatch means rows moved since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowHandle {
    pub sheet_id: String,
    pub row: usize,
    pub revision: u64,
}

/// One row of a sheet, keyed by normalized header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, CellValue>,
    handle: Option<RowHandle>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(handle: RowHandle) -> Self {
        Self {
            fields: BTreeMap::new(),
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&RowHandle> {
        self.handle.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<&CellValue> {
        self.fields.get(key)
    }

    /// Non-blank display text for `key`, trimmed.
    pub fn text(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .filter(|value| !value.is_blank())
            .map(|value| value.display().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    /// Raw (non-display) text for `key`, used for ids and addresses.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .filter(|value| !value.is_blank())
            .map(|value| value.to_raw().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<CellValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &CellValue)> {
        self.fields.iter()
    }

    /// Number of fields holding a non-blank value.
    #[cfg(test)]
    pub fn populated(&self) -> usize {
        self.fields.values().filter(|value| !value.is_blank()).count()
    }
}

/// Recipient-type tag of a schedule row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientType {
    Participant,
    Manager,
    DirectReport,
    Facilitator,
    Hr,
    Other(String),
}

impl RecipientType {
    pub fn parse(tag: &str) -> Self {
        let tag = tag.trim();
        match tag {
            "Participant" => RecipientType::Participant,
            "Manager" => RecipientType::Manager,
            "Direct Report" => RecipientType::DirectReport,
            "Facilitator" => RecipientType::Facilitator,
            _ if tag.starts_with("HR") => RecipientType::Hr,
            _ => RecipientType::Other(tag.to_string()),
        }
    }
}

impl fmt::Display for RecipientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientType::Participant => write!(f, "Participant"),
            RecipientType::Manager => write!(f, "Manager"),
            RecipientType::DirectReport => write!(f, "Direct Report"),
            RecipientType::Facilitator => write!(f, "Facilitator"),
            RecipientType::Hr => write!(f, "HR"),
            RecipientType::Other(tag) => write!(f, "{tag}"),
        }
    }
}

/// Relationship of a survey respondent to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RespondentRole {
    Manager,
    DirectReport,
    SelfReported,
    Unidentified,
}

impl RespondentRole {
    /// Rendering order of the summary sections.
    pub const ORDER: [RespondentRole; 4] = [
        RespondentRole::Manager,
        RespondentRole::DirectReport,
        RespondentRole::SelfReported,
        RespondentRole::Unidentified,
    ];

    /// Case-insensitive substring match; "direct report" wins over "manager".
    pub fn classify(answer: Option<&str>) -> Self {
        let Some(answer) = answer else {
            return RespondentRole::Unidentified;
        };
        let lowered = answer.to_lowercase();
        if lowered.contains("direct report") {
            RespondentRole::DirectReport
        } else if lowered.contains("manager") {
            RespondentRole::Manager
        } else if lowered.contains("participant") {
            RespondentRole::SelfReported
        } else {
            RespondentRole::Unidentified
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RespondentRole::Manager => "MANAGER",
            RespondentRole::DirectReport => "DIRECT REPORT",
            RespondentRole::SelfReported => "SELF REPORTED",
            RespondentRole::Unidentified => "UNIDENTIFIED RESPONDENT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_cell_kinds() {
        assert_eq!(CellValue::parse(""), CellValue::Blank);
        assert_eq!(CellValue::parse("TRUE"), CellValue::Bool(true));
        assert_eq!(CellValue::parse("-3"), CellValue::Number(-3.0));
        assert_eq!(
            CellValue::parse("2020-07-23"),
            CellValue::Date(NaiveDate::from_ymd_opt(2020, 7, 23).unwrap())
        );
        assert_eq!(CellValue::parse("Avery Lee"), CellValue::Text("Avery Lee".into()));
    }

    #[test]
    fn raw_text_round_trips_through_parse() {
        let ts = NaiveDate::from_ymd_opt(2020, 7, 23)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap();
        for value in [
            CellValue::Number(4.0),
            CellValue::Number(2.5),
            CellValue::Timestamp(ts),
            CellValue::Text("a@x.com".into()),
        ] {
            assert_eq!(CellValue::parse(&value.to_raw()), value);
        }
    }

    #[test]
    fn dates_display_in_template_format() {
        let date = CellValue::Date(NaiveDate::from_ymd_opt(2020, 7, 3).unwrap());
        assert_eq!(date.display(), "Jul 3, 2020");
    }

    #[test]
    fn recipient_tags_map_to_policies() {
        assert_eq!(RecipientType::parse("Direct Report"), RecipientType::DirectReport);
        assert_eq!(RecipientType::parse("HR (Participant)"), RecipientType::Hr);
        assert_eq!(
            RecipientType::parse("Coach"),
            RecipientType::Other("Coach".into())
        );
    }

    #[test]
    fn respondent_roles_follow_precedence() {
        assert_eq!(
            RespondentRole::classify(Some("I am a Direct Report of the participant's manager")),
            RespondentRole::DirectReport
        );
        assert_eq!(
            RespondentRole::classify(Some("Manager")),
            RespondentRole::Manager
        );
        assert_eq!(
            RespondentRole::classify(Some("I am the participant")),
            RespondentRole::SelfReported
        );
        assert_eq!(RespondentRole::classify(Some("peer")), RespondentRole::Unidentified);
        assert_eq!(RespondentRole::classify(None), RespondentRole::Unidentified);
    }
}
