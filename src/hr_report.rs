use crate::models::{keys, questions, Record};
use crate::store::FormResponse;
use crate::template::document::{Block, Document, Table};

/// Report tables an HR template may place with a marker paragraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportTable {
    MissingProgramGoal,
    MissingManagers,
    MissingDisc,
}

impl ReportTable {
    pub const ALL: [ReportTable; 3] = [
        ReportTable::MissingProgramGoal,
        ReportTable::MissingManagers,
        ReportTable::MissingDisc,
    ];

    /// Marker text, without angle brackets.
    pub fn marker(&self) -> &'static str {
        match self {
            ReportTable::MissingProgramGoal => "Missing Program Goal Table",
            ReportTable::MissingManagers => "Missing Managers Table",
            ReportTable::MissingDisc => "Missing DISC Table",
        }
    }

    pub fn from_marker(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|table| table.marker().eq_ignore_ascii_case(name))
    }

    fn header(&self) -> Vec<String> {
        let cells: &[&str] = match self {
            ReportTable::MissingProgramGoal => &["Missing Program Goal Survey"],
            ReportTable::MissingManagers => &["Participant", "Manager"],
            ReportTable::MissingDisc => &["Missing DISC"],
        };
        cells.iter().map(|cell| cell.to_string()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HrReportData {
    pub missing_program_goal: Vec<String>,
    pub missing_managers: Vec<(String, String)>,
    pub missing_disc: Vec<String>,
}

impl HrReportData {
    pub fn is_empty(&self) -> bool {
        self.missing_program_goal.is_empty()
            && self.missing_managers.is_empty()
            && self.missing_disc.is_empty()
    }

    fn rows(&self, table: ReportTable) -> Vec<Vec<String>> {
        match table {
            ReportTable::MissingProgramGoal => self
                .missing_program_goal
                .iter()
                .map(|name| vec![name.clone()])
                .collect(),
            ReportTable::MissingManagers => self
                .missing_managers
                .iter()
                .map(|(participant, manager)| vec![participant.clone(), manager.clone()])
                .collect(),
            ReportTable::MissingDisc => self.missing_disc.iter().map(|name| vec![name.clone()]).collect(),
        }
    }
}

fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Join the roster with a survey's responses by survey id.
pub fn collect(participants: &[Record], responses: &[FormResponse]) -> HrReportData {
    let mut data = HrReportData::default();
    for participant in participants {
        let name = participant.text(keys::PARTICIPANT_NAME).unwrap_or_default();

        if participant.text(keys::DISC_STYLE).is_none() {
            data.missing_disc.push(name.clone());
        }

        let id = participant.raw(keys::PARTICIPANT_ID);
        let about_participant: Vec<&FormResponse> = responses
            .iter()
            .filter(|response| {
                id.as_deref()
                    .is_some_and(|id| response.answer(questions::SURVEY_ID) == Some(id))
            })
            .collect();
        let answered_by = |address: Option<String>| {
            address.is_some_and(|address| {
                about_participant.iter().any(|response| {
                    response
                        .answer(questions::RESPONDENT_EMAIL)
                        .is_some_and(|email| same_address(email, &address))
                })
            })
        };

        if !answered_by(participant.raw(keys::EMAIL)) {
            data.missing_program_goal.push(name.clone());
        }
        if !answered_by(participant.raw(keys::MANAGER_EMAIL)) {
            let manager = participant.text(keys::MANAGER_NAME).unwrap_or_default();
            data.missing_managers.push((name, manager));
        }
    }
    data
}

/// Replace each report-table marker paragraph present in `document` with
/// its table. Returns the number of content rows inserted; zero means there
/// is nothing to report and the email must not be sent.
pub fn build_hr_report(document: &mut Document, data: &HrReportData) -> usize {
    let mut rows_added = 0;
    for table in ReportTable::ALL {
        let needle = format!("<{}>", table.marker());
        let Some(index) = document.find_paragraph(&needle) else {
            tracing::debug!(table = table.marker(), "report table not referenced by template");
            continue;
        };

        let header = table.header();
        let mut rows = data.rows(table);
        if rows.is_empty() {
            rows.push(vec!["N/A".to_string(); header.len()]);
        } else {
            rows_added += rows.len();
        }
        rows.insert(0, header);
        document.body[index] = Block::Table(Table::from_rows(&rows));
    }
    rows_added
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn participant(id: &str, name: &str, email: &str, manager: &str, disc: Option<&str>) -> Record {
        let mut record = Record::new();
        record.set(keys::PARTICIPANT_ID, id);
        record.set(keys::PARTICIPANT_NAME, name);
        record.set(keys::EMAIL, email);
        record.set(keys::MANAGER_EMAIL, format!("{manager}@x.com"));
        record.set(keys::MANAGER_NAME, manager);
        if let Some(style) = disc {
            record.set(keys::DISC_STYLE, style);
        }
        record
    }

    fn response(id: &str, email: &str) -> FormResponse {
        FormResponse {
            submitted_at: NaiveDate::from_ymd_opt(2020, 7, 20)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            answers: BTreeMap::from([
                (questions::SURVEY_ID.to_string(), id.to_string()),
                (questions::RESPONDENT_EMAIL.to_string(), email.to_string()),
            ]),
        }
    }

    #[test]
    fn collect_flags_missing_responses_and_disc() {
        let roster = vec![
            participant("p1", "Avery", "avery@x.com", "morgan", Some("D")),
            participant("p2", "Jules", "jules@x.com", "riley", None),
        ];
        let responses = vec![
            response("p1", "Avery@X.com"),
            response("p1", "morgan@x.com"),
            // Right person, wrong survey id.
            response("p1", "jules@x.com"),
        ];
        let data = collect(&roster, &responses);
        assert_eq!(data.missing_program_goal, vec!["Jules"]);
        assert_eq!(data.missing_managers, vec![("Jules".to_string(), "riley".to_string())]);
        assert_eq!(data.missing_disc, vec!["Jules"]);
    }

    #[test]
    fn only_referenced_tables_are_inserted_and_empty_ones_get_na() {
        let mut document = Document::from_text(
            "hr",
            "HR Report",
            "Subject: Status\n<Missing Managers Table>\nand\n<Missing DISC Table>",
        );
        let data = HrReportData {
            missing_program_goal: vec!["Avery".into()],
            missing_managers: vec![("Jules".into(), "Riley".into())],
            missing_disc: vec![],
        };
        assert_eq!(build_hr_report(&mut document, &data), 1);

        let Block::Table(managers) = &document.body[1] else {
            panic!("expected managers table");
        };
        assert_eq!(managers.rows.len(), 2);
        assert_eq!(managers.rows[1].cells[1].text(), "Riley");

        let Block::Table(disc) = &document.body[3] else {
            panic!("expected DISC table");
        };
        assert_eq!(disc.rows[1].cells[0].text(), "N/A");
        assert!(!document.text().contains("Missing Program Goal Survey"));
    }

    #[test]
    fn nothing_missing_adds_no_rows() {
        let mut document = Document::from_text(
            "hr",
            "HR Report",
            "<Missing Program Goal Table>\n<Missing Managers Table>\n<Missing DISC Table>",
        );
        assert_eq!(build_hr_report(&mut document, &HrReportData::default()), 0);
        assert!(HrReportData::default().is_empty());
    }
}
