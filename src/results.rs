use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;

use crate::config::CohortLayout;
use crate::models::{keys, questions, CellValue, Record, RespondentRole};
use crate::participants::Roster;
use crate::rows::{
    read_records, update_in_place, write_records, HeaderCase, MapperError, ReadOptions, WriteMode,
    WriteOptions,
};
use crate::settings::{names, CohortSettings};
use crate::store::{resource_id, FormItem, FormResponse, Gateways, Sheet};

/// Section header backgrounds, in section order.
pub const HEADER_COLORS: [&str; 4] = ["#b4dde9", "#b4cbe9", "#b4b5e9", "#c27ba0"];

pub const RESULTS_SUMMARY_HEADER: &str = "Results Summary";

static EXCLUDED_QUESTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bemail\b|\bname\b|^timestamp$|\bsurvey id\b").expect("Invalid regex pattern")
});

/// Captured goal answers: (setting naming the question, capture flag,
/// participant key, goals sheet header).
const GOAL_CAPTURES: [(&str, &str, &str, &str); 2] = [
    (
        names::PROGRAM_GOAL_FIELD,
        names::CAPTURE_INITIAL_PROGRAM_GOAL,
        keys::ORIGINAL_PROGRAM_GOAL,
        "Original Program Goal",
    ),
    (
        names::MANAGER_GOAL_FIELD,
        names::CAPTURE_MANAGER_GOAL,
        keys::MANAGER_PROGRAM_GOAL,
        "Manager Program Goal",
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub role: RespondentRole,
    pub questions: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Section {
    pub fn title(&self) -> String {
        format!("{} FEEDBACK", self.role.label())
    }
}

/// Form questions worth reporting, in form order. Identity questions and the
/// role question itself are left out.
pub fn reported_questions(items: &[FormItem], role_field: Option<&str>) -> Vec<String> {
    items
        .iter()
        .map(|item| item.title.trim())
        .filter(|title| !title.is_empty())
        .filter(|title| !EXCLUDED_QUESTIONS.is_match(title))
        .filter(|title| Some(*title) != role_field)
        .map(str::to_string)
        .collect()
}

/// Group `responses` by respondent role. The unidentified section is only
/// present when it has responses.
pub fn compile_sections(
    questions: &[String],
    responses: &[&FormResponse],
    role_field: Option<&str>,
) -> Vec<Section> {
    let mut sections = Vec::new();
    for role in RespondentRole::ORDER {
        let members: Vec<&FormResponse> = responses
            .iter()
            .copied()
            .filter(|response| {
                RespondentRole::classify(role_field.and_then(|field| response.answer(field)))
                    == role
            })
            .collect();
        if role == RespondentRole::Unidentified && members.is_empty() {
            continue;
        }
        if role == RespondentRole::Unidentified {
            tracing::warn!(responses = members.len(), "unidentified respondents");
        }

        let answered: Vec<String> = questions
            .iter()
            .filter(|question| members.iter().any(|response| response.answer(question).is_some()))
            .cloned()
            .collect();
        let rows = members
            .iter()
            .map(|response| {
                answered
                    .iter()
                    .map(|question| response.answer(question).unwrap_or_default().to_string())
                    .collect()
            })
            .collect();
        sections.push(Section {
            role,
            questions: answered,
            rows,
        });
    }
    sections
}

/// Replace `sheet`'s contents with the sections. Answers are appended under
/// each section's header row keyed by the question text; every row is padded
/// to the widest row and header rows get their section color.
pub fn render(sheet: &mut Sheet, sections: &[Section]) -> Result<(), MapperError> {
    sheet.clear();
    for (index, section) in sections.iter().enumerate() {
        // One blank row between sections.
        let header_row = if index == 0 { 1 } else { sheet.last_row() + 2 };
        let headers = std::iter::once(section.title()).chain(section.questions.iter().cloned());
        for (offset, header) in headers.enumerate() {
            sheet.set_cell(header_row, offset + 1, CellValue::from(header));
        }
        if let Some(color) = HEADER_COLORS.get(index) {
            sheet.backgrounds.insert(header_row, color.to_string());
        }

        let records: Vec<Record> = section
            .rows
            .iter()
            .map(|answers| {
                let mut record = Record::new();
                for (question, answer) in section.questions.iter().zip(answers) {
                    if !answer.is_empty() {
                        record.set(question.as_str(), answer.as_str());
                    }
                }
                record
            })
            .collect();
        let options = WriteOptions::default()
            .mode(WriteMode::Append)
            .headers_row(header_row)
            .header_case(HeaderCase::Verbatim);
        write_records(sheet, &records, &options)?;
    }

    let width = sheet.last_column();
    for row in 1..=sheet.last_row() {
        let last = sheet.cell(row, width).clone();
        sheet.set_cell(row, width, last);
    }
    sheet.wrap = true;
    tracing::debug!(sheet = %sheet.name, rows = sheet.last_row(), width, "rendered survey summary");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub participant_id: String,
    pub results_book: Option<String>,
    pub created_results: bool,
    pub responses: usize,
    pub goals_captured: usize,
}

/// Handle the newest response of `form`.
///
/// Returns `Ok(None)` when the submission is not a participant survey or
/// does not match a participant.
pub fn form_submit(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    form: &str,
) -> anyhow::Result<Option<SubmitOutcome>> {
    let responses = gw
        .forms
        .responses(form)
        .with_context(|| format!("failed to read responses of form {form}"))?;
    let Some(latest) = responses.iter().max_by_key(|response| response.submitted_at) else {
        tracing::info!(form, "form has no responses");
        return Ok(None);
    };
    // Feedback surveys carry no survey id.
    let Some(participant_id) = latest.answer(questions::SURVEY_ID).map(str::to_string) else {
        tracing::debug!(form, "submission has no survey id, nothing to compile");
        return Ok(None);
    };

    let settings_sheet = gw
        .sheets
        .load_sheet(&layout.cohort_book, &layout.settings_sheet)
        .context("failed to load cohort settings")?;
    let settings = CohortSettings::load(&settings_sheet);
    let mut roster = Roster::load(&*gw.sheets, &settings, layout)?;
    let Some(mut participant) = roster.find(&participant_id).cloned() else {
        gw.notifier.error(&format!(
            "Survey ID {participant_id} on form submission does not match any Participant ID"
        ));
        return Ok(None);
    };

    let goals_captured = capture_goals(gw, layout, &roster.book, &settings, &participant_id, latest)?;

    let role_field = settings.raw(names::RESPONDENT_ROLE_FIELD);
    let mine: Vec<&FormResponse> = responses
        .iter()
        .filter(|response| response.answer(questions::SURVEY_ID) == Some(participant_id.as_str()))
        .collect();
    let items = gw.forms.items(form)?;
    let questions = reported_questions(&items, role_field.as_deref());
    let sections = compile_sections(&questions, &mine, role_field.as_deref());

    let name = participant
        .text(keys::PARTICIPANT_NAME)
        .unwrap_or_else(|| participant_id.clone());
    let (book, created) = match participant.raw(keys::RESULTS_SUMMARY) {
        Some(link) => (resource_id(&link), false),
        None => {
            let folder = settings
                .raw(names::SURVEY_RESULTS_FOLDER_ID)
                .map(|folder| resource_id(&folder));
            let book = gw
                .sheets
                .create_book(&format!("{name} - 360 Results"), folder.as_deref())
                .context("failed to create results workbook")?;
            participant.set(keys::RESULTS_SUMMARY, gw.sheets.book_url(&book));
            roster.write_column(&participant, RESULTS_SUMMARY_HEADER)?;
            roster.save(&mut *gw.sheets)?;
            tracing::info!(participant = %name, book = %book, "created results workbook");
            (book, true)
        }
    };

    let title = gw.forms.title(form)?;
    let mut sheet = match gw.sheets.load_sheet(&book, &title) {
        Ok(sheet) => sheet,
        Err(err) if err.is_not_found() => Sheet::new("", title.as_str()),
        Err(err) => return Err(err).context("failed to open results sheet"),
    };
    render(&mut sheet, &sections)?;
    gw.sheets
        .save_sheet(&book, &sheet)
        .with_context(|| format!("failed to save results for {name}"))?;
    tracing::info!(
        participant = %name,
        survey = %title,
        responses = mine.len(),
        "compiled survey results"
    );

    Ok(Some(SubmitOutcome {
        participant_id,
        results_book: Some(book),
        created_results: created,
        responses: mine.len(),
        goals_captured,
    }))
}

/// Copy captured goal answers onto the participant's goals row.
fn capture_goals(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    book: &str,
    settings: &CohortSettings,
    participant_id: &str,
    response: &FormResponse,
) -> anyhow::Result<usize> {
    let wanted: Vec<(&str, &str, String)> = GOAL_CAPTURES
        .iter()
        .filter(|(_, flag, _, _)| settings.flag(flag))
        .filter_map(|(field, _, key, header)| {
            let question = settings.raw(field)?;
            let answer = response.answer(&question)?;
            Some((*key, *header, answer.to_string()))
        })
        .collect();
    if wanted.is_empty() {
        return Ok(0);
    }

    let mut sheet = gw
        .sheets
        .load_sheet(book, &layout.goals_sheet)
        .context("failed to load program goals")?;
    // Blank cells are kept so a present but empty goal column is still found.
    let options = ReadOptions::default()
        .headers_row(layout.participant_header_row)
        .include_blanks();
    let records = read_records(&sheet, &options)?;
    let Some(mut row) = records
        .into_iter()
        .find(|record| record.raw(keys::PARTICIPANT_ID).as_deref() == Some(participant_id))
    else {
        gw.notifier.warn(&format!(
            "Participant {participant_id} is not on the program goals sheet; goal not recorded"
        ));
        return Ok(0);
    };

    let mut captured = 0;
    for (key, header, answer) in wanted {
        if !row.contains(key) {
            tracing::debug!(header, "no goals column for captured answer");
            continue;
        }
        row.set(key, answer);
        let options = WriteOptions::default()
            .headers_row(layout.participant_header_row)
            .only(header)
            .preserve_formulas();
        update_in_place(&mut sheet, std::slice::from_ref(&row), &options)
            .with_context(|| format!("failed to write {header:?}"))?;
        captured += 1;
    }
    if captured > 0 {
        gw.sheets
            .save_sheet(book, &sheet)
            .context("failed to save program goals")?;
        tracing::info!(participant = participant_id, goals = captured, "captured program goals");
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Level, OpsChannel};
    use crate::store::memory::MemoryWorkspace;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::BTreeMap;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<CellValue>> {
        rows.iter()
            .map(|cells| cells.iter().map(|raw| CellValue::parse(raw)).collect())
            .collect()
    }

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 7, 22)
            .unwrap()
            .and_hms_opt(9, minute, 0)
            .unwrap()
    }

    fn response(minute: u32, answers: &[(&str, &str)]) -> FormResponse {
        FormResponse {
            submitted_at: at(minute),
            answers: answers
                .iter()
                .map(|(q, a)| (q.to_string(), a.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn items(titles: &[&str]) -> Vec<FormItem> {
        titles
            .iter()
            .enumerate()
            .map(|(index, title)| FormItem {
                id: index.to_string(),
                title: title.to_string(),
            })
            .collect()
    }

    const QUESTIONS: &[&str] = &[
        "Timestamp",
        "Survey ID",
        "Your email address",
        "Participant Name",
        "Role",
        "Listens well",
        "Delegates",
        "Comments",
    ];

    #[test]
    fn identity_and_role_questions_are_not_reported() {
        let reported = reported_questions(&items(QUESTIONS), Some("Role"));
        assert_eq!(reported, vec!["Listens well", "Delegates", "Comments"]);
    }

    #[test]
    fn sections_follow_role_order_and_only_list_answered_questions() {
        let questions = reported_questions(&items(QUESTIONS), Some("Role"));
        let dr = response(1, &[("Role", "Direct Report"), ("Listens well", "Often")]);
        let manager = response(
            2,
            &[("Role", "Their manager"), ("Listens well", "Rarely"), ("Comments", "Solid")],
        );
        let own = response(3, &[("Role", "I am the participant"), ("Delegates", "Sometimes")]);
        let sections = compile_sections(&questions, &[&dr, &manager, &own], Some("Role"));

        let roles: Vec<RespondentRole> = sections.iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![RespondentRole::Manager, RespondentRole::DirectReport, RespondentRole::SelfReported]
        );
        assert_eq!(sections[0].questions, vec!["Listens well", "Comments"]);
        assert_eq!(sections[0].rows, vec![vec!["Rarely".to_string(), "Solid".to_string()]]);
        assert_eq!(sections[2].questions, vec!["Delegates"]);
        assert_eq!(sections[2].title(), "SELF REPORTED FEEDBACK");
    }

    #[test]
    fn missing_role_field_makes_everyone_unidentified() {
        let questions = vec!["Delegates".to_string()];
        let a = response(1, &[("Delegates", "Often")]);
        let sections = compile_sections(&questions, &[&a], None);
        assert_eq!(sections.len(), 4);
        assert!(sections[0].rows.is_empty());
        assert!(sections[0].questions.is_empty());
        assert_eq!(sections[3].role, RespondentRole::Unidentified);
        assert_eq!(sections[3].rows.len(), 1);
    }

    #[test]
    fn render_pads_rows_and_colors_headers() {
        let sections = vec![
            Section {
                role: RespondentRole::Manager,
                questions: vec!["Q1".into(), "Q2".into()],
                rows: vec![vec!["a".into(), "b".into()]],
            },
            Section {
                role: RespondentRole::DirectReport,
                questions: vec!["Q1".into()],
                rows: vec![vec!["c".into()], vec!["d".into()]],
            },
        ];
        let mut sheet = Sheet::new("", "360 #1");
        sheet.set_cell(20, 8, CellValue::from("stale"));
        render(&mut sheet, &sections).unwrap();

        assert_eq!(sheet.last_row(), 6);
        assert!(sheet.rows().iter().all(|row| row.len() == 3));
        assert_eq!(sheet.cell(1, 1), &CellValue::from("MANAGER FEEDBACK"));
        assert_eq!(sheet.cell(2, 2), &CellValue::from("a"));
        assert!(sheet.cell(3, 1).is_blank());
        assert_eq!(sheet.cell(4, 1), &CellValue::from("DIRECT REPORT FEEDBACK"));
        assert_eq!(sheet.cell(6, 2), &CellValue::from("d"));
        assert_eq!(
            sheet.backgrounds,
            BTreeMap::from([(1, HEADER_COLORS[0].to_string()), (4, HEADER_COLORS[1].to_string())])
        );
        assert!(sheet.wrap);
    }

    fn workspace() -> MemoryWorkspace {
        let mut ws = MemoryWorkspace::default();
        ws.sheets.insert(
            "cohort",
            Sheet::from_rows(
                "",
                "Cohort Settings",
                grid(&[
                    &["Respondent Role Field", "Role"],
                    &["Survey Results Folder ID", "results-folder"],
                    &["Program Goal Field", "Program goal"],
                    &["Capture Initial Program Goal", "TRUE"],
                ]),
            ),
        );
        ws.sheets.insert(
            "cohort",
            Sheet::from_rows(
                "",
                "Participant List",
                grid(&[
                    &["Spring"],
                    &[""],
                    &["Participant ID", "Participant Name", "Email", "Results Summary"],
                    &["p1", "Avery", "a@x.com", ""],
                    &["p2", "Jules", "j@x.com", ""],
                ]),
            ),
        );
        ws.sheets.insert(
            "cohort",
            Sheet::from_rows(
                "",
                "Program Goals",
                grid(&[
                    &[""],
                    &[""],
                    &["Participant ID", "Original Program Goal"],
                    &["p2", ""],
                    &["p1", ""],
                ]),
            ),
        );
        let mut questions: Vec<&str> = QUESTIONS.to_vec();
        questions.push("Program goal");
        ws.forms.add_form("f1", "360 #1", &questions);
        ws
    }

    fn submit(ws: &mut MemoryWorkspace) -> (Option<SubmitOutcome>, OpsChannel) {
        let channel = OpsChannel::new();
        let outcome = {
            let mut gw = ws.gateways(&channel);
            form_submit(&mut gw, &CohortLayout::default(), "f1").unwrap()
        };
        (outcome, channel)
    }

    #[test]
    fn first_submission_creates_the_results_workbook_and_captures_the_goal() {
        let mut ws = workspace();
        ws.forms.submit(
            "f1",
            response(
                1,
                &[("Survey ID", "p1"), ("Role", "Participant"), ("Delegates", "Often"), ("Program goal", "Coach more")],
            ),
        );
        let (outcome, _) = submit(&mut ws);
        let outcome = outcome.unwrap();
        assert!(outcome.created_results);
        assert_eq!(outcome.goals_captured, 1);
        assert_eq!(outcome.results_book.as_deref(), Some("book-1"));

        let books = ws.sheets.books();
        let created = books.iter().find(|(id, _, _)| id == "book-1").unwrap();
        assert_eq!(created.1, "Avery - 360 Results");
        assert_eq!(created.2.as_deref(), Some("results-folder"));

        let people = ws.sheets.sheet("cohort", "Participant List").unwrap();
        assert_eq!(
            people.cell(4, 4),
            &CellValue::from("https://sheets.example.com/d/book-1/edit")
        );
        let goals = ws.sheets.sheet("cohort", "Program Goals").unwrap();
        assert_eq!(goals.cell(5, 2), &CellValue::from("Coach more"));
        assert!(goals.cell(4, 2).is_blank());

        let summary = ws.sheets.sheet("book-1", "360 #1").unwrap();
        assert_eq!(summary.cell(1, 1), &CellValue::from("MANAGER FEEDBACK"));
        // Manager and direct report sections are empty headers.
        assert_eq!(summary.cell(5, 1), &CellValue::from("SELF REPORTED FEEDBACK"));
        assert_eq!(summary.cell(5, 2), &CellValue::from("Delegates"));
        assert_eq!(summary.cell(6, 2), &CellValue::from("Often"));
    }

    #[test]
    fn later_submissions_reuse_the_workbook_and_recompile_everything() {
        let mut ws = workspace();
        ws.forms.submit("f1", response(1, &[("Survey ID", "p1"), ("Role", "Manager"), ("Delegates", "Rarely")]));
        submit(&mut ws);
        ws.forms.submit("f1", response(2, &[("Survey ID", "p1"), ("Role", "Manager"), ("Delegates", "Often")]));
        ws.forms.submit("f1", response(3, &[("Survey ID", "p2"), ("Role", "Manager"), ("Delegates", "Never")]));
        // The newest response belongs to p2, so p2 gets compiled next.
        let (outcome, _) = submit(&mut ws);
        assert_eq!(outcome.unwrap().participant_id, "p2");

        ws.forms.submit("f1", response(4, &[("Survey ID", "p1"), ("Role", "Direct report")]));
        let (outcome, _) = submit(&mut ws);
        let outcome = outcome.unwrap();
        assert!(!outcome.created_results);
        assert_eq!(outcome.responses, 3);
        assert_eq!(outcome.results_book.as_deref(), Some("book-1"));

        let summary = ws.sheets.sheet("book-1", "360 #1").unwrap();
        assert_eq!(summary.cell(2, 2), &CellValue::from("Rarely"));
        assert_eq!(summary.cell(3, 2), &CellValue::from("Often"));
        assert_eq!(summary.cell(5, 1), &CellValue::from("DIRECT REPORT FEEDBACK"));
    }

    #[test]
    fn unknown_participant_is_reported() {
        let mut ws = workspace();
        ws.forms.submit("f1", response(1, &[("Survey ID", "nobody")]));
        let (outcome, channel) = submit(&mut ws);
        assert!(outcome.is_none());
        assert_eq!(channel.messages(Level::Error).len(), 1);
        assert_eq!(ws.sheets.books().len(), 1);
    }

    #[test]
    fn feedback_survey_without_id_is_ignored() {
        let mut ws = workspace();
        ws.forms.submit("f1", response(1, &[("Comments", "Great session")]));
        let (outcome, channel) = submit(&mut ws);
        assert!(outcome.is_none());
        assert!(channel.snapshot().is_empty());
    }
}
