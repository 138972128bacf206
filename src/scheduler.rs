use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::Context;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::config::CohortLayout;
use crate::forms;
use crate::hr_report::{build_hr_report, collect};
use crate::models::{keys, CellValue, RecipientType, Record};
use crate::participants::Roster;
use crate::provision;
use crate::rows::{check_handle, normalize_header, read_records, ReadOptions};
use crate::settings::{names, CohortSettings};
use crate::store::{resource_id, Gateways, OutgoingMessage, ShareRole, Sheet};
use crate::template::document::Document;
use crate::template::fill::{extract_subject, fill, FieldSet};
use crate::template::{Resolver, Scope};

static REMINDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reminder").expect("Invalid regex pattern"));
static RESULT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)result").expect("Invalid regex pattern"));
static DATE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)date$").expect("Invalid regex pattern"));

/// Date columns on the flow sheet that are not send dates.
const NON_SEND_DATES: [&str; 3] = [
    "Survey Due Date",
    "Coaching Call Date",
    "Session or Coaching Call Date",
];

/// Anchor columns whose date triggers the facilitator preview the day before.
const CALL_DATES: [&str; 2] = ["Coaching Call Date", "Session or Coaching Call Date"];

pub const PREVIEW_SUBJECT: &str = "Response summaries for tomorrow's coaching call";

/// One send-date cell that is due and unsent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueItem {
    pub record: usize,
    pub row: usize,
    pub name: String,
    pub template: String,
    pub send_date: NaiveDate,
    pub sent_column: usize,
}

pub fn is_send_date_header(header: &str) -> bool {
    let header = header.trim();
    DATE_SUFFIX.is_match(header)
        && !NON_SEND_DATES
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(header))
}

/// Visit every send-date cell holding a date: (record index, row, column, date).
fn send_cells<'a>(
    sheet: &'a Sheet,
    records: &'a [Record],
) -> impl Iterator<Item = (usize, usize, usize, NaiveDate)> + 'a {
    let headers = sheet.header_row(1);
    let send_columns: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| is_send_date_header(header))
        .map(|(index, _)| index + 1)
        .collect();
    records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| record.handle().map(|handle| (index, handle.row)))
        .flat_map(move |(index, row)| {
            send_columns
                .clone()
                .into_iter()
                .filter_map(move |col| sheet.cell(row, col).as_date().map(|date| (index, row, col, date)))
        })
}

fn template_ref(sheet: &Sheet, row: usize, col: usize) -> String {
    sheet.cell(row, col.saturating_sub(1)).to_raw().trim().to_string()
}

/// Every send-date cell whose date has started by `now` and whose sent cell
/// is empty. Cells with a blank template have nothing to send.
pub fn due_items(sheet: &Sheet, records: &[Record], now: NaiveDateTime) -> Vec<DueItem> {
    let headers = sheet.header_row(1);
    send_cells(sheet, records)
        .filter_map(|(record, row, col, send_date)| {
            let template = template_ref(sheet, row, col);
            if template.is_empty() || !sheet.cell(row, col + 1).is_blank() {
                return None;
            }
            // Send dates are midnight; anything started before now is due.
            if send_date.and_hms_opt(0, 0, 0)? >= now {
                return None;
            }
            let header = headers.get(col - 1).map(String::as_str).unwrap_or_default();
            Some(DueItem {
                record,
                row,
                name: DATE_SUFFIX.replace(header.trim(), "").trim().to_string(),
                template,
                send_date,
                sent_column: col + 1,
            })
        })
        .collect()
}

/// True when every send date is paired with a sent cell, or has a blank or
/// unusable template.
pub fn cohort_finished(sheet: &Sheet, records: &[Record], invalid: &BTreeSet<String>) -> bool {
    send_cells(sheet, records).all(|(_, row, col, _)| {
        let template = template_ref(sheet, row, col);
        template.is_empty()
            || invalid.contains(&resource_id(&template))
            || !sheet.cell(row, col + 1).is_blank()
    })
}

/// Distinct coaching-call dates falling on the day after `today`.
pub fn preview_dates(sheet: &Sheet, records: &[Record], today: NaiveDate) -> BTreeSet<NaiveDate> {
    let tomorrow = today + Duration::days(1);
    let columns: Vec<String> = sheet
        .header_row(1)
        .iter()
        .filter(|header| CALL_DATES.contains(&header.trim()))
        .map(|header| normalize_header(header))
        .collect();
    records
        .iter()
        .flat_map(|record| columns.iter().filter_map(|key| record.get(key)?.as_date()))
        .filter(|date| *date == tomorrow)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub due: usize,
    pub marked: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub previews: usize,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    sent: usize,
    failed: usize,
    skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed(Tally),
    InvalidTemplate,
    NotHandled,
}

impl Outcome {
    /// The sent cell is set unless every attempted send failed.
    fn marks_sent(&self) -> bool {
        match self {
            Outcome::Processed(tally) => !(tally.sent == 0 && tally.failed > 0),
            Outcome::InvalidTemplate | Outcome::NotHandled => false,
        }
    }
}

/// One message waiting to be rendered and sent.
#[derive(Debug, Clone)]
struct PendingEmail {
    recipient: String,
    fields: FieldSet,
    attachment: Option<String>,
}

struct RunContext<'s> {
    layout: &'s CohortLayout,
    settings: &'s CohortSettings,
    roster: &'s Roster,
}

/// The daily run.
pub fn send_emails(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    now: NaiveDateTime,
) -> anyhow::Result<RunSummary> {
    let book = layout.cohort_book.as_str();
    let settings_sheet = gw
        .sheets
        .load_sheet(book, &layout.settings_sheet)
        .context("failed to load cohort settings")?;
    let settings = CohortSettings::load(&settings_sheet);
    let mut flow = gw
        .sheets
        .load_sheet(book, &layout.flow_sheet)
        .context("failed to load email flow")?;
    let records = read_records(&flow, &ReadOptions::default())?;
    let today = now.date();

    let mut summary = RunSummary {
        previews: send_previews(gw, layout, &settings, &flow, &records, today),
        ..RunSummary::default()
    };

    let due = due_items(&flow, &records, now);
    summary.due = due.len();
    let mut invalid = BTreeSet::new();

    if due.is_empty() {
        gw.notifier.info("No emails to send today");
    } else {
        let mut roster = Roster::load(&*gw.sheets, &settings, layout)?;
        roster.ensure_ids()?;
        roster.save(&mut *gw.sheets)?;

        let ctx = RunContext {
            layout,
            settings: &settings,
            roster: &roster,
        };
        for item in &due {
            tracing::debug!(email = %item.name, send_date = %item.send_date, row = item.row, "sending due email");
            let outcome = send_template(gw, &ctx, item, &records[item.record]);
            if let Outcome::Processed(tally) = outcome {
                summary.sent += tally.sent;
                summary.failed += tally.failed;
                summary.skipped += tally.skipped;
            }
            if outcome == Outcome::InvalidTemplate {
                invalid.insert(resource_id(&item.template));
            }
            if outcome.marks_sent() {
                mark_sent(&mut flow, &records[item.record], item, now)?;
                summary.marked += 1;
            }
        }
        gw.sheets
            .save_sheet(book, &flow)
            .context("failed to save email flow")?;
    }

    summary.finished = cohort_finished(&flow, &records, &invalid);
    if summary.finished {
        if settings.raw(names::COHORT_STATUS).as_deref() == Some(provision::STATUS_ACTIVE) {
            tracing::info!("every scheduled email has been sent, ending cohort");
            provision::end_cohort(gw, layout, today)?;
        } else {
            tracing::debug!("schedule complete but cohort is not active");
        }
    }

    tracing::info!(
        due = summary.due,
        sent = summary.sent,
        failed = summary.failed,
        skipped = summary.skipped,
        finished = summary.finished,
        "email run complete"
    );
    Ok(summary)
}

/// Stamp the sent cell paired with the due send date.
fn mark_sent(flow: &mut Sheet, record: &Record, item: &DueItem, now: NaiveDateTime) -> anyhow::Result<()> {
    if let Some(handle) = record.handle() {
        check_handle(flow, handle).with_context(|| format!("failed to mark {:?} sent", item.name))?;
    }
    flow.set_cell(item.row, item.sent_column, CellValue::Timestamp(now));
    Ok(())
}

fn send_template(
    gw: &mut Gateways<'_>,
    ctx: &RunContext<'_>,
    item: &DueItem,
    flow_row: &Record,
) -> Outcome {
    let notifier = gw.notifier;
    let recipient_type = RecipientType::parse(&flow_row.raw(keys::RECIPIENT).unwrap_or_default());
    if let RecipientType::Other(tag) = &recipient_type {
        notifier.warn(&format!(
            "Unknown recipient type {tag:?} for {:?} on Email Flow row {}",
            item.name, item.row
        ));
        return Outcome::NotHandled;
    }

    let template_id = resource_id(&item.template);
    let template = match gw.documents.open(&template_id) {
        Ok(document) => document,
        Err(err) => {
            notifier.error(&format!(
                "Couldn't open template for {:?} at {}: {err}",
                item.name, item.template
            ));
            return Outcome::InvalidTemplate;
        }
    };

    let form = flow_row.raw(keys::SURVEY_LINK).map(|link| resource_id(&link));
    let reminder = REMINDER_PATTERN.is_match(&item.name);

    // HR mail renders its report into a working copy of the template.
    let mut working_copy = None;
    let document = if recipient_type == RecipientType::Hr {
        match prepare_hr_report(gw, ctx, item, &template_id, template, form.as_deref()) {
            Ok(Some((copy_id, document))) => {
                working_copy = Some(copy_id);
                document
            }
            Ok(None) => {
                return Outcome::Processed(Tally {
                    skipped: 1,
                    ..Tally::default()
                })
            }
            Err(err) => {
                notifier.error(&format!("Couldn't build HR report for {:?}: {err:#}", item.name));
                return Outcome::NotHandled;
            }
        }
    } else {
        template
    };
    let source_id = working_copy.clone().unwrap_or(template_id);

    let mut resolver = Resolver::new(item.name.clone(), &document, ctx.settings, Some(flow_row));
    let mut tally = Tally::default();
    let emails = match &recipient_type {
        RecipientType::Participant => {
            participant_emails(gw, ctx, &mut resolver, &item.name, form.as_deref(), reminder, &mut tally)
        }
        RecipientType::Manager => {
            manager_emails(gw, ctx, &mut resolver, form.as_deref(), reminder, &mut tally)
        }
        RecipientType::DirectReport => {
            if RESULT_PATTERN.is_match(&item.name) {
                tracing::debug!(template = %item.name, "results are never sent to direct reports");
                Vec::new()
            } else {
                direct_report_emails(gw, ctx, &mut resolver, form.as_deref(), reminder, &mut tally)
            }
        }
        RecipientType::Facilitator | RecipientType::Hr => {
            let key = if recipient_type == RecipientType::Hr {
                names::HR_EMAIL
            } else {
                names::FACILITATOR_EMAIL
            };
            match ctx.settings.require(key, notifier) {
                Some(address) => vec![PendingEmail {
                    recipient: address,
                    fields: resolver.resolve(Scope::All, None, None),
                    attachment: None,
                }],
                None => {
                    discard_working_copy(gw, working_copy.as_deref());
                    return Outcome::NotHandled;
                }
            }
        }
        RecipientType::Other(_) => Vec::new(),
    };
    resolver.report(notifier);

    for email in &emails {
        match deliver(gw, ctx, &source_id, &item.name, email) {
            Ok(()) => tally.sent += 1,
            Err(err) => {
                tally.failed += 1;
                notifier.error(&format!(
                    "Failed to send {:?} to {}: {err:#}",
                    item.name, email.recipient
                ));
            }
        }
    }
    discard_working_copy(gw, working_copy.as_deref());

    if tally.sent > 0 {
        notifier.info(&format!(
            "Sent {} emails for {} using template at {}",
            tally.sent, item.name, item.template
        ));
    }
    Outcome::Processed(tally)
}

fn discard_working_copy(gw: &mut Gateways<'_>, copy: Option<&str>) {
    if let Some(copy) = copy {
        if let Err(err) = gw.documents.delete(copy) {
            tracing::warn!(copy, error = %err, "failed to delete working copy");
        }
    }
}

/// Render the HR tables into a working copy. `None` when nothing is missing.
fn prepare_hr_report(
    gw: &mut Gateways<'_>,
    ctx: &RunContext<'_>,
    item: &DueItem,
    template_id: &str,
    template: Document,
    form: Option<&str>,
) -> anyhow::Result<Option<(String, Document)>> {
    let responses = match form {
        Some(form) => gw
            .forms
            .responses(form)
            .with_context(|| format!("failed to read responses of form {form}"))?,
        None => {
            gw.notifier.warn(&format!(
                "HR report {:?} has no survey link; every response counts as missing",
                item.name
            ));
            Vec::new()
        }
    };
    let data = collect(&ctx.roster.records, &responses);
    let mut report = template;
    if data.is_empty() || build_hr_report(&mut report, &data) == 0 {
        gw.notifier
            .info(&format!("Nothing missing for {}; HR email not sent", item.name));
        return Ok(None);
    }

    let folder = ctx.settings.raw(names::COHORT_FOLDER_ID);
    let copy_id = gw
        .documents
        .copy(template_id, &format!("{} - HR Report", item.name), folder.as_deref())?;
    report.id = copy_id.clone();
    gw.documents.save(&report)?;
    Ok(Some((copy_id, report)))
}

fn survey_url(
    gw: &Gateways<'_>,
    ctx: &RunContext<'_>,
    form: Option<&str>,
    participant: &Record,
    recipient: &str,
) -> Option<String> {
    let form = form?;
    match forms::survey_link(&*gw.forms, form, participant, recipient, ctx.settings, gw.notifier) {
        Ok(url) => Some(url),
        Err(err) => {
            gw.notifier
                .warn(&format!("Couldn't build survey link for {recipient}: {err}"));
            None
        }
    }
}

fn submitted(gw: &Gateways<'_>, form: Option<&str>, participant: &Record, recipient: &str) -> bool {
    let (Some(form), Some(id)) = (form, participant.raw(keys::PARTICIPANT_ID)) else {
        return false;
    };
    match forms::already_submitted(&*gw.forms, form, &id, recipient, gw.notifier) {
        Ok(done) => done,
        Err(err) => {
            gw.notifier
                .warn(&format!("Couldn't check responses of form {form}: {err}"));
            false
        }
    }
}

fn participant_name(participant: &Record) -> String {
    participant
        .text(keys::PARTICIPANT_NAME)
        .unwrap_or_else(|| "(unnamed participant)".to_string())
}

fn participant_emails(
    gw: &mut Gateways<'_>,
    ctx: &RunContext<'_>,
    resolver: &mut Resolver<'_>,
    name: &str,
    form: Option<&str>,
    reminder: bool,
    tally: &mut Tally,
) -> Vec<PendingEmail> {
    let results = RESULT_PATTERN.is_match(name);
    let mut emails = Vec::new();
    for participant in &ctx.roster.records {
        let Some(recipient) = participant.raw(keys::EMAIL) else {
            gw.notifier.warn(&format!(
                "Participant {} has no email address",
                participant_name(participant)
            ));
            continue;
        };
        if reminder && submitted(gw, form, participant, &recipient) {
            tracing::debug!(participant = %participant_name(participant), "already submitted, no reminder");
            tally.skipped += 1;
            continue;
        }

        let url = survey_url(gw, ctx, form, participant, &recipient);
        let fields = resolver.resolve(Scope::All, Some(participant), url.as_deref());

        let attachment = if results {
            participant.raw(keys::RESULTS_SUMMARY).map(|summary| {
                let artifact = resource_id(&summary);
                forms::share_silently(
                    &mut *gw.documents,
                    &artifact,
                    &recipient,
                    ShareRole::Reader,
                    gw.notifier,
                );
                artifact
            })
        } else {
            None
        };

        emails.push(PendingEmail {
            recipient,
            fields,
            attachment,
        });
    }
    emails
}

fn manager_emails(
    gw: &Gateways<'_>,
    ctx: &RunContext<'_>,
    resolver: &mut Resolver<'_>,
    form: Option<&str>,
    reminder: bool,
    tally: &mut Tally,
) -> Vec<PendingEmail> {
    // Managers in order of first appearance.
    let mut managers: Vec<(String, Vec<&Record>)> = Vec::new();
    for participant in &ctx.roster.records {
        let Some(manager) = participant.raw(keys::MANAGER_EMAIL) else {
            gw.notifier.warn(&format!(
                "Participant {} has no manager email",
                participant_name(participant)
            ));
            continue;
        };
        match managers
            .iter_mut()
            .find(|(address, _)| address.eq_ignore_ascii_case(&manager))
        {
            Some((_, reports)) => reports.push(participant),
            None => managers.push((manager, vec![participant])),
        }
    }

    let mut emails = Vec::new();
    for (manager, reports) in managers {
        let pending: Vec<&Record> = reports
            .into_iter()
            .filter(|participant| !(reminder && submitted(gw, form, participant, &manager)))
            .collect();
        let Some(&first) = pending.first() else {
            tracing::debug!(%manager, "every participant already submitted, no reminder");
            tally.skipped += 1;
            continue;
        };

        let url = survey_url(gw, ctx, form, first, &manager);
        let mut fields = resolver.resolve(Scope::Body, Some(first), url.as_deref());
        if resolver.has_table_markers() {
            for &participant in &pending {
                let url = survey_url(gw, ctx, form, participant, &manager);
                fields
                    .table_rows
                    .push(resolver.resolve(Scope::TableRow, Some(participant), url.as_deref()));
            }
        }
        emails.push(PendingEmail {
            recipient: manager,
            fields,
            attachment: None,
        });
    }
    emails
}

/// Direct-report addresses: comma separated, trimmed, empties dropped.
pub fn direct_reports(participant: &Record) -> Vec<String> {
    participant
        .raw(keys::DIRECT_REPORTS_EMAILS)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn direct_report_emails(
    gw: &Gateways<'_>,
    ctx: &RunContext<'_>,
    resolver: &mut Resolver<'_>,
    form: Option<&str>,
    reminder: bool,
    tally: &mut Tally,
) -> Vec<PendingEmail> {
    let mut emails = Vec::new();
    for participant in &ctx.roster.records {
        for recipient in direct_reports(participant) {
            if reminder && submitted(gw, form, participant, &recipient) {
                tally.skipped += 1;
                continue;
            }
            let url = survey_url(gw, ctx, form, participant, &recipient);
            emails.push(PendingEmail {
                fields: resolver.resolve(Scope::All, Some(participant), url.as_deref()),
                recipient,
                attachment: None,
            });
        }
    }
    emails
}

/// Fill, render and send one message. The filled copy is always deleted.
fn deliver(
    gw: &mut Gateways<'_>,
    ctx: &RunContext<'_>,
    template_id: &str,
    name: &str,
    email: &PendingEmail,
) -> anyhow::Result<()> {
    let folder = ctx.settings.raw(names::COHORT_FOLDER_ID);
    let copy = fill(
        &mut *gw.documents,
        template_id,
        &email.fields,
        folder.as_deref(),
        &format!("{name} - {}", email.recipient),
        true,
        gw.notifier,
    )?;
    let sent = render_and_send(gw, ctx, &copy, email);
    if let Err(err) = gw.documents.delete(&copy) {
        tracing::warn!(copy = %copy, error = %err, "failed to delete filled copy");
    }
    sent
}

fn render_and_send(
    gw: &mut Gateways<'_>,
    ctx: &RunContext<'_>,
    copy: &str,
    email: &PendingEmail,
) -> anyhow::Result<()> {
    let mut document = gw.documents.open(copy)?;
    let subject = extract_subject(&mut document)?;
    let mut html_body = document.to_html();
    if let Some(artifact) = &email.attachment {
        html_body.push_str(&format!(
            "<br><br><a href=\"{}\">Attachment: 360 results</a>",
            gw.sheets.book_url(artifact)
        ));
    }
    gw.mail.send(&OutgoingMessage {
        to: email.recipient.clone(),
        bcc: ctx.layout.bcc.clone(),
        subject,
        html_body,
        attachment: email.attachment.clone(),
    })?;
    tracing::info!(recipient = %email.recipient, "sent message");
    Ok(())
}

/// Tell the facilitator where the result summaries are, the day before each
/// coaching call. Returns the number of previews sent.
fn send_previews(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    settings: &CohortSettings,
    flow: &Sheet,
    records: &[Record],
    today: NaiveDate,
) -> usize {
    let dates = preview_dates(flow, records, today);
    if dates.is_empty() {
        return 0;
    }
    let notifier = gw.notifier;
    let (Some(facilitator), Some(folder)) = (
        settings.require(names::FACILITATOR_EMAIL, notifier),
        settings.require(names::SURVEY_RESULTS_FOLDER_ID, notifier),
    ) else {
        return 0;
    };

    let mut sent = 0;
    for date in dates {
        let message = OutgoingMessage {
            to: facilitator.clone(),
            bcc: layout.bcc.clone(),
            subject: PREVIEW_SUBJECT.to_string(),
            html_body: format!(
                "<p>Facilitator,</p><p><a href=\"{}\"> Click here </a> to view the results \
                 summaries for tomorrow's coaching call.</p>",
                gw.documents.url(&resource_id(&folder))
            ),
            attachment: None,
        };
        match gw.mail.send(&message) {
            Ok(()) => {
                tracing::info!(%date, %facilitator, "sent coaching call preview");
                sent += 1;
            }
            Err(err) => notifier.error(&format!(
                "Couldn't send coaching call preview to {facilitator}: {err}"
            )),
        }
    }
    sent
}
