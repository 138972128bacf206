use std::collections::BTreeSet;

use anyhow::{anyhow, Context};
use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::calendar::{self, CalendarError};
use crate::config::CohortLayout;
use crate::forms;
use crate::models::{keys, Record};
use crate::rows::{read_records, write_records, MapperError, ReadOptions, WriteMode, WriteOptions};
use crate::settings::{names, set_setting, CohortSettings};
use crate::store::{resource_id, Gateways, ShareRole, Sheet, StoreError, TriggerKind};

pub const STATUS_ACTIVE: &str = "Active";
pub const STATUS_COMPLETED: &str = "Completed";

/// Shown to the operator when a start fails; the detail goes to the channel.
pub const START_FAILED_MESSAGE: &str =
    "We're sorry, something went wrong and we couldn't start this cohort. \
     Check that all settings are complete and try again.";

const EMAIL_START_DATE: &str = "emailStartDate";

/// Recipient tags whose first email is anchored on the first session.
const SESSION_ONE_RECIPIENTS: [&str; 2] = ["Participant", "HR (Participant)"];

/// Calendar days between the DISC assessment deadline and session 1.
const DISC_LEAD_DAYS: u64 = 7;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("this cohort is already active")]
    AlreadyActive,

    #[error("{}", START_FAILED_MESSAGE)]
    StartFailed,

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Anchor date for the row's survey cycle, if one was given.
fn cycle_anchor(record: &Record, anchors: &[NaiveDate]) -> Option<NaiveDate> {
    let number = record.get(keys::NUMBER)?.as_number()?;
    if number < 1.0 || number.fract() != 0.0 {
        return None;
    }
    anchors.get(number as usize - 1).copied()
}

fn starts_on_session_one(record: &Record) -> bool {
    let number = record.get(keys::NUMBER).and_then(|value| value.as_number());
    let recipient = record.raw(keys::RECIPIENT).unwrap_or_default();
    number == Some(1.0) && SESSION_ONE_RECIPIENTS.contains(&recipient.as_str())
}

/// Replace every numeric `...Date` cell of the flow with an absolute date.
///
/// Rows whose cycle has no anchor keep their offsets. Rows left below the
/// rewritten flow are blanked, or removed when `prune` is set. Returns the
/// number of rows that were dated.
pub fn assign_flow_dates(
    flow: &mut Sheet,
    anchors: &[NaiveDate],
    session1: Option<NaiveDate>,
    prune: bool,
) -> Result<usize, ProvisionError> {
    let mut records = read_records(flow, &ReadOptions::default())?;
    let mut dated = 0;

    for record in &mut records {
        let Some(anchor) = cycle_anchor(record, anchors) else {
            tracing::debug!(
                number = record.raw(keys::NUMBER).as_deref().unwrap_or(""),
                "no anchor date for flow row"
            );
            continue;
        };
        record.set(keys::COACHING_CALL_DATE, anchor);

        let offsets: Vec<(String, f64)> = record
            .fields()
            .filter(|(key, _)| key.ends_with("Date") && key.as_str() != keys::COACHING_CALL_DATE)
            .filter_map(|(key, value)| value.as_number().map(|days| (key.clone(), days)))
            .collect();

        let session_start = starts_on_session_one(record);
        for (key, days) in offsets {
            let base = if key == EMAIL_START_DATE && session_start {
                session1.unwrap_or_else(|| {
                    tracing::warn!("no session 1 date, anchoring first email on the call date");
                    anchor
                })
            } else {
                anchor
            };
            record.set(key, calendar::offset_by(base, days)?);
        }
        dated += 1;
    }

    let mode = if prune { WriteMode::Delete } else { WriteMode::Clear };
    write_records(flow, &records, &WriteOptions::default().mode(mode))?;
    tracing::info!(rows = dated, anchors = anchors.len(), "assigned email flow dates");
    Ok(dated)
}

/// Date the flow template `source` into the cohort's flow sheet and record
/// the DISC due date.
pub fn provision_flow(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    source: Option<&str>,
    anchors: &[NaiveDate],
    session1: Option<NaiveDate>,
    prune: bool,
) -> anyhow::Result<usize> {
    let book = layout.cohort_book.as_str();
    let source = source.unwrap_or(&layout.flow_sheet);
    let mut flow = gw
        .sheets
        .load_sheet(book, source)
        .with_context(|| format!("failed to load flow template {source:?}"))?;
    let dated = assign_flow_dates(&mut flow, anchors, session1, prune)?;
    flow.name = layout.flow_sheet.clone();
    gw.sheets
        .save_sheet(book, &flow)
        .context("failed to save email flow")?;

    if let Some(session1) = session1 {
        let mut settings = gw
            .sheets
            .load_sheet(book, &layout.settings_sheet)
            .context("failed to load cohort settings")?;
        let due = session1
            .checked_sub_days(Days::new(DISC_LEAD_DAYS))
            .unwrap_or(session1);
        set_setting(&mut settings, names::DISC_DUE_DATE, due);
        gw.sheets
            .save_sheet(book, &settings)
            .context("failed to save cohort settings")?;
    }
    Ok(dated)
}

/// Distinct survey form ids linked from the flow.
fn flow_forms(gw: &Gateways<'_>, layout: &CohortLayout) -> anyhow::Result<BTreeSet<String>> {
    let flow = gw
        .sheets
        .load_sheet(&layout.cohort_book, &layout.flow_sheet)
        .context("failed to load email flow")?;
    Ok(read_records(&flow, &ReadOptions::default())?
        .iter()
        .filter_map(|record| record.raw(keys::SURVEY_LINK))
        .map(|link| resource_id(&link))
        .collect())
}

fn set_forms_accepting(
    gw: &mut Gateways<'_>,
    forms: &BTreeSet<String>,
    accepting: bool,
) -> Result<(), StoreError> {
    for form in forms {
        gw.forms.set_accepting_responses(form, accepting)?;
        tracing::debug!(form = %form, accepting, "updated survey form");
    }
    Ok(())
}

/// Turn the cohort on: share its folder, install triggers, open forms.
///
/// Any failure removes the triggers this call installed and returns
/// [`ProvisionError::StartFailed`].
pub fn start_cohort(gw: &mut Gateways<'_>, layout: &CohortLayout) -> Result<(), ProvisionError> {
    let settings_sheet = gw
        .sheets
        .load_sheet(&layout.cohort_book, &layout.settings_sheet)?;
    let settings = CohortSettings::load(&settings_sheet);
    if settings.raw(names::COHORT_STATUS).as_deref() == Some(STATUS_ACTIVE) {
        return Err(ProvisionError::AlreadyActive);
    }

    let before: BTreeSet<String> = gw.triggers.list()?.into_iter().map(|t| t.id).collect();
    match activate(gw, layout, &settings, settings_sheet) {
        Ok(()) => {
            let name = settings.text(names::COHORT_NAME).unwrap_or_default();
            gw.notifier.info(&format!("Cohort {name} activated"));
            Ok(())
        }
        Err(err) => {
            rollback_triggers(gw, &before);
            gw.notifier
                .error(&format!("Error starting cohort {}: {err:#}", layout.cohort_book));
            Err(ProvisionError::StartFailed)
        }
    }
}

fn activate(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    settings: &CohortSettings,
    mut settings_sheet: Sheet,
) -> anyhow::Result<()> {
    let folder = settings
        .raw(names::COHORT_FOLDER_ID)
        .ok_or_else(|| anyhow!("{:?} is not set", names::COHORT_FOLDER_ID))?;
    let facilitator = settings
        .raw(names::FACILITATOR_EMAIL)
        .ok_or_else(|| anyhow!("{:?} is not set", names::FACILITATOR_EMAIL))?;
    forms::share_silently(
        &mut *gw.documents,
        &resource_id(&folder),
        &facilitator,
        ShareRole::Writer,
        gw.notifier,
    );

    gw.triggers
        .install(TriggerKind::DailyEmail, Some(layout.trigger_hour))
        .context("failed to install daily email trigger")?;
    gw.triggers
        .install(TriggerKind::FormSubmit, None)
        .context("failed to install form submit trigger")?;

    let forms = flow_forms(gw, layout)?;
    set_forms_accepting(gw, &forms, true).context("failed to open survey forms")?;

    set_setting(&mut settings_sheet, names::COHORT_STATUS, STATUS_ACTIVE);
    gw.sheets
        .save_sheet(&layout.cohort_book, &settings_sheet)
        .context("failed to save cohort settings")?;
    tracing::info!(book = %layout.cohort_book, forms = forms.len(), "cohort activated");
    Ok(())
}

/// Remove every trigger not present in `before`.
fn rollback_triggers(gw: &mut Gateways<'_>, before: &BTreeSet<String>) {
    let current = match gw.triggers.list() {
        Ok(current) => current,
        Err(err) => {
            tracing::error!(error = %err, "cannot list triggers for rollback");
            return;
        }
    };
    for trigger in current.iter().filter(|t| !before.contains(&t.id)) {
        match gw.triggers.remove(&trigger.id) {
            Ok(()) => tracing::info!(trigger = %trigger.id, kind = ?trigger.kind, "rolled back trigger"),
            Err(err) => tracing::error!(trigger = %trigger.id, error = %err, "rollback failed"),
        }
    }
}

/// Turn the cohort off once every scheduled email has gone out.
pub fn end_cohort(
    gw: &mut Gateways<'_>,
    layout: &CohortLayout,
    today: NaiveDate,
) -> anyhow::Result<()> {
    let triggers = gw.triggers.list()?;
    for trigger in triggers {
        gw.triggers
            .remove(&trigger.id)
            .with_context(|| format!("failed to remove trigger {}", trigger.id))?;
    }

    let forms = flow_forms(gw, layout)?;
    for form in forms {
        if let Err(err) = gw.forms.set_accepting_responses(&form, false) {
            tracing::warn!(form = %form, error = %err, "could not close survey form");
        }
    }

    let mut settings_sheet = gw
        .sheets
        .load_sheet(&layout.cohort_book, &layout.settings_sheet)
        .context("failed to load cohort settings")?;
    set_setting(&mut settings_sheet, names::COHORT_STATUS, STATUS_COMPLETED);
    set_setting(&mut settings_sheet, names::COMPLETED, today);
    gw.sheets
        .save_sheet(&layout.cohort_book, &settings_sheet)
        .context("failed to save cohort settings")?;

    let name = CohortSettings::load(&settings_sheet)
        .text(names::COHORT_NAME)
        .unwrap_or_default();
    tracing::info!(cohort = %name, "cohort completed, triggers removed and forms closed");
    Ok(())
}
