use crate::models::{keys, questions, Record};
use crate::notify::Notifier;
use crate::settings::{names, CohortSettings};
use crate::store::{DocumentStore, FormItem, FormStore, ShareError, ShareRole, StoreError};

fn find_item<'a>(items: &'a [FormItem], title: &str) -> Option<&'a FormItem> {
    let wanted = title.trim().to_lowercase();
    items
        .iter()
        .find(|item| item.title.trim().to_lowercase() == wanted)
}

/// Responder URL with `fields` (question title, answer) prefilled.
///
/// Titles match trimmed and case-insensitively; unknown titles are reported
/// and skipped. Falls back to the plain form URL when nothing matched.
pub fn prefilled_url(
    forms: &dyn FormStore,
    form: &str,
    fields: &[(&str, &str)],
    notifier: &dyn Notifier,
) -> Result<String, StoreError> {
    let items = forms.items(form)?;
    let mut answers = Vec::new();
    for (title, value) in fields {
        match find_item(&items, title) {
            Some(item) => answers.push((item.clone(), value.to_string())),
            None => notifier.warn(&format!("{title:?} not found in form {form}")),
        }
    }
    if answers.is_empty() {
        return forms.form_url(form);
    }
    forms.prefilled_url(form, &answers)
}

/// Survey link for `recipient` answering about `participant`.
pub fn survey_link(
    forms: &dyn FormStore,
    form: &str,
    participant: &Record,
    recipient: &str,
    settings: &CohortSettings,
    notifier: &dyn Notifier,
) -> Result<String, StoreError> {
    let id = participant.raw(keys::PARTICIPANT_ID).unwrap_or_default();
    let name = participant.text(keys::PARTICIPANT_NAME).unwrap_or_default();
    let name_field = settings.raw(names::PARTICIPANT_NAME_FIELD);

    let mut fields = vec![
        (questions::SURVEY_ID, id.as_str()),
        (questions::RESPONDENT_EMAIL, recipient),
    ];
    if let Some(name_field) = name_field.as_deref() {
        fields.push((name_field, name.as_str()));
    }
    prefilled_url(forms, form, &fields, notifier)
}

/// Whether `recipient` already answered the survey about `participant_id`.
///
/// A form without the `Survey ID` or `Your email address` question cannot
/// be checked; that is reported as an error and treated as not submitted.
pub fn already_submitted(
    forms: &dyn FormStore,
    form: &str,
    participant_id: &str,
    recipient: &str,
    notifier: &dyn Notifier,
) -> Result<bool, StoreError> {
    let items = forms.items(form)?;
    let mut checkable = true;
    for title in [questions::SURVEY_ID, questions::RESPONDENT_EMAIL] {
        if !items.iter().any(|item| item.title == title) {
            notifier.error(&format!("Form doesn't have a {title:?} field: {form}"));
            checkable = false;
        }
    }
    if !checkable {
        return Ok(false);
    }

    let submitted = forms.responses(form)?.iter().any(|response| {
        response.answer(questions::SURVEY_ID) == Some(participant_id)
            && response
                .answer(questions::RESPONDENT_EMAIL)
                .is_some_and(|email| email.eq_ignore_ascii_case(recipient.trim()))
    });
    Ok(submitted)
}

/// `name+tag@domain` -> `name@domain`.
pub fn strip_alias(email: &str) -> String {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) => {
            let local = local.split_once('+').map_or(local, |(base, _)| base);
            format!("{local}@{domain}")
        }
        None => email.to_string(),
    }
}

/// Share without notification, retrying once with notification when the
/// address has no compatible account. Failures are reported, never raised.
pub fn share_silently(
    documents: &mut dyn DocumentStore,
    file: &str,
    email: &str,
    role: ShareRole,
    notifier: &dyn Notifier,
) -> bool {
    let email = strip_alias(email);
    let first = documents.share(file, &email, role, false);
    let outcome = match first {
        Err(ShareError::NoCompatibleAccount(_)) => {
            tracing::debug!(%email, file, "silent share refused, retrying with notification");
            documents.share(file, &email, role, true)
        }
        other => other,
    };
    match outcome {
        Ok(()) => true,
        Err(err) => {
            notifier.warn(&format!("Couldn't share file {file} with {email}: {err}"));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Level, OpsChannel};
    use crate::store::memory::{MemoryDocuments, MemoryForms};
    use crate::store::FormResponse;
    use crate::template::document::Document;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn survey() -> MemoryForms {
        let mut forms = MemoryForms::default();
        forms.add_form(
            "f1",
            "360 #1",
            &["Survey ID", "Your email address", "Participant Name", "Strengths"],
        );
        forms
    }

    fn submit(forms: &mut MemoryForms, id: &str, email: &str) {
        forms.submit(
            "f1",
            FormResponse {
                submitted_at: NaiveDate::from_ymd_opt(2020, 7, 22)
                    .unwrap()
                    .and_hms_opt(8, 0, 0)
                    .unwrap(),
                answers: BTreeMap::from([
                    ("Survey ID".to_string(), id.to_string()),
                    ("Your email address".to_string(), email.to_string()),
                ]),
            },
        );
    }

    #[test]
    fn prefilled_url_matches_titles_loosely_and_warns_on_unknown() {
        let forms = survey();
        let channel = OpsChannel::new();
        let url = prefilled_url(
            &forms,
            "f1",
            &[(" survey id ", "p1"), ("Favourite colour", "blue")],
            &channel,
        )
        .unwrap();
        assert!(url.contains("usp=pp_url"), "{url}");
        assert!(url.contains("=p1"), "{url}");
        assert_eq!(channel.messages(Level::Warning).len(), 1);

        let plain = prefilled_url(&forms, "f1", &[("Nope", "x")], &channel).unwrap();
        assert_eq!(plain, forms.form_url("f1").unwrap());
    }

    #[test]
    fn survey_link_prefills_the_participant_name_question() {
        let forms = survey();
        let settings = CohortSettings::from_pairs([(names::PARTICIPANT_NAME_FIELD, "Participant Name")]);
        let mut participant = Record::new();
        participant.set(keys::PARTICIPANT_ID, "p1");
        participant.set(keys::PARTICIPANT_NAME, "Avery");
        let channel = OpsChannel::new();
        let url = survey_link(&forms, "f1", &participant, "a@x.com", &settings, &channel).unwrap();
        assert!(url.contains("Avery"), "{url}");
        assert!(channel.snapshot().is_empty());
    }

    #[test]
    fn already_submitted_needs_both_id_and_email() {
        let mut forms = survey();
        submit(&mut forms, "p1", "a@x.com");
        let channel = OpsChannel::new();
        assert!(already_submitted(&forms, "f1", "p1", "A@x.com", &channel).unwrap());
        assert!(!already_submitted(&forms, "f1", "p1", "b@x.com", &channel).unwrap());
        assert!(!already_submitted(&forms, "f1", "p2", "a@x.com", &channel).unwrap());
    }

    #[test]
    fn form_without_survey_id_is_an_error_and_not_submitted() {
        let mut forms = MemoryForms::default();
        forms.add_form("f2", "Feedback", &["Your email address"]);
        let channel = OpsChannel::new();
        assert!(!already_submitted(&forms, "f2", "p1", "a@x.com", &channel).unwrap());
        assert_eq!(channel.messages(Level::Error).len(), 1);
    }

    #[test]
    fn strip_alias_removes_plus_tags() {
        assert_eq!(strip_alias("kim+participant4@example.com"), "kim@example.com");
        assert_eq!(strip_alias("kim@example.com"), "kim@example.com");
    }

    #[test]
    fn share_retries_with_notification_then_degrades() {
        let mut documents = MemoryDocuments::default();
        documents.insert(Document::new("results-1", "Avery - 360 Results"));
        documents.incompatible_accounts.insert("kim@example.com".into());
        let channel = OpsChannel::new();

        assert!(share_silently(
            &mut documents,
            "results-1",
            "kim+p1@example.com",
            ShareRole::Reader,
            &channel
        ));
        assert_eq!(
            documents.shares,
            vec![("results-1".to_string(), "kim@example.com".to_string(), ShareRole::Reader, true)]
        );

        assert!(!share_silently(
            &mut documents,
            "missing",
            "kim@example.com",
            ShareRole::Reader,
            &channel
        ));
        assert_eq!(channel.messages(Level::Warning).len(), 1);
    }
}
