pub mod document;
pub mod fill;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::hr_report::ReportTable;
use crate::models::{keys, Record};
use crate::notify::Notifier;
use crate::rows::normalize_header;
use crate::settings::CohortSettings;

use self::document::{Block, Document};
use self::fill::{FieldSet, HyperlinkSubstitution};

static MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.*?)>").expect("Invalid regex pattern"));
static PARTICIPANT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Participant: *(.*)$").expect("Invalid regex pattern"));
static SETTINGS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Settings: *(.*)$").expect("Invalid regex pattern"));
static SURVEY_LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^360.*Link").expect("Invalid regex pattern"));
static SURVEY_DUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^360.*Due Date").expect("Invalid regex pattern"));
static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLink\b").expect("Invalid regex pattern"));

/// Display text for prefilled survey links.
pub const SURVEY_LINK_TEXT: &str = "Click here";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Survey,
    Setting(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerKind {
    Participant(String),
    Settings(String),
    Hyperlink(LinkTarget),
    Table(ReportTable),
    FlowDate(&'static str),
    Unrecognized,
}

impl MarkerKind {
    pub fn classify(name: &str) -> Self {
        if let Some(table) = ReportTable::from_marker(name) {
            return MarkerKind::Table(table);
        }
        if let Some(captures) = PARTICIPANT_PATTERN.captures(name) {
            return MarkerKind::Participant(normalize_header(captures[1].trim()));
        }
        if let Some(captures) = SETTINGS_PATTERN.captures(name) {
            return MarkerKind::Settings(captures[1].trim().to_string());
        }
        if SURVEY_LINK_PATTERN.is_match(name) {
            return MarkerKind::Hyperlink(LinkTarget::Survey);
        }
        if SURVEY_DUE_PATTERN.is_match(name) {
            return MarkerKind::FlowDate(keys::SURVEY_DUE_DATE);
        }
        if LINK_PATTERN.is_match(name) {
            return MarkerKind::Hyperlink(LinkTarget::Setting(name.trim().to_string()));
        }
        MarkerKind::Unrecognized
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMarker {
    pub name: String,
    pub kind: MarkerKind,
    pub in_table: bool,
}

/// Distinct marker names in `text`, in order of first appearance.
pub fn discover(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    MARKER_PATTERN
        .captures_iter(text)
        .map(|captures| captures[1].to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Discover and classify every marker in `document`.
pub fn scan(document: &Document) -> Vec<TemplateMarker> {
    let table_markers: BTreeSet<String> = document
        .body
        .iter()
        .find_map(|block| match block {
            Block::Table(table) => Some(table),
            Block::Paragraph(_) => None,
        })
        .map(|table| {
            let text: Vec<String> = table
                .rows
                .iter()
                .flat_map(|row| row.cells.iter().map(|cell| cell.text()))
                .collect();
            discover(&text.join("\n")).into_iter().collect()
        })
        .unwrap_or_default();

    discover(&document.text())
        .into_iter()
        .map(|name| TemplateMarker {
            kind: MarkerKind::classify(&name),
            in_table: table_markers.contains(&name),
            name,
        })
        .collect()
}

/// Which markers a resolution pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Body,
    TableRow,
}

/// Resolves one template's markers for successive recipients, collecting
/// configuration warnings so each is reported once per template.
pub struct Resolver<'a> {
    template: String,
    markers: Vec<TemplateMarker>,
    settings: &'a CohortSettings,
    flow_row: Option<&'a Record>,
    warnings: BTreeSet<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        template: impl Into<String>,
        document: &Document,
        settings: &'a CohortSettings,
        flow_row: Option<&'a Record>,
    ) -> Self {
        Self {
            template: template.into(),
            markers: scan(document),
            settings,
            flow_row,
            warnings: BTreeSet::new(),
        }
    }

    pub fn has_table_markers(&self) -> bool {
        self.markers.iter().any(|marker| marker.in_table)
    }

    /// Build the field set for one recipient. `survey_url` is the prefilled
    /// survey link for that recipient, when the row has a survey.
    pub fn resolve(
        &mut self,
        scope: Scope,
        participant: Option<&Record>,
        survey_url: Option<&str>,
    ) -> FieldSet {
        let mut fields = FieldSet::default();
        let markers: Vec<TemplateMarker> = self
            .markers
            .iter()
            .filter(|marker| match scope {
                Scope::All => true,
                Scope::Body => !marker.in_table,
                Scope::TableRow => marker.in_table,
            })
            .cloned()
            .collect();

        for marker in markers {
            match &marker.kind {
                MarkerKind::Participant(key) => {
                    let value = participant.and_then(|record| record.text(key));
                    if value.is_none() {
                        self.warn(&marker, "has no participant value");
                    }
                    fields.set(&marker.name, value.unwrap_or_default());
                }
                MarkerKind::Settings(key) => {
                    let value = self.settings.text(key);
                    if value.is_none() {
                        self.warn(&marker, "refers to a missing cohort setting");
                    }
                    fields.set(&marker.name, value.unwrap_or_default());
                }
                MarkerKind::Hyperlink(LinkTarget::Survey) => match survey_url {
                    Some(url) => fields.links.push(HyperlinkSubstitution {
                        marker: marker.name.clone(),
                        url: url.to_string(),
                        display_text: SURVEY_LINK_TEXT.to_string(),
                    }),
                    None => {
                        self.warn(&marker, "needs a survey link but the schedule row has none");
                        fields.set(&marker.name, "");
                    }
                },
                MarkerKind::Hyperlink(LinkTarget::Setting(key)) => {
                    let stripped = key.trim_end_matches(" Link").trim_end_matches(" link");
                    match self
                        .settings
                        .raw(key)
                        .or_else(|| self.settings.raw(stripped))
                    {
                        Some(url) => fields.links.push(HyperlinkSubstitution {
                            marker: marker.name.clone(),
                            display_text: url.clone(),
                            url,
                        }),
                        None => {
                            self.warn(&marker, "refers to a missing cohort setting");
                            fields.set(&marker.name, "");
                        }
                    }
                }
                MarkerKind::FlowDate(key) => {
                    let value = self.flow_row.and_then(|row| row.text(key));
                    if value.is_none() {
                        self.warn(&marker, "has no date on the schedule row");
                    }
                    fields.set(&marker.name, value.unwrap_or_default());
                }
                MarkerKind::Table(_) => {
                    self.warn(&marker, "is a report table outside an HR report");
                    fields.set(&marker.name, "");
                }
                MarkerKind::Unrecognized => {
                    self.warn(&marker, "is not a recognized field");
                    fields.set(&marker.name, "");
                }
            }
        }
        fields
    }

    fn warn(&mut self, marker: &TemplateMarker, problem: &str) {
        self.warnings.insert(format!(
            "Template {:?} field \"<{}>\" {problem}",
            self.template, marker.name
        ));
    }

    /// Send collected warnings to the channel, once each.
    pub fn report(&mut self, notifier: &dyn Notifier) {
        for warning in std::mem::take(&mut self.warnings) {
            notifier.warn(&warning);
        }
    }
}
