//! Application configuration (`cohort-flow.toml`).
//!
//! Resolution order: CLI flag > environment > config file > default. The
//! CLI layer is applied by `main`; this module covers the rest.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "cohort-flow.toml";
pub const WORKSPACE_ENV: &str = "COHORT_FLOW_WORKSPACE";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Where the cohort's sheets live and how they are laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortLayout {
    pub cohort_book: String,
    pub flow_sheet: String,
    pub settings_sheet: String,
    pub participant_sheet: String,
    pub goals_sheet: String,
    pub participant_header_row: usize,
    pub bcc: Option<String>,
    pub trigger_hour: u32,
}

impl Default for CohortLayout {
    fn default() -> Self {
        Self {
            cohort_book: "cohort".to_string(),
            flow_sheet: "Email Flow".to_string(),
            settings_sheet: "Cohort Settings".to_string(),
            participant_sheet: "Participant List".to_string(),
            goals_sheet: "Program Goals".to_string(),
            participant_header_row: 3,
            bcc: None,
            trigger_hour: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workspace: PathBuf,
    pub database_url: Option<String>,
    #[serde(flatten)]
    pub layout: CohortLayout,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("workspace"),
            database_url: None,
            layout: CohortLayout::default(),
        }
    }
}

impl AppConfig {
    /// Read `path` when it exists, then apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.merge_env_vars();
        Ok(config)
    }

    pub fn merge_env_vars(&mut self) {
        self.merge_env(|name| std::env::var(name).ok());
    }

    fn merge_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(workspace) = lookup(WORKSPACE_ENV).filter(|value| !value.is_empty()) {
            self.workspace = PathBuf::from(workspace);
        }
        if let Some(url) = lookup(DATABASE_URL_ENV).filter(|value| !value.is_empty()) {
            self.database_url = Some(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_override_defaults_and_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "workspace = \"/srv/cohorts/spring\"\n\
             cohort_book = \"spring-2020\"\n\
             bcc = \"ops@example.com\"\n\
             participant_header_row = 1\n",
        )
        .unwrap();

        let mut config: AppConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.layout.cohort_book, "spring-2020");
        assert_eq!(config.layout.flow_sheet, "Email Flow");
        assert_eq!(config.layout.participant_header_row, 1);
        assert_eq!(config.layout.bcc.as_deref(), Some("ops@example.com"));

        let env = HashMap::from([
            (WORKSPACE_ENV, "/tmp/override"),
            (DATABASE_URL_ENV, "postgres://localhost/cohorts"),
        ]);
        config.merge_env(|name| env.get(name).map(|value| value.to_string()));
        assert_eq!(config.workspace, PathBuf::from("/tmp/override"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/cohorts"));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config: AppConfig = toml::from_str("").unwrap();
        config.merge_env(|_| Some(String::new()));
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.layout.participant_header_row, 3);
    }
}
