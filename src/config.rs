//! Plugin configuration.
//!
//! Every value the core needs from the host (icon, action naming, file
//! locations under the job root, URL segments) is resolved through
//! [`ConfigLookup`]. [`PluginConfig`] is the stock implementation: built-in
//! defaults, optionally overridden from a JSON file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Keys of the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    SonargraphIcon,
    ActionDisplayName,
    ActionUrlName,
    MetricHistoryCsvFilePath,
    JobFolder,
    HtmlReportActionUrl,
    ReportHistoryFolder,
}

impl ConfigKey {
    pub const ALL: [Self; 7] = [
        Self::SonargraphIcon,
        Self::ActionDisplayName,
        Self::ActionUrlName,
        Self::MetricHistoryCsvFilePath,
        Self::JobFolder,
        Self::HtmlReportActionUrl,
        Self::ReportHistoryFolder,
    ];

    /// Name of the key as it appears in the JSON configuration file.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SonargraphIcon => "sonargraph_icon",
            Self::ActionDisplayName => "action_display_name",
            Self::ActionUrlName => "action_url_name",
            Self::MetricHistoryCsvFilePath => "metric_history_csv_file_path",
            Self::JobFolder => "job_folder",
            Self::HtmlReportActionUrl => "html_report_action_url",
            Self::ReportHistoryFolder => "report_history_folder",
        }
    }
}

/// Key to value lookup.
pub trait ConfigLookup: Send + Sync {
    fn value(&self, key: ConfigKey) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    pub sonargraph_icon: String,
    pub action_display_name: String,
    pub action_url_name: String,
    pub metric_history_csv_file_path: String,
    pub job_folder: String,
    pub html_report_action_url: String,
    pub report_history_folder: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            sonargraph_icon: "/plugin/sonargraph-integration/icons/sonargraph.png".to_string(),
            action_display_name: "Sonargraph".to_string(),
            action_url_name: "sonargraph".to_string(),
            metric_history_csv_file_path: "sonargraph/sonargraph-metric-history.csv".to_string(),
            job_folder: "job/".to_string(),
            html_report_action_url: "sonargraph-html-report".to_string(),
            report_history_folder: "sonargraphReportHistory".to_string(),
        }
    }
}

impl PluginConfig {
    /// Parse a JSON document. Missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read config {}", path.display()), e))?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), "Loaded plugin configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for key in ConfigKey::ALL {
            if self.value(key).trim().is_empty() {
                return Err(Error::config(format!("'{}' must not be empty", key.as_str())));
            }
        }
        if Path::new(&self.metric_history_csv_file_path).is_absolute() {
            return Err(Error::config(
                "'metric_history_csv_file_path' must be relative to the job root",
            ));
        }
        if Path::new(&self.report_history_folder).is_absolute() {
            return Err(Error::config(
                "'report_history_folder' must be relative to the job root",
            ));
        }
        Ok(())
    }
}

impl ConfigLookup for PluginConfig {
    fn value(&self, key: ConfigKey) -> &str {
        match key {
            ConfigKey::SonargraphIcon => &self.sonargraph_icon,
            ConfigKey::ActionDisplayName => &self.action_display_name,
            ConfigKey::ActionUrlName => &self.action_url_name,
            ConfigKey::MetricHistoryCsvFilePath => &self.metric_history_csv_file_path,
            ConfigKey::JobFolder => &self.job_folder,
            ConfigKey::HtmlReportActionUrl => &self.html_report_action_url,
            ConfigKey::ReportHistoryFolder => &self.report_history_folder,
        }
    }
}
