//! The chart action a host build server mounts on a job page.
//!
//! The host adapter supplies a [`JobContext`], a [`ConfigLookup`] and the
//! metric metadata of the last analysis, then forwards image requests to
//! [`PluginAction::render`]. Validation and I/O problems are logged and end
//! the request without output; they never reach the transport layer.

use crate::chart::{ChartRenderer, ChartSpec, ChartType, PngChartRenderer};
use crate::config::{ConfigKey, ConfigLookup};
use crate::error::{Error, Result};
use crate::history::{MetricHistoryProvider, MetricHistoryStore};
use crate::model::{MetricDescriptor, MetricRegistry};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

pub const METRIC_PARAMETER: &str = "metric";
pub const TYPE_PARAMETER: &str = "type";

pub const PNG_CONTENT_TYPE: &str = "image/png";

// ============================================================================
// Host capabilities
// ============================================================================

/// Multi-valued request parameters.
pub trait QueryParams {
    /// First value of the named parameter, if any.
    fn first_value(&self, name: &str) -> Option<&str>;
}

impl QueryParams for HashMap<String, Vec<String>> {
    fn first_value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }
}

impl QueryParams for BTreeMap<String, Vec<String>> {
    fn first_value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }
}

fn first_pair_value<'a>(pairs: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    pairs.iter().find(|(key, _)| *key == name).map(|(_, v)| *v)
}

impl QueryParams for Vec<(&str, &str)> {
    fn first_value(&self, name: &str) -> Option<&str> {
        first_pair_value(self, name)
    }
}

impl<const N: usize> QueryParams for [(&str, &str); N] {
    fn first_value(&self, name: &str) -> Option<&str> {
        first_pair_value(self, name)
    }
}

/// Decode a raw `a=1&b=2` query string into a parameter map.
pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// The job the action belongs to.
pub trait JobContext: Send + Sync {
    /// Directory owned by the job; history files live below it.
    fn root_dir(&self) -> &Path;
    fn job_name(&self) -> &str;
    /// Public root URL of the build server, when configured.
    fn base_url(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub root_dir: PathBuf,
    pub name: String,
    pub base_url: Option<String>,
}

impl Job {
    pub fn new(root_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            name: name.into(),
            base_url: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

impl JobContext for Job {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn job_name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }
}

// ============================================================================
// Action surface
// ============================================================================

/// A rendered chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImage {
    pub png: Vec<u8>,
    /// Timestamp of the newest plotted build; hosts use it for cache validation.
    pub last_modified: Option<DateTime<Utc>>,
}

impl ChartImage {
    pub const fn content_type(&self) -> &'static str {
        PNG_CONTENT_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartResponse {
    Image(ChartImage),
    /// The client's cached copy is still current.
    NotModified,
}

/// What a host needs to mount an action on a job page.
pub trait PluginAction: Send + Sync {
    fn icon_path(&self) -> &str;
    fn display_name(&self) -> &str;
    /// Last URL segment, e.g. `https://ci.example.com/job/demo/<segment>`.
    fn url_segment(&self) -> &str;
    /// Render the requested image; `None` means nothing is written to the response.
    fn render(&self, params: &dyn QueryParams) -> Option<ChartImage>;
}

/// A validated chart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRequest {
    pub metric: MetricDescriptor,
    pub chart_type: ChartType,
}

impl ChartRequest {
    pub const fn spec(&self) -> ChartSpec {
        ChartSpec::for_type(self.chart_type)
    }
}

// ============================================================================
// Chart Action
// ============================================================================

pub struct SonargraphChartAction {
    job: Arc<dyn JobContext>,
    config: Arc<dyn ConfigLookup>,
    registry: Arc<dyn MetricRegistry>,
    renderer: Arc<dyn ChartRenderer>,
    selected_metrics: Vec<String>,
}

impl SonargraphChartAction {
    pub fn new(
        job: Arc<dyn JobContext>,
        config: Arc<dyn ConfigLookup>,
        registry: Arc<dyn MetricRegistry>,
        selected_metrics: Vec<String>,
    ) -> Self {
        Self {
            job,
            config,
            registry,
            renderer: Arc::new(PngChartRenderer::default()),
            selected_metrics,
        }
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn ChartRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Metric names the job page shows a chart for, in display order.
    pub fn charts_for_metrics(&self) -> &[String] {
        &self.selected_metrics
    }

    pub fn history_file(&self) -> PathBuf {
        self.job
            .root_dir()
            .join(self.config.value(ConfigKey::MetricHistoryCsvFilePath))
    }

    /// Link to the job's HTML report action.
    pub fn report_url(&self) -> Option<Url> {
        let base = self.job.base_url()?;
        let separator = if base.ends_with('/') { "" } else { "/" };
        let raw = format!(
            "{base}{separator}{}{}/{}",
            self.config.value(ConfigKey::JobFolder),
            self.job.job_name(),
            self.config.value(ConfigKey::HtmlReportActionUrl)
        );
        match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!(url = %raw, error = %err, "Invalid report URL");
                None
            }
        }
    }

    /// Validate `metric` and `type`.
    pub fn parse_request(&self, params: &dyn QueryParams) -> Result<ChartRequest> {
        let Some(metric_name) = params.first_value(METRIC_PARAMETER) else {
            return Err(Error::validation("No metric specified for creating a plot."));
        };
        let Some(metric) = self.registry.lookup(metric_name) else {
            return Err(Error::validation(format!(
                "Specified metric '{metric_name}' is not supported."
            )));
        };
        let chart_type = match params.first_value(TYPE_PARAMETER) {
            None => ChartType::default(),
            Some(value) => value.parse::<ChartType>()?,
        };
        Ok(ChartRequest {
            metric: metric.clone(),
            chart_type,
        })
    }

    /// Render unless the client's copy from `if_modified_since` is still current.
    ///
    /// `None` means the request failed and the failure has been logged.
    pub fn render_conditional(
        &self,
        params: &dyn QueryParams,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Option<ChartResponse> {
        let request = match self.parse_request(params) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(job = %self.job.job_name(), "{err}");
                return None;
            }
        };

        match self.produce(&request, if_modified_since) {
            Ok(response) => Some(response),
            Err(err) => {
                tracing::error!(
                    job = %self.job.job_name(),
                    metric = %request.metric.id,
                    error = %err,
                    "Error generating the graphic for metric '{}'",
                    request.metric.id
                );
                None
            }
        }
    }

    fn produce(
        &self,
        request: &ChartRequest,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<ChartResponse> {
        let spec = request.spec();
        let store = MetricHistoryStore::new(self.history_file());
        tracing::debug!(
            metric = %request.metric.id,
            chart_type = request.chart_type.as_str(),
            path = %store.path().display(),
            "Generating chart"
        );

        let samples = store.read_series(&request.metric.id, spec.max_data_points)?;
        let plot = spec
            .plot_strategy
            .build_plot(&spec, &request.metric, &samples, true);
        let last_modified = match plot.last_displayed {
            Some(ts) => Some(ts),
            None => store.timestamp_of_most_recent_sample()?,
        };

        if let (Some(since), Some(modified)) = (if_modified_since, last_modified) {
            // HTTP dates carry whole seconds only.
            if modified.timestamp() <= since.timestamp() {
                return Ok(ChartResponse::NotModified);
            }
        }

        let png = self.renderer.render(&spec, &plot)?;
        Ok(ChartResponse::Image(ChartImage { png, last_modified }))
    }
}

impl PluginAction for SonargraphChartAction {
    fn icon_path(&self) -> &str {
        self.config.value(ConfigKey::SonargraphIcon)
    }

    fn display_name(&self) -> &str {
        self.config.value(ConfigKey::ActionDisplayName)
    }

    fn url_segment(&self) -> &str {
        self.config.value(ConfigKey::ActionUrlName)
    }

    fn render(&self, params: &dyn QueryParams) -> Option<ChartImage> {
        match self.render_conditional(params, None)? {
            ChartResponse::Image(image) => Some(image),
            ChartResponse::NotModified => None,
        }
    }
}
