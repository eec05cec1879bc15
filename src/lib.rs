//! Sonargraph metric history, report archive and trend charts for CI build servers.
//!
//! The crate is the core of a build-server integration: the host adapter
//! records each build's metric values in a [`MetricHistoryStore`], keeps the
//! raw report in a [`ReportHistoryArchive`] and serves chart images through
//! [`SonargraphChartAction`]. Logging goes through `tracing`; the host owns
//! the subscriber.

#![forbid(unsafe_code)]

pub mod action;
pub mod archive;
pub mod chart;
pub mod config;
pub mod error;
pub mod history;
pub mod model;

pub use action::{
    ChartImage, ChartRequest, ChartResponse, Job, JobContext, PluginAction, QueryParams,
    SonargraphChartAction, parse_query,
};
pub use archive::{ArchiveEntry, EntryKind, ReportHistoryArchive};
pub use chart::{ChartRenderer, ChartSpec, ChartType, PlotData, PlotStrategy, PngChartRenderer};
pub use config::{ConfigKey, ConfigLookup, PluginConfig};
pub use error::{Error, ErrorKind, Result};
pub use history::{MetricHistoryProvider, MetricHistoryStore};
pub use model::{BuildNumber, MetricDescriptor, MetricId, MetricMetaData, MetricRegistry, MetricSample};
