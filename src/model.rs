//! Metric identifiers, metadata lookup and per-build samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Build numbers are assigned by the host and increase monotonically per job.
pub type BuildNumber = u64;

/// Identifier of a metric; also the column name in the history table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(String);

impl MetricId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What the analysis export tells us about a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    pub id: MetricId,
    pub presentation_name: String,
    #[serde(default)]
    pub is_float: bool,
}

/// Opaque name to metric lookup over the analysis export's metadata.
pub trait MetricRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<&MetricDescriptor>;
}

/// In-memory registry, loadable from the JSON metadata the build step exports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMetaData {
    #[serde(default)]
    metrics: BTreeMap<String, MetricDescriptor>,
}

impl MetricMetaData {
    /// Registry without any metric; every chart request against it is rejected.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = MetricDescriptor>) -> Self {
        let metrics = descriptors
            .into_iter()
            .map(|d| (d.id.as_str().to_string(), d))
            .collect();
        Self { metrics }
    }

    pub fn insert(&mut self, descriptor: MetricDescriptor) {
        self.metrics
            .insert(descriptor.id.as_str().to_string(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.metrics.values()
    }
}

impl MetricRegistry for MetricMetaData {
    fn lookup(&self, name: &str) -> Option<&MetricDescriptor> {
        self.metrics.get(name)
    }
}

/// One metric value recorded for one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub build_number: BuildNumber,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricSample {
    pub const fn new(build_number: BuildNumber, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            build_number,
            timestamp,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, presentation: &str) -> MetricDescriptor {
        MetricDescriptor {
            id: MetricId::new(name),
            presentation_name: presentation.to_string(),
            is_float: false,
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let meta = MetricMetaData::from_descriptors([
            descriptor("CoreComponents", "Components"),
            descriptor("CoreNcss", "Lines of Code"),
        ]);
        assert_eq!(meta.len(), 2);
        assert_eq!(
            meta.lookup("CoreNcss").map(|d| d.presentation_name.as_str()),
            Some("Lines of Code")
        );
        assert!(meta.lookup("CoreCycles").is_none());
        assert!(MetricMetaData::empty().lookup("CoreNcss").is_none());
    }

    #[test]
    fn test_metadata_json_shape() {
        let json = r#"{
            "metrics": {
                "CoreNcss": {"id": "CoreNcss", "presentationName": "Lines of Code"},
                "CoreAcd": {"id": "CoreAcd", "presentationName": "ACD", "isFloat": true}
            }
        }"#;
        let meta: MetricMetaData = serde_json::from_str(json).expect("parse metadata");
        assert!(meta.lookup("CoreAcd").is_some_and(|d| d.is_float));
        assert!(meta.lookup("CoreNcss").is_some_and(|d| !d.is_float));
    }
}
