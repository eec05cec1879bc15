//! Command-line host adapter.
//!
//! Stands in for the build server: records a build's metric values, archives
//! its report, lists retained reports and renders chart images the way the
//! job page would request them.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sonargraph::{
    ChartResponse, ConfigKey, ConfigLookup, Job, MetricHistoryStore, MetricId, MetricMetaData,
    PluginConfig, ReportHistoryArchive, SonargraphChartAction, parse_query,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sonargraph-charts")]
#[command(about = "Record Sonargraph metrics, archive reports and render trend charts")]
struct Cli {
    /// Job root directory owned by the build server.
    #[arg(long, env = "SONARGRAPH_JOB_ROOT")]
    job_root: PathBuf,

    /// Optional JSON file overriding the plugin configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record one build's metric values (JSON object of metric name to number).
    Record {
        #[arg(long)]
        build: u64,
        /// RFC3339 build timestamp (default: now).
        #[arg(long)]
        timestamp: Option<String>,
        /// Path to the JSON values file.
        #[arg(long)]
        values: PathBuf,
    },
    /// Copy a build's report file or report directory into the history.
    Archive {
        #[arg(long)]
        build: u64,
        #[arg(long)]
        report: PathBuf,
    },
    /// List retained reports.
    Entries,
    /// Render a chart image for a query string such as `metric=CoreNcss&type=longterm`.
    Chart {
        /// Metric metadata JSON exported by the analysis.
        #[arg(long)]
        metadata: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "chart.png")]
        out: PathBuf,
        #[arg(long, default_value = "job")]
        job_name: String,
        /// Skip rendering when nothing changed since this RFC3339 instant.
        #[arg(long)]
        if_modified_since: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid RFC3339 timestamp '{text}'"))?
        .with_timezone(&Utc))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PluginConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PluginConfig::default(),
    };

    match cli.command {
        Command::Record {
            build,
            timestamp,
            values,
        } => {
            let timestamp = timestamp
                .as_deref()
                .map_or_else(|| Ok(Utc::now()), parse_timestamp)?;
            let values: BTreeMap<String, f64> = read_json(&values)?;
            let ids: Vec<(MetricId, f64)> = values
                .into_iter()
                .map(|(name, value)| (MetricId::new(name), value))
                .collect();

            let store = MetricHistoryStore::new(
                cli.job_root
                    .join(config.value(ConfigKey::MetricHistoryCsvFilePath)),
            );
            store
                .append_build(build, timestamp, ids.iter().map(|(id, v)| (id, *v)))
                .context("record metric values")?;
            println!(
                "Recorded {} metric value(s) for build {build} in {}",
                ids.len(),
                store.path().display()
            );
        }
        Command::Archive { build, report } => {
            let archive = ReportHistoryArchive::new(
                &cli.job_root,
                config.value(ConfigKey::ReportHistoryFolder),
            );
            let stored = if report.is_dir() {
                archive.store_report_directory(&report, build)
            } else {
                archive.store_report(&report, build)
            }
            .with_context(|| format!("archive {}", report.display()))?;
            println!("Archived: {}", stored.display());
        }
        Command::Entries => {
            let archive = ReportHistoryArchive::new(
                &cli.job_root,
                config.value(ConfigKey::ReportHistoryFolder),
            );
            for entry in archive.entries().context("list report history")? {
                println!(
                    "{}\t{:?}\t{}",
                    entry.build_number,
                    entry.kind,
                    entry.path.display()
                );
            }
        }
        Command::Chart {
            metadata,
            query,
            out,
            job_name,
            if_modified_since,
        } => {
            let metadata: MetricMetaData = read_json(&metadata)?;
            let since = if_modified_since.as_deref().map(parse_timestamp).transpose()?;
            let action = SonargraphChartAction::new(
                Arc::new(Job::new(&cli.job_root, job_name)),
                Arc::new(config),
                Arc::new(metadata),
                Vec::new(),
            );

            match action.render_conditional(&parse_query(&query), since) {
                Some(ChartResponse::Image(image)) => {
                    std::fs::write(&out, &image.png)
                        .with_context(|| format!("write {}", out.display()))?;
                    println!("Wrote: {} ({})", out.display(), image.content_type());
                }
                Some(ChartResponse::NotModified) => println!("Not modified"),
                None => bail!("no chart produced for '{query}'"),
            }
        }
    }
    Ok(())
}
