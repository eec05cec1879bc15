//! Chart kinds, plot preparation and PNG rendering.

use crate::error::{Error, Result};
use crate::model::{MetricDescriptor, MetricSample};
use chrono::{DateTime, Utc};
use plotters::prelude::*;
use plotters::style::{FontStyle, register_font};
use std::str::FromStr;
use std::sync::OnceLock;

pub const SHORT_TERM: &str = "shortterm";
pub const LONG_TERM: &str = "longterm";

pub const MAX_DATA_POINTS_SHORT_TERM: usize = 25;
pub const MAX_DATA_POINTS_LONG_TERM: usize = 300;

pub const DEFAULT_WIDTH: u32 = 400;
pub const DEFAULT_HEIGHT: u32 = 250;

const X_LABEL_AREA: u32 = 35;
const Y_LABEL_AREA: u32 = 45;
const MARGIN: u32 = 8;

const BUILD_AXIS_LABEL: &str = "Build";
const DATE_AXIS_LABEL: &str = "Date";

// ============================================================================
// Chart Spec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartType {
    #[default]
    ShortTerm,
    LongTerm,
}

impl ChartType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ShortTerm => SHORT_TERM,
            Self::LongTerm => LONG_TERM,
        }
    }
}

impl FromStr for ChartType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            SHORT_TERM => Ok(Self::ShortTerm),
            LONG_TERM => Ok(Self::LongTerm),
            other => Err(Error::validation(format!(
                "Chart type '{other}' is not supported!"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotStrategy {
    /// Value against build number, one marker per build.
    XyLine,
    /// Value against build date, with a moving average over the short-term window.
    TimeSeries,
}

/// Presentation policy resolved from a [`ChartType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChartSpec {
    pub chart_type: ChartType,
    pub x_axis_label: &'static str,
    pub max_data_points: usize,
    pub plot_strategy: PlotStrategy,
    pub short_term_window: usize,
}

impl ChartSpec {
    pub const fn for_type(chart_type: ChartType) -> Self {
        match chart_type {
            ChartType::ShortTerm => Self {
                chart_type,
                x_axis_label: BUILD_AXIS_LABEL,
                max_data_points: MAX_DATA_POINTS_SHORT_TERM,
                plot_strategy: PlotStrategy::XyLine,
                short_term_window: MAX_DATA_POINTS_SHORT_TERM,
            },
            ChartType::LongTerm => Self {
                chart_type,
                x_axis_label: DATE_AXIS_LABEL,
                max_data_points: MAX_DATA_POINTS_LONG_TERM,
                plot_strategy: PlotStrategy::TimeSeries,
                short_term_window: MAX_DATA_POINTS_SHORT_TERM,
            },
        }
    }
}

// ============================================================================
// Plot Data
// ============================================================================

/// A labelled polyline in chart coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSeries {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// Everything a renderer needs besides the [`ChartSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlotData {
    pub strategy: PlotStrategy,
    pub y_axis_label: String,
    pub values: PlotSeries,
    pub trend: Option<PlotSeries>,
    pub show_legend: bool,
    /// Timestamp of the newest displayed sample.
    pub last_displayed: Option<DateTime<Utc>>,
}

impl PlotData {
    pub fn is_empty(&self) -> bool {
        self.values.points.is_empty()
    }

    /// Axis ranges covering every point, padded so that single points and
    /// flat series still get a non-degenerate area.
    pub fn bounds(&self) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
        let all = self
            .values
            .points
            .iter()
            .chain(self.trend.iter().flat_map(|t| t.points.iter()));

        let mut x = (f64::INFINITY, f64::NEG_INFINITY);
        let mut y = (f64::INFINITY, f64::NEG_INFINITY);
        for &(px, py) in all {
            x = (x.0.min(px), x.1.max(px));
            y = (y.0.min(py), y.1.max(py));
        }
        if !x.0.is_finite() {
            return (0.0..1.0, 0.0..1.0);
        }

        let x_pad = if x.1 > x.0 { 0.0 } else { 1.0 };
        let y_span = y.1 - y.0;
        let y_pad = if y_span > 0.0 {
            y_span * 0.05
        } else {
            (y.0.abs() * 0.05).max(1.0)
        };
        ((x.0 - x_pad)..(x.1 + x_pad), (y.0 - y_pad)..(y.1 + y_pad))
    }
}

#[allow(clippy::cast_precision_loss)]
fn x_of(strategy: PlotStrategy, sample: &MetricSample) -> f64 {
    match strategy {
        PlotStrategy::XyLine => sample.build_number as f64,
        PlotStrategy::TimeSeries => sample.timestamp.timestamp_millis() as f64,
    }
}

/// Trailing mean over at most `window` samples ending at each sample.
#[allow(clippy::cast_precision_loss)]
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 {
        return Vec::new();
    }
    let mut sum = 0.0;
    let mut out = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        let count = (i + 1).min(window);
        out.push(sum / count as f64);
    }
    out
}

impl PlotStrategy {
    /// Turn a window of samples (oldest first) into plot coordinates.
    pub fn build_plot(
        self,
        spec: &ChartSpec,
        metric: &MetricDescriptor,
        samples: &[MetricSample],
        show_legend: bool,
    ) -> PlotData {
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (x_of(self, s), s.value))
            .collect();

        let trend = match self {
            Self::XyLine => None,
            Self::TimeSeries => {
                let raw: Vec<f64> = samples.iter().map(|s| s.value).collect();
                let averaged = moving_average(&raw, spec.short_term_window);
                Some(PlotSeries {
                    label: format!("Average of last {} builds", spec.short_term_window),
                    points: points
                        .iter()
                        .zip(averaged)
                        .map(|(&(x, _), avg)| (x, avg))
                        .collect(),
                })
            }
        };

        PlotData {
            strategy: self,
            y_axis_label: metric.presentation_name.clone(),
            values: PlotSeries {
                label: metric.presentation_name.clone(),
                points,
            },
            trend: trend.filter(|t| !t.points.is_empty()),
            show_legend,
            last_displayed: samples.last().map(|s| s.timestamp),
        }
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Rasterizes a prepared plot into image bytes.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, spec: &ChartSpec, plot: &PlotData) -> Result<Vec<u8>>;
}

impl<F> ChartRenderer for F
where
    F: Fn(&ChartSpec, &PlotData) -> Result<Vec<u8>> + Send + Sync,
{
    fn render(&self, spec: &ChartSpec, plot: &PlotData) -> Result<Vec<u8>> {
        self(spec, plot)
    }
}

/// DejaVu Sans, registered with plotters as the `sans-serif` family used by
/// axis labels and the legend.
const LABEL_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

fn register_label_font() -> Result<()> {
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    let registered = *REGISTERED.get_or_init(|| {
        register_font("sans-serif", FontStyle::Normal, LABEL_FONT).is_ok()
    });
    if registered {
        Ok(())
    } else {
        Err(Error::render("embedded label font could not be loaded"))
    }
}

/// PNG renderer backed by `plotters`' bitmap backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PngChartRenderer {
    pub width: u32,
    pub height: u32,
}

impl Default for PngChartRenderer {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

fn render_error(err: impl std::fmt::Display) -> Error {
    Error::render(err.to_string())
}

#[allow(clippy::cast_possible_truncation)]
fn format_x(strategy: PlotStrategy, x: f64) -> String {
    match strategy {
        PlotStrategy::XyLine => format!("{x:.0}"),
        PlotStrategy::TimeSeries => DateTime::from_timestamp_millis(x.round() as i64)
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
    }
}

impl PngChartRenderer {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn draw(&self, spec: &ChartSpec, plot: &PlotData, buffer: &mut [u8]) -> Result<()> {
        register_label_font()?;
        let root = BitMapBackend::with_buffer(buffer, (self.width, self.height)).into_drawing_area();
        root.fill(&WHITE).map_err(render_error)?;

        let (x_range, y_range) = plot.bounds();
        let mut chart = ChartBuilder::on(&root)
            .margin(MARGIN)
            .x_label_area_size(X_LABEL_AREA)
            .y_label_area_size(Y_LABEL_AREA)
            .build_cartesian_2d(x_range, y_range)
            .map_err(render_error)?;

        let strategy = plot.strategy;
        let x_formatter = move |x: &f64| format_x(strategy, *x);
        let mut mesh = chart.configure_mesh();
        mesh.x_label_formatter(&x_formatter)
            .x_labels(5)
            .y_labels(5)
            .x_desc(spec.x_axis_label)
            .y_desc(plot.y_axis_label.as_str());
        mesh.draw().map_err(render_error)?;

        chart
            .draw_series(LineSeries::new(plot.values.points.iter().copied(), &BLUE))
            .map_err(render_error)?
            .label(plot.values.label.as_str())
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

        if plot.strategy == PlotStrategy::XyLine {
            chart
                .draw_series(
                    plot.values
                        .points
                        .iter()
                        .map(|&point| Circle::new(point, 3, BLUE.filled())),
                )
                .map_err(render_error)?;
        }

        if let Some(trend) = &plot.trend {
            chart
                .draw_series(LineSeries::new(trend.points.iter().copied(), &RED))
                .map_err(render_error)?
                .label(trend.label.as_str())
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
        }

        if plot.show_legend {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()
                .map_err(render_error)?;
        }

        root.present().map_err(render_error)?;
        Ok(())
    }
}

impl ChartRenderer for PngChartRenderer {
    fn render(&self, spec: &ChartSpec, plot: &PlotData) -> Result<Vec<u8>> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::render(format!(
                "invalid image size {}x{}",
                self.width, self.height
            )));
        }
        let mut buffer = vec![0_u8; self.width as usize * self.height as usize * 3];
        self.draw(spec, plot, &mut buffer)?;

        let pixels = image::RgbImage::from_raw(self.width, self.height, buffer)
            .ok_or_else(|| Error::render("pixel buffer does not match image size"))?;
        let mut png = std::io::Cursor::new(Vec::new());
        pixels
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(render_error)?;
        Ok(png.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricId;
    use pretty_assertions::assert_eq;

    fn descriptor() -> MetricDescriptor {
        MetricDescriptor {
            id: MetricId::new("CoreNcss"),
            presentation_name: "Lines of Code".to_string(),
            is_float: false,
        }
    }

    fn samples(count: u32) -> Vec<MetricSample> {
        (1..=count)
            .map(|b| {
                MetricSample::new(
                    u64::from(b),
                    DateTime::from_timestamp_millis(i64::from(b) * 86_400_000).expect("ts"),
                    f64::from(b * 10),
                )
            })
            .collect()
    }

    #[test]
    fn test_chart_type_parsing() {
        assert_eq!("shortterm".parse::<ChartType>().ok(), Some(ChartType::ShortTerm));
        assert_eq!("longterm".parse::<ChartType>().ok(), Some(ChartType::LongTerm));
        assert!("LongTerm".parse::<ChartType>().is_err());
        assert!("bogus".parse::<ChartType>().is_err());
        assert_eq!(ChartType::default(), ChartType::ShortTerm);
    }

    #[test]
    fn test_spec_table() {
        let short = ChartSpec::for_type(ChartType::ShortTerm);
        assert_eq!(
            (short.x_axis_label, short.max_data_points, short.plot_strategy),
            ("Build", 25, PlotStrategy::XyLine)
        );
        let long = ChartSpec::for_type(ChartType::LongTerm);
        assert_eq!(
            (long.x_axis_label, long.max_data_points, long.plot_strategy),
            ("Date", 300, PlotStrategy::TimeSeries)
        );
        assert_eq!(long.short_term_window, 25);
    }

    #[test]
    fn test_moving_average() {
        assert_eq!(moving_average(&[2.0, 4.0, 6.0, 8.0], 2), vec![2.0, 3.0, 5.0, 7.0]);
        assert_eq!(moving_average(&[1.0, 2.0, 3.0], 25), vec![1.0, 1.5, 2.0]);
        assert!(moving_average(&[1.0], 0).is_empty());
        assert!(moving_average(&[], 3).is_empty());
    }

    #[test]
    fn test_xy_plot_uses_build_numbers() {
        let spec = ChartSpec::for_type(ChartType::ShortTerm);
        let plot = PlotStrategy::XyLine.build_plot(&spec, &descriptor(), &samples(3), true);
        assert_eq!(plot.values.points, vec![(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]);
        assert!(plot.trend.is_none());
        assert_eq!(plot.y_axis_label, "Lines of Code");
        assert_eq!(plot.last_displayed, samples(3).last().map(|s| s.timestamp));
    }

    #[test]
    fn test_time_series_plot_has_trend() {
        let spec = ChartSpec::for_type(ChartType::LongTerm);
        let plot = PlotStrategy::TimeSeries.build_plot(&spec, &descriptor(), &samples(30), true);
        assert_eq!(plot.values.points.len(), 30);
        assert_eq!(plot.values.points[0].0, 86_400_000.0);
        let trend = plot.trend.expect("trend series");
        assert_eq!(trend.points.len(), 30);
        // Last point averages builds 6..=30 (values 60..=300).
        assert!((trend.points[29].1 - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_plot_bounds() {
        let spec = ChartSpec::for_type(ChartType::LongTerm);
        let plot = PlotStrategy::TimeSeries.build_plot(&spec, &descriptor(), &[], true);
        assert!(plot.is_empty());
        assert!(plot.trend.is_none());
        assert_eq!(plot.bounds(), (0.0..1.0, 0.0..1.0));
    }

    #[test]
    fn test_single_point_bounds_not_degenerate() {
        let spec = ChartSpec::for_type(ChartType::ShortTerm);
        let plot = PlotStrategy::XyLine.build_plot(&spec, &descriptor(), &samples(1), true);
        let (x, y) = plot.bounds();
        assert!(x.start < 1.0 && x.end > 1.0);
        assert!(y.start < 10.0 && y.end > 10.0);
    }

    #[test]
    fn test_png_renderer_output() {
        let renderer = PngChartRenderer::default();
        for chart_type in [ChartType::ShortTerm, ChartType::LongTerm] {
            let spec = ChartSpec::for_type(chart_type);
            for data in [samples(0), samples(1), samples(40)] {
                let plot = spec.plot_strategy.build_plot(&spec, &descriptor(), &data, true);
                let png = renderer.render(&spec, &plot).expect("render png");
                assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
                let decoded = image::load_from_memory_with_format(&png, image::ImageFormat::Png)
                    .expect("decode png");
                assert_eq!((decoded.width(), decoded.height()), (400, 250));
            }
        }
    }

    fn render_rgb(spec: &ChartSpec, plot: &PlotData) -> image::RgbImage {
        let png = PngChartRenderer::default().render(spec, plot).expect("render png");
        image::load_from_memory_with_format(&png, image::ImageFormat::Png)
            .expect("decode png")
            .to_rgb8()
    }

    #[test]
    fn test_axis_description_is_drawn() {
        let spec = ChartSpec::for_type(ChartType::ShortTerm);
        let plot = PlotStrategy::XyLine.build_plot(&spec, &descriptor(), &samples(10), false);
        let pixels = render_rgb(&spec, &plot);

        // Strip below the tick marks, above the bottom margin, right of the y label area.
        let rows = (DEFAULT_HEIGHT - MARGIN - X_LABEL_AREA + 8)..(DEFAULT_HEIGHT - MARGIN);
        let columns = (MARGIN + Y_LABEL_AREA)..(DEFAULT_WIDTH - MARGIN);
        let dark = rows
            .flat_map(|y| columns.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| pixels.get_pixel(x, y).0.iter().all(|&c| c < 128))
            .count();
        assert!(dark > 20, "expected label text below the plot, found {dark} dark pixels");
    }

    #[test]
    fn test_legend_changes_image() {
        let spec = ChartSpec::for_type(ChartType::LongTerm);
        let with_legend =
            PlotStrategy::TimeSeries.build_plot(&spec, &descriptor(), &samples(30), true);
        let without_legend = PlotData {
            show_legend: false,
            ..with_legend.clone()
        };
        assert_ne!(
            render_rgb(&spec, &with_legend).into_raw(),
            render_rgb(&spec, &without_legend).into_raw()
        );
    }

    #[test]
    fn test_label_font_registers() {
        register_label_font().expect("font registers");
        register_label_font().expect("registration is idempotent");
    }

    #[test]
    fn test_zero_size_rejected() {
        let spec = ChartSpec::for_type(ChartType::ShortTerm);
        let plot = PlotStrategy::XyLine.build_plot(&spec, &descriptor(), &samples(2), true);
        let err = PngChartRenderer::new(0, 10).render(&spec, &plot).unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }

    #[test]
    fn test_closure_renderer() {
        let renderer = |_: &ChartSpec, plot: &PlotData| -> Result<Vec<u8>> {
            Ok(vec![u8::try_from(plot.values.points.len()).unwrap_or(u8::MAX)])
        };
        let spec = ChartSpec::for_type(ChartType::ShortTerm);
        let plot = PlotStrategy::XyLine.build_plot(&spec, &descriptor(), &samples(4), false);
        assert_eq!(renderer.render(&spec, &plot).expect("render"), vec![4]);
    }
}
