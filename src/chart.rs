#![cfg(not(tarpaulin_include))]
#![cfg(feature = "web")]
use chrono::{DateTime, Duration, NaiveDate, Utc};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use plotters::prelude::*;
use serde::Deserialize;
use std::error::Error;
use std::io::Cursor;

use crate::reading::{GlucoseUnit, Reading};
use crate::stats::Thresholds;

/// Available chart types
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    /// Every reading, connected in time order
    #[default]
    Line,

    /// One bar per day holding that day's mean
    DailyAverage,
}

/// Configuration options for chart generation
#[derive(Clone, Debug)]
pub struct ChartOptions {
    /// Title displayed at the top of the chart
    pub title: String,

    /// Width of the chart in pixels
    pub width: u32,

    /// Height of the chart in pixels
    pub height: u32,

    pub kind: ChartKind,

    /// Unit used for the Y axis
    pub unit: GlucoseUnit,

    /// Target range drawn as a shaded band, in mg/dL
    pub thresholds: Thresholds,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            title: "Blood glucose".to_string(),
            width: 800,
            height: 600,
            kind: ChartKind::Line,
            unit: GlucoseUnit::MgDl,
            thresholds: Thresholds::default(),
        }
    }
}

/// Readings as (time, value) pairs in `unit`, oldest first
pub fn chart_points(readings: &[Reading], unit: GlucoseUnit) -> Vec<(DateTime<Utc>, f64)> {
    let mut points: Vec<(DateTime<Utc>, f64)> = readings
        .iter()
        .map(|r| (r.taken_at, r.value_in(unit)))
        .collect();
    points.sort_by_key(|(t, _)| *t);
    points
}

/// Mean value per calendar day (UTC) in `unit`, oldest first
pub fn daily_averages(readings: &[Reading], unit: GlucoseUnit) -> Vec<(NaiveDate, f64)> {
    let mut days: std::collections::BTreeMap<NaiveDate, (f64, usize)> = Default::default();
    for reading in readings {
        let entry = days.entry(reading.taken_at.date_naive()).or_default();
        entry.0 += reading.value;
        entry.1 += 1;
    }

    days.into_iter()
        .map(|(day, (sum, count))| (day, unit.from_mg_dl(sum / count as f64)))
        .collect()
}

fn y_range(values: impl Iterator<Item = f64>, options: &ChartOptions) -> std::ops::Range<f64> {
    let low = options.unit.from_mg_dl(options.thresholds.low);
    let high = options.unit.from_mg_dl(options.thresholds.high);
    let (min, max) = values.fold((low, high), |(min, max), v| (min.min(v), max.max(v)));
    let pad = (max - min) * 0.1;
    (min - pad).max(0.0)..max + pad
}

/// Renders readings as a PNG
///
/// The chart is drawn into an in-memory RGB buffer which is then encoded,
/// so nothing touches the filesystem.
pub fn render_chart(
    readings: &[Reading],
    options: &ChartOptions,
) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let image = render_image(readings, options)?;
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;
    Ok(png)
}

/// Draws the chart into raw RGB pixels
pub fn render_image(
    readings: &[Reading],
    options: &ChartOptions,
) -> Result<RgbImage, Box<dyn Error + Send + Sync>> {
    if readings.is_empty() {
        return Err("No readings to chart".into());
    }

    let (width, height) = (options.width, options.height);
    let mut pixels = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut pixels, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| e.to_string())?;

        // x is fractional days since the first plotted day
        let (points, origin): (Vec<(f64, f64)>, NaiveDate) = match options.kind {
            ChartKind::Line => {
                let raw = chart_points(readings, options.unit);
                let origin = raw[0].0.date_naive();
                let start = crate::stats::day_start(origin);
                let points = raw
                    .into_iter()
                    .map(|(t, v)| ((t - start).num_minutes() as f64 / (24.0 * 60.0), v))
                    .collect();
                (points, origin)
            }
            ChartKind::DailyAverage => {
                let raw = daily_averages(readings, options.unit);
                let origin = raw[0].0;
                let points = raw
                    .into_iter()
                    .map(|(d, v)| ((d - origin).num_days() as f64, v))
                    .collect();
                (points, origin)
            }
        };

        let max_x = points.iter().map(|(x, _)| *x).fold(0.0, f64::max);
        let x_range = -0.5..max_x + 0.5;
        let y_range = y_range(points.iter().map(|(_, y)| *y), options);

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 30).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(x_range, y_range)
            .map_err(|e| e.to_string())?;

        let day_label = |x: &f64| {
            let day = origin + Duration::days(x.round() as i64);
            day.format("%b %d").to_string()
        };
        chart
            .configure_mesh()
            .x_desc("Date")
            .y_desc(options.unit.label())
            .x_label_formatter(&day_label)
            .draw()
            .map_err(|e| e.to_string())?;

        // target range band
        let low = options.unit.from_mg_dl(options.thresholds.low);
        let high = options.unit.from_mg_dl(options.thresholds.high);
        chart
            .draw_series(std::iter::once(Rectangle::new(
                [(-0.5, low), (max_x + 0.5, high)],
                GREEN.mix(0.15).filled(),
            )))
            .map_err(|e| e.to_string())?;

        match options.kind {
            ChartKind::Line => {
                chart
                    .draw_series(LineSeries::new(points.iter().copied(), &BLUE))
                    .map_err(|e| e.to_string())?;
                chart
                    .draw_series(points.iter().map(|&(x, y)| Circle::new((x, y), 3, BLUE.filled())))
                    .map_err(|e| e.to_string())?;
            }
            ChartKind::DailyAverage => {
                chart
                    .draw_series(points.iter().map(|&(x, y)| {
                        Rectangle::new([(x - 0.35, 0.0), (x + 0.35, y)], BLUE.mix(0.6).filled())
                    }))
                    .map_err(|e| e.to_string())?;
            }
        }

        root.present().map_err(|e| e.to_string())?;
    }

    let image = RgbImage::from_raw(width, height, pixels).ok_or("Chart buffer has the wrong size")?;
    Ok(image)
}
