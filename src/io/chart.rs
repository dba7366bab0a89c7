//! Session chart rendering
//!
//! One horizontal bar per patron across the session's time span, coloured by
//! manufacturer, with a faint vertical rule on every hour boundary.
//!
//! The canvas never grows past `MAX_HEIGHT`. Past that many rows the row pitch
//! shrinks and neighbouring patrons share pixel rows.

use crate::domain::types::{SessionDuration, SessionId};
use chrono::NaiveDate;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use thiserror::Error;

const WIDTH: u32 = 1200;
const MARGIN: u32 = 20;
const ROW_HEIGHT: u32 = 10;
const ROW_GAP: u32 = 2;
const MIN_HEIGHT: u32 = 120;
const MAX_HEIGHT: u32 = 4096;
const MIN_BAR_WIDTH: u32 = 2;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const HOUR_RULE: Rgb<u8> = Rgb([220, 220, 220]);
const PALETTE: [Rgb<u8>; 8] = [
    Rgb([31, 119, 180]),
    Rgb([255, 127, 14]),
    Rgb([44, 160, 44]),
    Rgb([214, 39, 40]),
    Rgb([148, 103, 189]),
    Rgb([140, 86, 75]),
    Rgb([227, 119, 194]),
    Rgb([127, 127, 127]),
];

#[derive(Error, Debug)]
pub enum ChartError {
    #[error("failed to encode chart {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to move chart into place at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// `YYYYMMDD-<session>-<sequence>_<tag>.png`
///
/// Path separators in the labels are replaced so the name stays a single
/// path component.
pub fn image_filename(date: NaiveDate, session: SessionId, seq_id: &str, device_tag: &str) -> String {
    format!(
        "{}-{}-{}_{}.png",
        date.format("%Y%m%d"),
        session,
        path_safe(seq_id),
        path_safe(device_tag)
    )
}

fn path_safe(label: &str) -> String {
    label.chars().map(|c| if c == '/' || c == '\\' { '_' } else { c }).collect()
}

fn colour_for(manufacturer: &str) -> Rgb<u8> {
    let mut hasher = FxHasher::default();
    manufacturer.hash(&mut hasher);
    PALETTE[(hasher.finish() % PALETTE.len() as u64) as usize]
}

/// Vertical placement of the patron rows
#[derive(Debug, Clone, Copy, PartialEq)]
struct Rows {
    height: u32,
    pitch: f64,
    bar_height: u32,
}

impl Rows {
    fn for_count(count: usize) -> Self {
        let full_pitch = ROW_HEIGHT + ROW_GAP;
        let natural = u64::from(MARGIN * 2) + count as u64 * u64::from(full_pitch);
        if natural <= u64::from(MAX_HEIGHT) {
            return Self {
                height: (natural as u32).max(MIN_HEIGHT),
                pitch: f64::from(full_pitch),
                bar_height: ROW_HEIGHT,
            };
        }

        let pitch = f64::from(MAX_HEIGHT - MARGIN * 2) / count as f64;
        let bar_height = ((pitch * f64::from(ROW_HEIGHT) / f64::from(full_pitch)) as u32).max(1);
        Self { height: MAX_HEIGHT, pitch, bar_height }
    }

    fn y_of(&self, row: usize) -> u32 {
        MARGIN + (row as f64 * self.pitch) as u32
    }
}

/// Draw the session; an empty session yields a blank canvas
pub fn render(durations: &[SessionDuration]) -> RgbImage {
    let rows = Rows::for_count(durations.len());
    let height = rows.height;
    let mut canvas = RgbImage::from_pixel(WIDTH, height, BACKGROUND);

    let (Some(t0), Some(t1)) = (
        durations.iter().map(|d| d.start).min(),
        durations.iter().map(|d| d.end).max(),
    ) else {
        return canvas;
    };

    let plot_width = (WIDTH - MARGIN * 2) as f64;
    let span = (t1 - t0).max(1) as f64;
    let x_of = |ts: i64| MARGIN as f64 + (ts - t0) as f64 * plot_width / span;

    let first_hour = (t0 + 3599).div_euclid(3600) * 3600;
    for hour in (first_hour..=t1).step_by(3600) {
        let x = x_of(hour) as f32;
        draw_line_segment_mut(
            &mut canvas,
            (x, MARGIN as f32 / 2.0),
            (x, (height - MARGIN / 2) as f32),
            HOUR_RULE,
        );
    }

    for (row, duration) in durations.iter().enumerate() {
        let x0 = x_of(duration.start);
        let width = ((x_of(duration.end) - x0).round() as u32).max(MIN_BAR_WIDTH);
        draw_filled_rect_mut(
            &mut canvas,
            Rect::at(x0.round() as i32, rows.y_of(row) as i32).of_size(width, rows.bar_height),
            colour_for(&duration.manufacturer),
        );
    }

    canvas
}

/// Render and write a PNG to `path`
///
/// The file is written next to its destination and renamed, so a reader
/// never sees a half-written chart and a re-run simply replaces it.
pub fn write_chart(path: &Path, durations: &[SessionDuration]) -> Result<(), ChartError> {
    let canvas = render(durations);
    let staging = path.with_extension("png.partial");

    canvas.save_with_format(&staging, ImageFormat::Png).map_err(|source| ChartError::Encode {
        path: staging.display().to_string(),
        source,
    })?;
    std::fs::rename(&staging, path)
        .map_err(|source| ChartError::Io { path: path.display().to_string(), source })
}
