//! `plt::` plotting module and PNG rendering.
//!
//! Plot calls record series into a shared [`Figure`]. After a cell finishes,
//! a figure with at least one axis is rendered to a PNG data URI and cleared.
//! The module is only registered once submitted code mentions `plt::`.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use rhai::{Array, INT, ImmutableString, Module};

use super::frame::{Frame, ScriptResult, script_error};
use crate::error::{Error, Result};
use crate::output::Theme;

/// Namespace prefix that triggers loading of the plotting module.
pub const PLOT_NAMESPACE: &str = "plt";

const WIDTH: u32 = 720;
const AXIS_HEIGHT: u32 = 360;
/// Subplots a single figure may render.
pub const MAX_AXES: usize = 16;
const MARGIN: i64 = 36;
const DEFAULT_BINS: usize = 10;

/// Kind of a plotted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    Bar,
    Line,
    Scatter,
}

/// One plotted series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub kind: SeriesKind,
    pub points: Vec<(f64, f64)>,
}

/// Series sharing one set of axes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Axis {
    pub series: Vec<Series>,
}

/// Shared figure state written by plot calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Figure {
    pub axes: Vec<Axis>,
}

pub type SharedFigure = Arc<Mutex<Figure>>;

impl Figure {
    pub fn has_axes(&self) -> bool {
        !self.axes.is_empty()
    }

    fn current_axis(&mut self) -> &mut Axis {
        if self.axes.is_empty() {
            self.axes.push(Axis::default());
        }
        let last = self.axes.len() - 1;
        &mut self.axes[last]
    }

    pub fn add(&mut self, kind: SeriesKind, points: Vec<(f64, f64)>) {
        self.current_axis().series.push(Series { kind, points });
    }

    pub fn subplot(&mut self) {
        self.axes.push(Axis::default());
    }
}

/// Colors for one theme.
struct Palette {
    axis: Rgba<u8>,
    accents: [Rgba<u8>; 3],
}

fn hex(rgb: u32) -> Rgba<u8> {
    Rgba([(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8, 255])
}

fn palette(theme: Theme) -> Palette {
    match theme {
        Theme::Dark => Palette {
            axis: hex(0x334155),
            accents: [hex(0x60a5fa), hex(0xf472b6), hex(0x34d399)],
        },
        Theme::Light => Palette {
            axis: hex(0xcbd5e1),
            accents: [hex(0x2563eb), hex(0xdb2777), hex(0x059669)],
        },
    }
}

fn points_from(frame: &Frame, x: &str, y: &str) -> ScriptResult<Vec<(f64, f64)>> {
    let xs = frame.column(x)?;
    let ys = frame.column(y)?;
    Ok(xs
        .iter()
        .zip(&ys)
        .enumerate()
        .filter_map(|(i, (xv, yv))| Some((xv.as_f64().unwrap_or(i as f64), yv.as_f64()?)))
        .collect())
}

fn histogram(values: &[f64], bins: usize) -> Vec<(f64, f64)> {
    let bins = bins.max(1);
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if !lo.is_finite() {
        return Vec::new();
    }
    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
    let mut counts = vec![0usize; bins];
    for v in values {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (lo + width * (i as f64 + 0.5), c as f64))
        .collect()
}

fn with_figure(figure: &SharedFigure, f: impl FnOnce(&mut Figure)) -> ScriptResult<()> {
    let mut guard = figure
        .lock()
        .map_err(|_| script_error("figure lock poisoned"))?;
    f(&mut guard);
    Ok(())
}

/// Build the `plt` module writing into `figure`.
pub fn module(figure: SharedFigure) -> Module {
    let mut module = Module::new();

    for (name, kind) in [
        ("bar", SeriesKind::Bar),
        ("line", SeriesKind::Line),
        ("scatter", SeriesKind::Scatter),
    ] {
        let fig = figure.clone();
        module.set_native_fn(
            name,
            move |df: &mut Frame, x: ImmutableString, y: ImmutableString| {
                let points = points_from(df, &x, &y)?;
                with_figure(&fig, |f| f.add(kind, points))
            },
        );
    }

    let fig = figure.clone();
    module.set_native_fn("line", move |values: Array| {
        let points = values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                let y = v.as_float().ok().or_else(|| v.as_int().ok().map(|i| i as f64))?;
                Some((i as f64, y))
            })
            .collect();
        with_figure(&fig, |f| f.add(SeriesKind::Line, points))
    });

    let fig = figure.clone();
    module.set_native_fn("hist", move |df: &mut Frame, col: ImmutableString| {
        let values: Vec<f64> = df.column(&col)?.iter().filter_map(|v| v.as_f64()).collect();
        with_figure(&fig, |f| f.add(SeriesKind::Bar, histogram(&values, DEFAULT_BINS)))
    });

    let fig = figure.clone();
    module.set_native_fn(
        "hist",
        move |df: &mut Frame, col: ImmutableString, bins: INT| {
            let values: Vec<f64> = df.column(&col)?.iter().filter_map(|v| v.as_f64()).collect();
            let bins = usize::try_from(bins).unwrap_or(1);
            with_figure(&fig, |f| f.add(SeriesKind::Bar, histogram(&values, bins)))
        },
    );

    let fig = figure.clone();
    module.set_native_fn("subplot", move || with_figure(&fig, Figure::subplot));

    let fig = figure;
    module.set_native_fn("clear", move || {
        with_figure(&fig, |f| *f = Figure::default())
    });

    module
}

/// Whether `code` references the plotting namespace.
pub fn mentions_plotting(code: &str) -> bool {
    code.contains(&format!("{}::", PLOT_NAMESPACE))
}

struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    fn put(&mut self, x: i64, y: i64, color: Rgba<u8>) {
        if x >= 0 && y >= 0 && (x as u32) < self.image.width() && (y as u32) < self.image.height() {
            self.image.put_pixel(x as u32, y as u32, color);
        }
    }

    fn line(&mut self, (x0, y0): (i64, i64), (x1, y1): (i64, i64), color: Rgba<u8>) {
        let (dx, dy) = ((x1 - x0).abs(), -(y1 - y0).abs());
        let (sx, sy) = (if x0 < x1 { 1 } else { -1 }, if y0 < y1 { 1 } else { -1 });
        let (mut x, mut y, mut err) = (x0, y0, dx + dy);
        loop {
            self.put(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn rect(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgba<u8>) {
        for x in x0.min(x1)..=x0.max(x1) {
            for y in y0.min(y1)..=y0.max(y1) {
                self.put(x, y, color);
            }
        }
    }
}

fn bounds(axis: &Axis) -> Option<(f64, f64, f64, f64)> {
    let mut points = axis.series.iter().flat_map(|s| s.points.iter());
    let first = points.next()?;
    let (mut x0, mut x1, mut y0, mut y1) = (first.0, first.0, first.1, first.1);
    for (x, y) in points {
        x0 = x0.min(*x);
        x1 = x1.max(*x);
        y0 = y0.min(*y);
        y1 = y1.max(*y);
    }
    // bars grow from zero
    if axis.series.iter().any(|s| s.kind == SeriesKind::Bar) {
        y0 = y0.min(0.0);
    }
    if x1 <= x0 {
        x0 -= 0.5;
        x1 += 0.5;
    }
    if y1 <= y0 {
        y1 = y0 + 1.0;
    }
    Some((x0, x1, y0, y1))
}

fn draw_axis(canvas: &mut Canvas, axis: &Axis, top: i64, palette: &Palette) {
    let left = MARGIN;
    let right = WIDTH as i64 - MARGIN / 2;
    let bottom = top + AXIS_HEIGHT as i64 - MARGIN;
    let plot_top = top + MARGIN / 2;

    // left and bottom spines only
    canvas.line((left, plot_top), (left, bottom), palette.axis);
    canvas.line((left, bottom), (right, bottom), palette.axis);

    let Some((x0, x1, y0, y1)) = bounds(axis) else {
        return;
    };
    let pad = 0.05 * (x1 - x0);
    let (x0, x1) = (x0 - pad, x1 + pad);
    let sx = |x: f64| left + 1 + ((x - x0) / (x1 - x0) * (right - left - 2) as f64) as i64;
    let sy = |y: f64| bottom - 1 - ((y - y0) / (y1 - y0) * (bottom - plot_top - 2) as f64) as i64;

    for (n, series) in axis.series.iter().enumerate() {
        let color = palette.accents[n % palette.accents.len()];
        match series.kind {
            SeriesKind::Bar => {
                let slots = series.points.len().max(1) as f64;
                let half = (((right - left) as f64 / slots) * 0.35).max(1.0) as i64;
                for &(x, y) in &series.points {
                    canvas.rect(sx(x) - half, sy(y0.max(0.0)), sx(x) + half, sy(y), color);
                }
            }
            SeriesKind::Line => {
                for pair in series.points.windows(2) {
                    canvas.line(
                        (sx(pair[0].0), sy(pair[0].1)),
                        (sx(pair[1].0), sy(pair[1].1)),
                        color,
                    );
                }
            }
            SeriesKind::Scatter => {
                for &(x, y) in &series.points {
                    canvas.rect(sx(x) - 2, sy(y) - 2, sx(x) + 2, sy(y) + 2, color);
                }
            }
        }
    }
}

/// Render `figure` to PNG bytes on a transparent background.
pub fn render_png(figure: &Figure, theme: Theme) -> Result<Vec<u8>> {
    let palette = palette(theme);
    let axes = figure.axes.len().max(1);
    if axes > MAX_AXES {
        return Err(Error::Render(format!(
            "figure has {} subplots; at most {} can be rendered",
            axes, MAX_AXES
        )));
    }
    let height = u32::try_from(axes)
        .ok()
        .and_then(|n| AXIS_HEIGHT.checked_mul(n))
        .ok_or_else(|| Error::Render("figure is too tall".to_string()))?;
    let mut canvas = Canvas {
        image: RgbaImage::from_pixel(WIDTH, height, Rgba([0, 0, 0, 0])),
    };
    for (i, axis) in figure.axes.iter().enumerate() {
        draw_axis(&mut canvas, axis, i as i64 * AXIS_HEIGHT as i64, &palette);
    }

    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(canvas.image)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| Error::Render(e.to_string()))?;
    Ok(buf)
}

/// Render `figure` as a `data:image/png;base64,...` URI.
pub fn render_data_uri(figure: &Figure, theme: Theme) -> Result<String> {
    let png = render_png(figure, theme)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bins() {
        let bins = histogram(&[1.0, 2.0, 2.0, 3.0, 10.0], 3);
        assert_eq!(bins.len(), 3);
        let total: f64 = bins.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 5.0);
        assert_eq!(bins[0].1, 4.0);
        assert!(histogram(&[], 4).is_empty());
    }

    #[test]
    fn test_render_png_signature() {
        let mut figure = Figure::default();
        figure.add(SeriesKind::Bar, vec![(0.0, 1.0), (1.0, 3.0)]);
        figure.subplot();
        figure.add(SeriesKind::Line, vec![(0.0, 1.0), (1.0, 0.5), (2.0, 2.0)]);
        let png = render_png(&figure, Theme::Light).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let uri = render_data_uri(&figure, Theme::Dark).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_single_point_does_not_divide_by_zero() {
        let mut figure = Figure::default();
        figure.add(SeriesKind::Scatter, vec![(5.0, 5.0)]);
        assert!(render_png(&figure, Theme::Dark).is_ok());
    }

    #[test]
    fn test_too_many_subplots_is_render_error() {
        let mut figure = Figure::default();
        for _ in 0..=MAX_AXES {
            figure.subplot();
        }
        let err = render_png(&figure, Theme::Dark).unwrap_err();
        assert!(matches!(err, Error::Render(_)));

        figure.axes.truncate(MAX_AXES);
        assert!(render_png(&figure, Theme::Dark).is_ok());
    }

    #[test]
    fn test_mentions_plotting() {
        assert!(mentions_plotting("plt::bar(df, \"a\", \"b\")"));
        assert!(!mentions_plotting("let plt = 1; plt + 1"));
    }
}
