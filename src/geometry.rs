//! Geometry - viewport centering and model-answer rectangles
//!
//! Pure functions. Nothing here talks to the backend.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Regions at or above this share of the viewport height are never zoomed to.
pub const MAX_REGION_HEIGHT_RATIO: f64 = 0.65;
pub const MIN_REGION_ZOOM: f64 = 1.5;
pub const REGION_ZOOM_DIVISOR: f64 = 1.8;
pub const FALLBACK_ZOOM: f64 = 1.2;
pub const FALLBACK_PAN_RATIO: f64 = 0.06;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Rectangle in absolute canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            origin: Point { x, y },
            size: Size { width, height },
        }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.origin.x + self.size.width / 2.0,
            y: self.origin.y + self.size.height / 2.0,
        }
    }
}

/// Zoom and pan to apply to the canvas view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomPlacement {
    pub zoom: f64,
    pub pan: Point,
    /// False when the fixed reset was used instead of centering.
    pub centered: bool,
}

/// Fixed reset: zoom 1.2, pan 6% into the viewport on both axes.
pub fn fallback_placement(viewport: Size) -> ZoomPlacement {
    ZoomPlacement {
        zoom: FALLBACK_ZOOM,
        pan: Point {
            x: viewport.width * FALLBACK_PAN_RATIO,
            y: viewport.height * FALLBACK_PAN_RATIO,
        },
        centered: false,
    }
}

/// Center the viewport on `region`, or fall back to the fixed reset.
///
/// `viewport` is the run's configured canvas size, `canvas` the size the
/// backend reports. The pan is clamped so the view never leaves the canvas.
pub fn center_on_region(
    region: Option<&Rect>,
    viewport: Size,
    canvas: Size,
    current_zoom: f64,
) -> ZoomPlacement {
    let region = match region {
        Some(r) if r.size.height < viewport.height * MAX_REGION_HEIGHT_RATIO => r,
        _ => return fallback_placement(viewport),
    };

    let zoom = MIN_REGION_ZOOM.max(current_zoom / REGION_ZOOM_DIVISOR);
    let center = region.center();

    let desired_x = center.x - (viewport.width / 2.0) / zoom;
    let desired_y = center.y - (viewport.height / 2.0) / zoom;

    let max_x = (canvas.width - viewport.width / zoom).max(0.0);
    let max_y = (canvas.height - viewport.height / zoom).max(0.0);

    ZoomPlacement {
        zoom,
        pan: Point {
            x: desired_x.max(0.0).min(max_x),
            y: desired_y.max(0.0).min(max_y),
        },
        centered: true,
    }
}

/// Every numeric token in `answer`, in order. Surrounding prose and broken
/// JSON are ignored.
pub fn scan_numbers(answer: &str) -> Vec<f64> {
    NUMBER_RE
        .find_iter(answer)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

/// Turn a model answer holding normalized `(x_min, y_min, x_max, y_max)` into
/// an absolute rectangle. A fifth leading number is a confidence score and is
/// dropped. Fewer than four numbers yields `None`.
pub fn rect_from_answer(answer: &str, canvas: Size) -> Option<Rect> {
    let numbers = scan_numbers(answer);
    if numbers.len() < 4 {
        return None;
    }

    let start = if numbers.len() == 5 { 1 } else { 0 };
    let (x_min, y_min, x_max, y_max) = (
        numbers[start],
        numbers[start + 1],
        numbers[start + 2],
        numbers[start + 3],
    );

    Some(Rect::new(
        (x_min * canvas.width).floor(),
        (y_min * canvas.height).floor(),
        ((x_max - x_min) * canvas.width).floor(),
        ((y_max - y_min) * canvas.height).floor(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_centering_small_region() {
        let region = Rect::new(900.0, 700.0, 100.0, 100.0);
        let placement = center_on_region(
            Some(&region),
            Size::new(1000.0, 800.0),
            Size::new(2000.0, 1600.0),
            1.8,
        );

        assert!(placement.centered);
        assert!(approx(placement.zoom, 1.5));
        assert!(approx(placement.pan.x, 950.0 - 500.0 / 1.5));
        assert!(approx(placement.pan.y, 750.0 - 400.0 / 1.5));
    }

    #[test]
    fn test_zoom_follows_current_zoom_when_large() {
        let region = Rect::new(100.0, 100.0, 50.0, 50.0);
        let placement = center_on_region(
            Some(&region),
            Size::new(1000.0, 1000.0),
            Size::new(1000.0, 1000.0),
            4.5,
        );
        assert!(approx(placement.zoom, 2.5));
    }

    #[test]
    fn test_pan_clamped_to_canvas() {
        let near_origin = Rect::new(0.0, 0.0, 100.0, 100.0);
        let placement = center_on_region(
            Some(&near_origin),
            Size::new(1000.0, 800.0),
            Size::new(1000.0, 800.0),
            1.0,
        );
        assert_eq!(placement.pan, Point { x: 0.0, y: 0.0 });

        let far_corner = Rect::new(950.0, 750.0, 50.0, 50.0);
        let placement = center_on_region(
            Some(&far_corner),
            Size::new(1000.0, 800.0),
            Size::new(1000.0, 800.0),
            1.0,
        );
        assert!(approx(placement.pan.x, 1000.0 - 1000.0 / 1.5));
        assert!(approx(placement.pan.y, 800.0 - 800.0 / 1.5));
    }

    #[test]
    fn test_tall_region_falls_back() {
        let viewport = Size::new(1000.0, 800.0);
        let tall = Rect::new(10.0, 10.0, 100.0, 800.0 * 0.65);
        let placement = center_on_region(Some(&tall), viewport, viewport, 1.0);

        assert!(!placement.centered);
        assert!(approx(placement.zoom, 1.2));
        assert!(approx(placement.pan.x, 60.0));
        assert!(approx(placement.pan.y, 48.0));
    }

    #[test]
    fn test_missing_region_falls_back() {
        let viewport = Size::new(512.0, 512.0);
        assert_eq!(
            center_on_region(None, viewport, viewport, 3.0),
            fallback_placement(viewport)
        );
    }

    #[test]
    fn test_scan_numbers_tolerates_prose() {
        let numbers = scan_numbers("Sure! The hat is at [0.25, 0.1, 0.75,0.5 ] (approx)");
        assert_eq!(numbers, vec![0.25, 0.1, 0.75, 0.5]);
    }

    #[test]
    fn test_rect_from_answer() {
        let rect = rect_from_answer("{\"box\": [0.25, 0.125, 0.75, 0.625}", Size::new(1000.0, 800.0)).unwrap();
        assert_eq!(rect, Rect::new(250.0, 100.0, 500.0, 400.0));
    }

    #[test]
    fn test_rect_from_answer_drops_confidence() {
        let rect = rect_from_answer("0.93 0 0 0.5 0.5", Size::new(200.0, 100.0)).unwrap();
        assert_eq!(rect, Rect::new(0.0, 0.0, 100.0, 50.0));
    }

    #[test]
    fn test_rect_from_answer_needs_four_numbers() {
        assert!(rect_from_answer("no idea, maybe 0.5 0.5 0.2", Size::new(100.0, 100.0)).is_none());
        assert!(rect_from_answer("", Size::new(100.0, 100.0)).is_none());
    }
}
