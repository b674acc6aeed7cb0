/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Camera state for the graph viewport.

use euclid::default::{Point2D, Size2D};

use super::viewport::ViewportBounds;

/// Smallest zoom ratio the camera accepts (most zoomed in).
pub const MIN_RATIO: f64 = 0.01;

/// Largest zoom ratio the camera accepts (most zoomed out).
pub const MAX_RATIO: f64 = 64.0;

/// Camera state sampled on every interaction event.
///
/// `ratio` follows the usual graph-canvas convention: 1.0 is the default
/// scale, larger values are zoomed out and show more of the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Center of the view in world space
    pub center: Point2D<f64>,

    /// Zoom ratio (world units per screen pixel, relative to the base scale)
    pub ratio: f64,

    /// Canvas size in screen pixels
    pub canvas: Size2D<f64>,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            center: Point2D::new(0.0, 0.0),
            ratio: 1.0,
            canvas: Size2D::new(1280.0, 800.0),
        }
    }
}

impl Camera {
    /// Create a camera looking at `center`
    pub fn new(center: Point2D<f64>, ratio: f64, canvas: Size2D<f64>) -> Self {
        Self {
            center,
            ratio: ratio.clamp(MIN_RATIO, MAX_RATIO),
            canvas,
        }
    }

    /// Pan by a delta given in screen pixels
    pub fn pan(&mut self, delta_x: f64, delta_y: f64) {
        self.center.x += delta_x * self.ratio;
        self.center.y += delta_y * self.ratio;
    }

    /// Multiply the zoom ratio by `factor` (>1.0 zooms out)
    pub fn zoom_by(&mut self, factor: f64) {
        if factor.is_finite() && factor > 0.0 {
            self.ratio = (self.ratio * factor).clamp(MIN_RATIO, MAX_RATIO);
        }
    }

    /// Move the camera so `point` is centered
    pub fn center_on(&mut self, point: Point2D<f64>) {
        self.center = point;
    }

    /// Resize the canvas (window resize)
    pub fn resize(&mut self, canvas: Size2D<f64>) {
        self.canvas = canvas;
    }

    /// World-space bounds visible through this camera.
    pub fn bounds(&self, world_units_per_pixel: f64) -> ViewportBounds {
        let half_w = self.canvas.width * 0.5 * self.ratio * world_units_per_pixel;
        let half_h = self.canvas.height * 0.5 * self.ratio * world_units_per_pixel;
        ViewportBounds {
            min_x: self.center.x - half_w,
            max_x: self.center.x + half_w,
            min_y: self.center.y - half_h,
            max_y: self.center.y + half_h,
            ratio: self.ratio,
        }
    }

    /// Camera whose view fits `bounds` inside `canvas`.
    pub fn fit(bounds: &ViewportBounds, canvas: Size2D<f64>, world_units_per_pixel: f64) -> Self {
        let scale = world_units_per_pixel.max(f64::EPSILON);
        let ratio_x = bounds.width() / (canvas.width.max(1.0) * scale);
        let ratio_y = bounds.height() / (canvas.height.max(1.0) * scale);
        Self::new(bounds.center(), ratio_x.max(ratio_y), canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_default() {
        let camera = Camera::default();
        assert_eq!(camera.center.x, 0.0);
        assert_eq!(camera.center.y, 0.0);
        assert_eq!(camera.ratio, 1.0);
    }

    #[test]
    fn test_camera_pan_scales_with_ratio() {
        let mut camera = Camera::default();
        camera.ratio = 2.0;
        camera.pan(100.0, 50.0);

        assert_eq!(camera.center.x, 200.0);
        assert_eq!(camera.center.y, 100.0);
    }

    #[test]
    fn test_camera_zoom_clamp_min() {
        let mut camera = Camera::default();
        camera.zoom_by(1e-6);
        assert_eq!(camera.ratio, MIN_RATIO);
    }

    #[test]
    fn test_camera_zoom_clamp_max() {
        let mut camera = Camera::default();
        camera.zoom_by(1e6);
        assert_eq!(camera.ratio, MAX_RATIO);
    }

    #[test]
    fn test_camera_zoom_ignores_invalid_factor() {
        let mut camera = Camera::default();
        camera.zoom_by(f64::NAN);
        camera.zoom_by(-2.0);
        assert_eq!(camera.ratio, 1.0);
    }

    #[test]
    fn test_camera_bounds() {
        let camera = Camera::new(Point2D::new(10.0, 20.0), 2.0, Size2D::new(100.0, 50.0));
        let bounds = camera.bounds(1.0);

        assert_eq!(bounds.min_x, -90.0);
        assert_eq!(bounds.max_x, 110.0);
        assert_eq!(bounds.min_y, -30.0);
        assert_eq!(bounds.max_y, 70.0);
        assert_eq!(bounds.ratio, 2.0);
    }

    #[test]
    fn test_camera_fit_contains_bounds() {
        let target = ViewportBounds::new(-500.0, 500.0, -100.0, 100.0, 1.0);
        let camera = Camera::fit(&target, Size2D::new(1000.0, 1000.0), 1.0);
        let visible = camera.bounds(1.0);

        assert!(visible.min_x <= target.min_x && visible.max_x >= target.max_x);
        assert!(visible.min_y <= target.min_y && visible.max_y >= target.max_y);
        assert_eq!(camera.center, target.center());
    }
}
