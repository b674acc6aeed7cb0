/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Debounced viewport tracking with generation numbers.

use std::time::Duration;

use euclid::default::{Box2D, Point2D};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::camera::Camera;

/// World-space rectangle visible in the viewport, plus the zoom ratio that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub ratio: f64,
}

impl ViewportBounds {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64, ratio: f64) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
            ratio,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Point2D<f64> {
        Point2D::new(
            (self.min_x + self.max_x) * 0.5,
            (self.min_y + self.max_y) * 0.5,
        )
    }

    /// Inclusive containment test.
    pub fn contains(&self, point: Point2D<f64>) -> bool {
        point.x >= self.min_x &&
            point.x <= self.max_x &&
            point.y >= self.min_y &&
            point.y <= self.max_y
    }

    /// Whether `other` lies entirely inside these bounds.
    pub fn covers(&self, other: &ViewportBounds) -> bool {
        other.min_x >= self.min_x &&
            other.max_x <= self.max_x &&
            other.min_y >= self.min_y &&
            other.max_y <= self.max_y
    }

    /// Finite coordinates with min <= max on both axes.
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.max_x, self.min_y, self.max_y]
            .iter()
            .all(|v| v.is_finite()) &&
            self.min_x <= self.max_x &&
            self.min_y <= self.max_y
    }

    pub fn to_box(&self) -> Box2D<f64> {
        Box2D::new(
            Point2D::new(self.min_x, self.min_y),
            Point2D::new(self.max_x, self.max_y),
        )
    }
}

/// A debounced viewport change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportUpdate {
    /// Strictly increasing per tracker; newer generations supersede older ones
    pub generation: u64,

    /// Visible world bounds
    pub bounds: ViewportBounds,

    /// Camera that produced the bounds
    pub camera: Camera,
}

/// Converts raw camera samples into debounced `ViewportUpdate`s.
///
/// Emission is trailing: an update goes out once the camera has been quiet for
/// the debounce window, and two emissions are never closer together than the
/// window.
#[derive(Debug)]
pub struct ViewportTracker {
    debounce: Duration,
    world_units_per_pixel: f64,
    pending: Option<(Camera, Instant)>,
    last_emitted: Option<Camera>,
    last_emit_at: Option<Instant>,
    generation: u64,
}

impl ViewportTracker {
    pub fn new(debounce: Duration, world_units_per_pixel: f64) -> Self {
        Self {
            debounce,
            world_units_per_pixel,
            pending: None,
            last_emitted: None,
            last_emit_at: None,
            generation: 0,
        }
    }

    /// Generation of the most recent emission (0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a camera sample.
    pub fn observe(&mut self, camera: Camera, now: Instant) {
        match self.pending {
            Some((pending, _)) if pending == camera => {},
            _ => self.pending = Some((camera, now)),
        }
    }

    /// Emit an update if the debounce window allows it.
    pub fn poll(&mut self, now: Instant) -> Option<ViewportUpdate> {
        let (camera, changed_at) = self.pending?;

        if self.last_emitted == Some(camera) {
            self.pending = None;
            return None;
        }

        let quiet = now.saturating_duration_since(changed_at) >= self.debounce;
        let spaced = self
            .last_emit_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.debounce);
        if !(quiet && spaced) {
            return None;
        }

        Some(self.emit(camera, now))
    }

    /// Emit immediately, bypassing the debounce window.
    ///
    /// Used for the initial load and when the caller changes a filter that
    /// invalidates the current view.
    pub fn force_emit(&mut self, camera: Camera, now: Instant) -> ViewportUpdate {
        self.emit(camera, now)
    }

    /// Earliest instant at which `poll` could emit, if anything is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let (camera, changed_at) = self.pending?;
        if self.last_emitted == Some(camera) {
            return None;
        }
        let quiet_at = changed_at + self.debounce;
        Some(match self.last_emit_at {
            Some(at) => quiet_at.max(at + self.debounce),
            None => quiet_at,
        })
    }

    fn emit(&mut self, camera: Camera, now: Instant) -> ViewportUpdate {
        self.generation += 1;
        self.pending = None;
        self.last_emitted = Some(camera);
        self.last_emit_at = Some(now);

        let bounds = camera.bounds(self.world_units_per_pixel);
        debug!(
            "Viewport generation {} bounds=({:.1},{:.1},{:.1},{:.1}) ratio={:.3}",
            self.generation, bounds.min_x, bounds.max_x, bounds.min_y, bounds.max_y, bounds.ratio
        );

        ViewportUpdate {
            generation: self.generation,
            bounds,
            camera,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    fn tracker() -> ViewportTracker {
        ViewportTracker::new(WINDOW, 1.0)
    }

    fn camera_at(x: f64) -> Camera {
        let mut camera = Camera::default();
        camera.center = Point2D::new(x, 0.0);
        camera
    }

    #[test]
    fn test_bounds_geometry() {
        let bounds = ViewportBounds::new(-10.0, 30.0, 0.0, 20.0, 1.0);
        assert_eq!(bounds.width(), 40.0);
        assert_eq!(bounds.height(), 20.0);
        assert_eq!(bounds.center(), Point2D::new(10.0, 10.0));
        assert!(bounds.contains(Point2D::new(30.0, 20.0)));
        assert!(!bounds.contains(Point2D::new(30.1, 20.0)));
        assert!(bounds.covers(&ViewportBounds::new(0.0, 10.0, 5.0, 6.0, 1.0)));
        assert!(bounds.is_valid());
        assert!(!ViewportBounds::new(1.0, 0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!ViewportBounds::new(f64::NAN, 0.0, 0.0, 1.0, 1.0).is_valid());
    }

    #[test]
    fn test_no_emit_before_quiet_window() {
        let mut tracker = tracker();
        let t0 = Instant::now();
        tracker.observe(camera_at(1.0), t0);

        assert!(tracker.poll(t0 + Duration::from_millis(100)).is_none());
        let update = tracker.poll(t0 + WINDOW).unwrap();
        assert_eq!(update.generation, 1);
        assert_eq!(update.camera, camera_at(1.0));
    }

    #[test]
    fn test_rapid_changes_emit_latest_once() {
        let mut tracker = tracker();
        let t0 = Instant::now();
        for step in 0..5 {
            tracker.observe(camera_at(step as f64), t0 + Duration::from_millis(step * 50));
        }

        let last_change = t0 + Duration::from_millis(200);
        assert!(tracker.poll(last_change + Duration::from_millis(299)).is_none());
        let update = tracker.poll(last_change + WINDOW).unwrap();
        assert_eq!(update.camera, camera_at(4.0));
        assert!(tracker.poll(last_change + WINDOW * 3).is_none());
    }

    #[test]
    fn test_emissions_are_spaced_by_window() {
        let mut tracker = tracker();
        let t0 = Instant::now();
        let first = tracker.force_emit(camera_at(0.0), t0);
        assert_eq!(first.generation, 1);

        // Quiet long enough relative to the change, but too close to the last emission.
        tracker.observe(camera_at(5.0), t0 - WINDOW);
        assert!(tracker.poll(t0 + Duration::from_millis(10)).is_none());
        assert_eq!(tracker.next_deadline(), Some(t0 + WINDOW));
        let second = tracker.poll(t0 + WINDOW).unwrap();
        assert_eq!(second.generation, 2);
    }

    #[test]
    fn test_unchanged_camera_does_not_reemit() {
        let mut tracker = tracker();
        let t0 = Instant::now();
        tracker.force_emit(camera_at(0.0), t0);
        tracker.observe(camera_at(0.0), t0 + WINDOW);

        assert!(tracker.poll(t0 + WINDOW * 4).is_none());
        assert!(tracker.next_deadline().is_none());
        assert_eq!(tracker.generation(), 1);
    }

    #[test]
    fn test_generation_is_monotonic() {
        let mut tracker = tracker();
        let mut now = Instant::now();
        let mut last = 0;
        for step in 0..10 {
            tracker.observe(camera_at(step as f64), now);
            now += WINDOW;
            let update = tracker.poll(now).unwrap();
            assert!(update.generation > last);
            last = update.generation;
        }
    }
}
