/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Camera input and viewport tracking.
//!
//! Interaction events (drag, wheel, touch) are turned into `Camera` updates by
//! the embedder. The tracker debounces them into `ViewportUpdate`s, each with
//! a new generation number that the loader uses for cancellation.

pub mod camera;
pub mod viewport;

pub use camera::Camera;
pub use viewport::{ViewportBounds, ViewportTracker, ViewportUpdate};
