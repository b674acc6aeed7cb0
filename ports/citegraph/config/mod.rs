/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Configuration for the loader engine.

pub mod engine;

use std::path::PathBuf;

pub use engine::{
    BackendConfig, CacheConfig, EngineConfig, FetchConfig, LoaderStrategy, MemoryConfig,
    ViewportConfig,
};

/// Get the config directory for citegraph
pub fn config_dir() -> PathBuf {
    if let Some(config_home) = dirs::config_dir() {
        config_home.join("citegraph")
    } else {
        PathBuf::from(".citegraph")
    }
}

/// Ensure the config directory exists
pub fn ensure_config_dir() -> std::io::Result<PathBuf> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
