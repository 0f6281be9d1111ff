/*
 * Copyright (C) 2026 Tether contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Working directory the server resolves relative paths against.
    /// Defaults to the process working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Where the default libraries live (default: "bundled:///libs")
    #[serde(default = "default_library_path")]
    pub default_library_path: String,

    /// On-disk directory that backs `bundled://` paths. When unset,
    /// bundled paths do not resolve.
    #[serde(default)]
    pub bundled_root: Option<PathBuf>,

    /// Log file path; logging goes to stderr when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_library_path() -> String {
    "bundled:///libs".to_string()
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder.set_default("default_library_path", default_library_path())?;

        // 2. Load from user config directory (~/.config/tether/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("tether").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Load from environment variables (TETHER_DEFAULT_LIBRARY_PATH, etc.)
        builder = builder.add_source(config::Environment::with_prefix("TETHER"));

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
