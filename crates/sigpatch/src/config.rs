//! Engine configuration.
//!
//! Tunables shared by the scanner, the cursor chain and the assembler. Values
//! can be built in code through [`EngineConfig::builder`] or loaded from a JSON
//! file; missing fields fall back to the defaults below.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Bytes read per chunk while scanning module sections (1MB)
pub const DEFAULT_SCAN_CHUNK_SIZE: usize = 1024 * 1024;
/// Default signed window for anchored scans
pub const DEFAULT_RELATIVE_SCAN_RANGE: i64 = 512;
/// How far back prologue alignment may walk
pub const DEFAULT_PROLOGUE_SEARCH_WINDOW: usize = 2048;
/// Reach of a rel32 displacement
pub const DEFAULT_MAX_RELATIVE_DISTANCE: u64 = i32::MAX as u64;
/// `nop`
pub const DEFAULT_PAD_BYTE: u8 = 0x90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scan_chunk_size: usize,
    pub relative_scan_range: i64,
    pub prologue_search_window: usize,
    pub max_relative_distance: u64,
    pub pad_byte: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_chunk_size: DEFAULT_SCAN_CHUNK_SIZE,
            relative_scan_range: DEFAULT_RELATIVE_SCAN_RANGE,
            prologue_search_window: DEFAULT_PROLOGUE_SEARCH_WINDOW,
            max_relative_distance: DEFAULT_MAX_RELATIVE_DISTANCE,
            pad_byte: DEFAULT_PAD_BYTE,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration builder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!("Saved engine config to {}", path.as_ref().display());
        Ok(())
    }
}

/// Builder for EngineConfig
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    scan_chunk_size: Option<usize>,
    relative_scan_range: Option<i64>,
    prologue_search_window: Option<usize>,
    max_relative_distance: Option<u64>,
    pad_byte: Option<u8>,
}

impl EngineConfigBuilder {
    /// Set the scan chunk size (clamped to at least one byte)
    pub fn scan_chunk_size(mut self, size: usize) -> Self {
        self.scan_chunk_size = Some(size.max(1));
        self
    }

    pub fn relative_scan_range(mut self, range: i64) -> Self {
        self.relative_scan_range = Some(range);
        self
    }

    pub fn prologue_search_window(mut self, window: usize) -> Self {
        self.prologue_search_window = Some(window);
        self
    }

    pub fn max_relative_distance(mut self, distance: u64) -> Self {
        self.max_relative_distance = Some(distance);
        self
    }

    pub fn pad_byte(mut self, byte: u8) -> Self {
        self.pad_byte = Some(byte);
        self
    }

    /// Build the configuration
    pub fn build(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            scan_chunk_size: self.scan_chunk_size.unwrap_or(defaults.scan_chunk_size),
            relative_scan_range: self
                .relative_scan_range
                .unwrap_or(defaults.relative_scan_range),
            prologue_search_window: self
                .prologue_search_window
                .unwrap_or(defaults.prologue_search_window),
            max_relative_distance: self
                .max_relative_distance
                .unwrap_or(defaults.max_relative_distance),
            pad_byte: self.pad_byte.unwrap_or(defaults.pad_byte),
        }
    }
}
