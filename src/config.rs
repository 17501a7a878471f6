use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{DirTreeError, Result};

pub const MIN_DEPTH: usize = 30;
pub const MAX_DEPTH: usize = 60;

/// When the index-allocation blocks are also scanned flat, outside the
/// B-tree walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocScanMode {
    /// Only when the walk could not follow some subnode.
    #[default]
    Fallback,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_depth: usize,
    /// Cap on attribute fragments gathered through an attribute list.
    pub max_fragments: usize,
    pub alloc_scan: AllocScanMode,
    /// Leave out `$`-prefixed system files of the root directory.
    pub skip_metafiles: bool,
    /// Name given to the root instead of the $Volume label.
    pub volume_label: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: 48,
            max_fragments: 5,
            alloc_scan: AllocScanMode::default(),
            skip_metafiles: true,
            volume_label: None,
        }
    }
}

impl ScanConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: ScanConfig = serde_json::from_str(&text).map_err(|e| {
            DirTreeError::Decode(format!(
                "configuration {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(config.validated())
    }

    /// Bring out-of-range values back into range.
    pub fn validated(mut self) -> Self {
        let depth = self.max_depth.clamp(MIN_DEPTH, MAX_DEPTH);
        if depth != self.max_depth {
            warn!(
                "max_depth {} is outside {}..={}, using {}",
                self.max_depth, MIN_DEPTH, MAX_DEPTH, depth
            );
            self.max_depth = depth;
        }
        if self.max_fragments == 0 {
            warn!("max_fragments must be at least 1");
            self.max_fragments = 1;
        }
        self
    }
}
