//! `layout.json`: the on-disk format version of a store root.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::storage::atomic::{atomic_read_json, atomic_write_json};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub version: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            version: StoreConfig::LAYOUT_VERSION.to_string(),
        }
    }
}

impl Layout {
    /// Load the layout under `root`, creating it if absent.
    ///
    /// A layout written by a newer major version is refused.
    pub fn ensure(root: &Path) -> Result<Self> {
        let path = root.join(StoreConfig::LAYOUT_FILENAME);

        let layout = match atomic_read_json::<Layout>(&path)? {
            Some(layout) => layout,
            None => {
                let layout = Layout::default();
                atomic_write_json(&path, &layout, false)?;
                info!("Initialized store layout {} at {}", layout.version, root.display());
                return Ok(layout);
            }
        };

        layout.check_compatible()?;
        Ok(layout)
    }

    fn check_compatible(&self) -> Result<()> {
        let incompatible = || StoreError::IncompatibleLayout {
            found: self.version.clone(),
            expected: StoreConfig::LAYOUT_VERSION.to_string(),
        };

        let found = Version::parse(&self.version).map_err(|_| incompatible())?;
        let supported = Version::parse(StoreConfig::LAYOUT_VERSION).map_err(|_| incompatible())?;
        if found.major > supported.major {
            return Err(incompatible());
        }
        Ok(())
    }
}
