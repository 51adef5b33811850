//! Build stamp record.
//!
//! A stamp is the identity record attached to a firmware build before it
//! is added to a repository: a fresh build uuid, the uuid of the target
//! repository, and a version number (explicit or auto-derived as one
//! greater than the highest version in the repository). It is created
//! once per build, consumed once by the repository's add operation, and
//! read on-device as the persisted current-version marker.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OtaError;
use crate::manifest::Manifest;

/// Well-known stamp file name.
pub const STAMP_FILE: &str = "stamp.json";

/// Build-time identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Fresh uuid identifying this build.
    pub uuid: String,
    /// Uuid of the repository the build targets.
    #[serde(rename = "repouuid")]
    pub repo_uuid: String,
    /// Monotonically-assigned version number.
    pub version: u32,
}

impl Stamp {
    /// Create a stamp with a freshly generated build uuid.
    pub fn new(repo_uuid: impl Into<String>, version: u32) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            repo_uuid: repo_uuid.into(),
            version,
        }
    }

    pub fn load(path: &Path) -> Result<Self, OtaError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), OtaError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}

/// One greater than the highest version in the catalog; 1 for an empty
/// repository.
pub fn next_version(manifest: &Manifest) -> u32 {
    manifest
        .images
        .iter()
        .map(|i| i.version + 1)
        .max()
        .unwrap_or(1)
}
