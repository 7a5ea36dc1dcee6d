// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Volatilization
//!
//! Replaces finished intermediate artifacts with small placeholder files
//! carrying the original size and hash, so state computation can tell
//! "legitimately absent" apart from "missing or corrupted". Only outputs
//! of steps marked `_volatile` are candidates, and only once every
//! downstream consumer is done with them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::errors::{StepflowError, StepflowResult};

/// Suffix of placeholder files, appended to the artifact file name.
pub const PLACEHOLDER_SUFFIX: &str = ".volatile.placeholder.yaml";

/// Placeholder left behind for a volatilized artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placeholder {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub volatilized_at: DateTime<Utc>,
}

/// Path of the placeholder belonging to an artifact.
pub fn placeholder_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(PLACEHOLDER_SUFFIX);
    artifact.with_file_name(name)
}

impl Placeholder {
    /// Load the placeholder of an artifact, if one exists.
    pub fn load(artifact: &Path) -> StepflowResult<Option<Self>> {
        let path = placeholder_path(artifact);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StepflowError::read_error(&path, e)),
        };
        Ok(Some(serde_yaml::from_str(&content)?))
    }
}

/// Replace an artifact with its placeholder. Returns the bytes reclaimed.
pub fn volatilize_file(artifact: &Path) -> StepflowResult<u64> {
    let meta =
        std::fs::metadata(artifact).map_err(|e| StepflowError::read_error(artifact, e))?;
    let size = meta.len();

    let mut hasher = Sha256::new();
    let mut file =
        std::fs::File::open(artifact).map_err(|e| StepflowError::read_error(artifact, e))?;
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| StepflowError::read_error(artifact, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let placeholder = Placeholder {
        path: artifact.to_path_buf(),
        size,
        sha256: hex::encode(hasher.finalize()),
        volatilized_at: Utc::now(),
    };
    let target = placeholder_path(artifact);
    let yaml = serde_yaml::to_string(&placeholder)?;
    std::fs::write(&target, yaml).map_err(|e| StepflowError::write_error(&target, e))?;
    std::fs::remove_file(artifact).map_err(|e| StepflowError::write_error(artifact, e))?;
    Ok(size)
}

/// Files that could be volatilized right now, with their total size.
#[derive(Debug, Default)]
pub struct VolatilityReport {
    pub candidates: Vec<PathBuf>,
    pub total_bytes: u64,
}
