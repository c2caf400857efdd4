//! Artifact checksums and the `manifest.json` sibling file.
//!
//! The manifest describes a job's non-manifest artifacts; once written, its
//! own hash is appended to the persisted result so the result's checksum map
//! covers every path it lists, manifest included. All functions here do
//! blocking I/O and are called off the async loop.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Streaming SHA-256 of a file, as `sha256:<hex>`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Hash every existing regular file among `paths`.
pub fn checksums_for_paths(paths: &[String]) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for path_text in paths {
        let path = Path::new(path_text);
        if path.is_file() {
            checksums.insert(path_text.clone(), sha256_file(path)?);
        }
    }
    Ok(checksums)
}

pub fn build_manifest_entry(
    job_id: &str,
    provider: &str,
    collection: &str,
    metadata: &serde_json::Value,
    paths: &[String],
    checksums: &BTreeMap<String, String>,
) -> serde_json::Value {
    json!({
        "job_id": job_id,
        "provider": provider,
        "collection": collection,
        "created_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "paths": paths,
        "checksums": checksums,
        "metadata": metadata,
    })
}

/// Write `manifest.json` into `output_dir` and return its path.
pub fn write_manifest(output_dir: &Path, entry: &serde_json::Value) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let manifest_path = output_dir.join(MANIFEST_FILE_NAME);
    let body = serde_json::to_string_pretty(entry)?;
    std::fs::write(&manifest_path, body)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    Ok(manifest_path)
}
