//! Output directory sandboxing.
//!
//! A job's `output_dir` is an untrusted relative path. The final directory
//! must stay inside the configured data root even in the presence of
//! symlinks that already exist on disk.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

/// Resolve `requested` (or `fallback` when absent) against `data_root`.
///
/// Rejects absolute paths, `..` segments and NUL bytes, then verifies via
/// the deepest existing ancestor's real path that the target cannot escape
/// the root. Does not create the final directory.
pub fn sanitize_output_dir(data_root: &Path, requested: Option<&str>, fallback: &str) -> Result<PathBuf> {
    let raw = requested.unwrap_or(fallback);
    if raw.contains('\0') {
        bail!("output_dir must not contain NUL bytes.");
    }

    let relative = Path::new(raw);
    if relative.is_absolute() || raw.starts_with('/') || raw.starts_with('\\') {
        bail!("output_dir must be relative.");
    }

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => bail!("output_dir traversal is not allowed."),
            Component::RootDir | Component::Prefix(_) => bail!("output_dir must be relative."),
        }
    }
    if normalized.as_os_str().is_empty() {
        bail!("output_dir is empty.");
    }

    std::fs::create_dir_all(data_root)
        .with_context(|| format!("Failed to create data root {}", data_root.display()))?;
    let root = data_root
        .canonicalize()
        .with_context(|| format!("Failed to resolve data root {}", data_root.display()))?;

    let target = root.join(&normalized);

    // Symlinks already on disk could redirect a lexically safe path outside
    // the root; check the real path of the deepest existing ancestor.
    let mut probe: &Path = &target;
    loop {
        if probe.exists() {
            let real = probe
                .canonicalize()
                .with_context(|| format!("Failed to resolve {}", probe.display()))?;
            if !real.starts_with(&root) {
                bail!("output_dir resolves outside the data root.");
            }
            break;
        }
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break,
        }
    }

    Ok(target)
}
