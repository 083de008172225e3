use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// A discovered document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the document root.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// Last modification time as seconds since the Unix epoch.
    pub mtime: u64,
    /// Size in bytes.
    pub size: u64,
}

impl DiscoveredFile {
    /// Describe a single file outside of a directory walk.
    pub fn from_path(root: &Path, path: &Path) -> Result<Self> {
        let absolute = path.canonicalize()?;
        let meta = std::fs::metadata(&absolute)?;
        let relative_path = root
            .canonicalize()
            .ok()
            .and_then(|r| absolute.strip_prefix(r).ok().map(Path::to_path_buf))
            .unwrap_or_else(|| absolute.clone());
        Ok(Self {
            relative_path,
            absolute_path: absolute,
            mtime: mtime_secs(&meta),
            size: meta.len(),
        })
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            Error::Config(format!("invalid include pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("invalid include patterns: {e}")))
}

/// Recursively walk a directory and discover eligible document files.
///
/// Skips hidden files/directories (names starting with `.`) and only
/// returns files whose root-relative path matches one of `include`.
pub fn discover_files(
    root: &Path,
    include: &[String],
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let globs = build_globset(include)?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &globs, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    globs: &GlobSet,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        // Skip hidden files and directories.
        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk_dir(root, &path, globs, results)?;
        } else if file_type.is_symlink() {
            let resolved = match path.canonicalize() {
                Ok(p) => p,
                Err(_) => continue, // Skip broken symlinks
            };
            // Directory symlinks are not followed (cycle prevention).
            if resolved.is_file() && is_included(root, &path, globs) {
                results.push(make_discovered(root, &path, &resolved)?);
            }
        } else if file_type.is_file() && is_included(root, &path, globs) {
            let abs = path.canonicalize()?;
            results.push(make_discovered(root, &path, &abs)?);
        }
    }

    Ok(())
}

fn is_included(root: &Path, path: &Path, globs: &GlobSet) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    globs.is_match(relative)
}

fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: &Path,
) -> Result<DiscoveredFile> {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    let meta = std::fs::metadata(absolute_path)?;

    Ok(DiscoveredFile {
        relative_path,
        absolute_path: absolute_path.to_path_buf(),
        mtime: mtime_secs(&meta),
        size: meta.len(),
    })
}

/// Extract indexable text from a supported file.
///
/// Markdown and plain text are returned verbatim, JSON is pretty-printed so
/// keys and values land on their own lines, and CSV rows become
/// `field | field | field` lines.
pub fn read_text(path: &Path) -> Result<String> {
    extract_text(path, &std::fs::read(path)?)
}

/// [`read_text`] over bytes already read from `path`.
pub fn extract_text(path: &Path, contents: &[u8]) -> Result<String> {
    let raw = std::str::from_utf8(contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("json") => {
            let value: serde_json::Value = serde_json::from_str(raw)?;
            Ok(serde_json::to_string_pretty(&value)?)
        }
        Some("csv") => csv_rows(raw),
        _ => Ok(raw.to_string()),
    }
}

/// One `field | field` line per non-empty record. Quoted fields may span
/// lines and rows may have differing widths.
fn csv_rows(raw: &str) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let fields: Vec<&str> = record.iter().map(str::trim).collect();
        if fields.iter().any(|f| !f.is_empty()) {
            rows.push(fields.join(" | "));
        }
    }
    Ok(rows.join("\n"))
}
