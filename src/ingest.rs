// Copyright 2026 Ragkit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Loads documents from files and directory trees.

use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use serde_json::Map;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;
use tracing::warn;
use walkdir::WalkDir;

use crate::model::Document;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub glob: Option<String>,
    pub ignore: Vec<String>,
    /// Source paths are recorded relative to this directory when inside it.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Text,
    Markdown,
    Json,
    Csv,
    Pdf,
}

impl FileFormat {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "txt" | "text" => Some(FileFormat::Text),
            "md" | "markdown" => Some(FileFormat::Markdown),
            "json" => Some(FileFormat::Json),
            "csv" => Some(FileFormat::Csv),
            "pdf" => Some(FileFormat::Pdf),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Text => "txt",
            FileFormat::Markdown => "md",
            FileFormat::Json => "json",
            FileFormat::Csv => "csv",
            FileFormat::Pdf => "pdf",
        }
    }
}

/// Loads every supported file under `paths`, sorted by path.
pub fn load_documents(paths: &[PathBuf], opts: &LoadOptions) -> Result<LoadReport> {
    let include_set = build_globset(opts.glob.as_deref())?;
    let ignore_set = build_ignore_set(&opts.ignore)?;

    let mut files = Vec::new();
    for path in resolve_paths(paths) {
        if path.is_file() {
            files.push(path);
        } else if path.is_dir() {
            for entry in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        } else {
            anyhow::bail!("path not found: {}", path.display());
        }
    }
    let root = opts
        .root
        .as_ref()
        .map(|r| r.canonicalize().unwrap_or_else(|_| r.clone()));
    let mut named: Vec<(String, PathBuf)> = files
        .into_iter()
        .map(|path| (source_name(&path, root.as_deref()), path))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.dedup_by(|a, b| a.0 == b.0);

    let mut report = LoadReport::default();
    for (name, path) in named {
        if !ignore_set.is_empty() && ignore_set.is_match(&name) {
            continue;
        }
        if let Some(set) = &include_set
            && !set.is_match(&name)
        {
            continue;
        }
        let Some(format) = FileFormat::from_path(&path) else {
            debug!(path = %path.display(), "unsupported extension");
            report.skipped += 1;
            continue;
        };
        match load_file(&path, &name, format) {
            Ok(Some(document)) => report.documents.push(document),
            Ok(None) => {
                report.skipped += 1;
            }
            Err(err) => {
                warn!(path = %name, error = %err, "skipping file");
                report.warnings.push(format!("skip {name}: {err:#}"));
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

/// `path` relative to `root` when inside it, without `.` or `..`
/// components, `/`-separated.
fn source_name(path: &Path, root: Option<&Path>) -> String {
    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let shown = match root.and_then(|root| absolute.strip_prefix(root).ok()) {
        Some(relative) => relative.to_path_buf(),
        None => lexical_clean(path),
    };
    shown.to_string_lossy().replace('\\', "/")
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir if cleaned.file_name().is_some() => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

fn resolve_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    if paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        paths.to_vec()
    }
}

fn build_globset(pattern: Option<&str>) -> Result<Option<GlobSet>> {
    if let Some(pat) = pattern {
        let mut builder = GlobSetBuilder::new();
        builder.add(Glob::new(pat)?);
        let set = builder.build()?;
        Ok(Some(set))
    } else {
        Ok(None)
    }
}

fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(Glob::new(pat)?);
    }
    Ok(builder.build()?)
}

fn load_file(path: &Path, source: &str, format: FileFormat) -> Result<Option<Document>> {
    let path_str = source.to_string();
    let content = match format {
        FileFormat::Pdf => anyhow::bail!("pdf text extraction is not supported"),
        FileFormat::Text | FileFormat::Markdown => {
            std::fs::read_to_string(path).with_context(|| format!("read {path_str}"))?
        }
        FileFormat::Json => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path_str}"))?;
            let value: Value = serde_json::from_str(&text).context("parse json")?;
            serde_json::to_string(&value)?
        }
        FileFormat::Csv => csv_to_json(path)?,
    };
    if content.trim().is_empty() {
        debug!(path = %path_str, "empty document");
        return Ok(None);
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), path_str.clone());
    metadata.insert("format".to_string(), format.as_str().to_string());
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        metadata.insert("file_name".to_string(), name.to_string());
    }
    let mtime = std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| OffsetDateTime::from(t).format(&Rfc3339).ok());
    if let Some(mtime) = mtime {
        metadata.insert("mtime".to_string(), mtime);
    }

    Ok(Some(Document {
        id: document_id(&path_str),
        source_path: path_str,
        content,
        metadata,
    }))
}

/// Rows as a JSON array of header-keyed objects.
fn csv_to_json(path: &Path) -> Result<String> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(Value::Object(row));
    }
    Ok(serde_json::to_string(&Value::Array(rows))?)
}

/// Stable per-path id, so re-indexing a file replaces its entries.
pub fn document_id(source_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn loads_supported_formats_sorted() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("kb/nested"))?;
        std::fs::write(root.join("kb/b.md"), "# Backups\nDaily backups run at 2 AM UTC.\n")?;
        std::fs::write(root.join("kb/a.txt"), "Retention is 30 days.")?;
        std::fs::write(root.join("kb/nested/c.json"), "{ \"owner\": \"ops\" }")?;
        std::fs::write(root.join("kb/nested/d.csv"), "host,zone\ndb1,eu\n")?;
        std::fs::write(root.join("kb/e.pdf"), "%PDF-1.4")?;
        std::fs::write(root.join("kb/f.bin"), [0u8, 1, 2])?;
        std::fs::write(root.join("kb/empty.txt"), "  \n")?;

        let report = load_documents(&[root.join("kb")], &LoadOptions::default())?;
        let names: Vec<&str> = report
            .documents
            .iter()
            .map(|d| d.metadata["file_name"].as_str())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md", "c.json", "d.csv"]);
        assert_eq!(report.documents[2].content, "{\"owner\":\"ops\"}");
        assert_eq!(report.documents[3].content, "[{\"host\":\"db1\",\"zone\":\"eu\"}]");
        assert_eq!(report.skipped, 3);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("pdf"));
        Ok(())
    }

    #[test]
    fn glob_and_ignore_filter_files() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::write(root.join("keep.md"), "keep")?;
        std::fs::write(root.join("drop.md"), "drop")?;
        std::fs::write(root.join("other.txt"), "other")?;

        let opts = LoadOptions {
            glob: Some("**/*.md".to_string()),
            ignore: vec!["**/drop.md".to_string()],
            ..Default::default()
        };
        let report = load_documents(&[root.to_path_buf()], &opts)?;
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].content, "keep");
        Ok(())
    }

    #[test]
    fn spellings_of_one_file_share_a_document() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("kb/nested"))?;
        std::fs::write(root.join("kb/a.txt"), "Retention is 30 days.")?;

        let opts = LoadOptions {
            root: Some(root.to_path_buf()),
            ..Default::default()
        };
        let paths = vec![
            root.join("kb/a.txt"),
            root.join("kb/./a.txt"),
            root.join("kb/nested/../a.txt"),
            root.join("kb"),
        ];
        let report = load_documents(&paths, &opts)?;
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].source_path, "kb/a.txt");
        assert_eq!(report.documents[0].id, document_id("kb/a.txt"));
        Ok(())
    }

    #[test]
    fn outside_root_paths_are_cleaned() {
        assert_eq!(source_name(Path::new("./kb/./a.txt"), None), "kb/a.txt");
        assert_eq!(source_name(Path::new("kb/x/../a.txt"), None), "kb/a.txt");
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempdir().expect("tempdir");
        assert!(load_documents(&[dir.path().join("nope")], &LoadOptions::default()).is_err());
    }

    #[test]
    fn document_id_is_stable() {
        assert_eq!(document_id("kb/a.md"), document_id("kb/a.md"));
        assert_ne!(document_id("kb/a.md"), document_id("kb/b.md"));
        assert_eq!(document_id("kb/a.md").len(), 16);
    }
}
