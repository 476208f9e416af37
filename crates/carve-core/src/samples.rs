//! On-disk sample library.
//!
//! Layout: `<root>/<domain>/{input,validation}/<name>.json`, one
//! [`SampleFile`] per page. Files are written unlabeled by `add-samples` and
//! labeled by hand afterwards; loaders skip and report unlabeled files.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::{SampleCase, compute_hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSet {
    /// Shown to the proposal service during synthesis.
    Input,
    /// Held out for scoring.
    Validation,
}

impl SampleSet {
    pub fn dir_name(&self) -> &'static str {
        match self {
            SampleSet::Input => "input",
            SampleSet::Validation => "validation",
        }
    }
}

impl fmt::Display for SampleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleLabel {
    pub content: String,
}

/// A sample as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFile {
    pub url: String,
    #[serde(default)]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub label: Option<SampleLabel>,
}

impl SampleFile {
    pub fn unlabeled(url: impl Into<String>, raw_content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            raw_content: Some(raw_content.into()),
            label: None,
        }
    }

    /// `None` unless both content and label are present.
    pub fn into_case(self) -> Option<SampleCase> {
        match (self.raw_content, self.label) {
            (Some(raw_content), Some(label)) => Some(SampleCase {
                url: self.url,
                raw_content,
                expected_content: label.content,
            }),
            _ => None,
        }
    }
}

impl From<&SampleCase> for SampleFile {
    fn from(case: &SampleCase) -> Self {
        Self {
            url: case.url.clone(),
            raw_content: Some(case.raw_content.clone()),
            label: Some(SampleLabel {
                content: case.expected_content.clone(),
            }),
        }
    }
}

/// Labeled cases of one domain/set, plus the URLs that were skipped.
#[derive(Debug, Clone, Default)]
pub struct LoadedSamples {
    pub cases: Vec<SampleCase>,
    pub unlabeled: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SampleLibrary {
    root: PathBuf,
}

impl SampleLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Domain directories, sorted. Empty if the library does not exist yet.
    pub fn domains(&self) -> Result<Vec<String>, AppError> {
        if !self.root.is_dir() {
            return Ok(vec![]);
        }
        let mut domains = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))? {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
                && !name.starts_with('.')
            {
                domains.push(name.to_string());
            }
        }
        domains.sort();
        Ok(domains)
    }

    /// All domains if `requested` is empty; otherwise `requested`, each of
    /// which must exist.
    pub fn resolve_domains(&self, requested: &[String]) -> Result<Vec<String>, AppError> {
        let available = self.domains()?;
        if requested.is_empty() {
            return Ok(available);
        }
        for domain in requested {
            if !available.contains(domain) {
                return Err(AppError::SampleError(format!(
                    "Unknown domain '{domain}' in {}",
                    self.root.display()
                )));
            }
        }
        Ok(requested.to_vec())
    }

    /// Load one set of a domain, in file-name order.
    pub fn load(&self, domain: &str, set: SampleSet) -> Result<LoadedSamples, AppError> {
        let dir = self.set_dir(domain, set)?;
        let mut loaded = LoadedSamples::default();
        if !dir.is_dir() {
            return Ok(loaded);
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| io_error(&dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let file = read_sample(&path)?;
            let url = file.url.clone();
            match file.into_case() {
                Some(case) => loaded.cases.push(case),
                None => loaded.unlabeled.push(url),
            }
        }
        Ok(loaded)
    }

    /// Write a sample file. The file name is derived from the URL's last
    /// path segment; a short hash is appended if another URL already owns
    /// that name.
    pub fn save(&self, domain: &str, set: SampleSet, file: &SampleFile) -> Result<PathBuf, AppError> {
        let dir = self.set_dir(domain, set)?;
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let stem = file_stem_for(&file.url);
        let mut path = dir.join(format!("{stem}.json"));
        if path.exists() && read_sample(&path)?.url != file.url {
            path = dir.join(format!("{stem}-{}.json", &compute_hash(&file.url)[..8]));
        }

        let body = serde_json::to_string_pretty(file)?;
        std::fs::write(&path, body).map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    pub fn save_labeled(
        &self,
        domain: &str,
        set: SampleSet,
        case: &SampleCase,
    ) -> Result<PathBuf, AppError> {
        self.save(domain, set, &SampleFile::from(case))
    }

    fn set_dir(&self, domain: &str, set: SampleSet) -> Result<PathBuf, AppError> {
        if domain.is_empty() || domain.contains(['/', '\\']) || domain.starts_with('.') {
            return Err(AppError::SampleError(format!("Invalid domain name: {domain}")));
        }
        Ok(self.root.join(domain).join(set.dir_name()))
    }
}

fn read_sample(path: &Path) -> Result<SampleFile, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::SampleError(format!("{}: {e}", path.display())))
}

fn file_stem_for(url: &str) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .unwrap_or_default();
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "index".to_string()
    } else {
        cleaned.to_string()
    }
}

fn io_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::SampleError(format!("{}: {e}", path.display()))
}
