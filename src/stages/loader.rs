//! Stage file loader.
//!
//! Reads `<service>_stages.{yaml,yml,toml}` files from a directory. A file
//! looks like:
//!
//! ```yaml
//! service_name: translate
//! description: Text translation
//! stages:
//!   - id: loading_model
//!     progress: 20
//!   - id: translating
//!     progress: 60
//!     supports_substeps: true
//!     timeout_seconds: 120
//! ```
//!
//! Lookup by service name tries the exact name, then its snake_case form,
//! then the name without a `_service` suffix. Services without a file get the
//! `default_stages` file if present, else [`StageDefinition::fallback`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, File};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::definition::{Stage, StageDefinition, StageError};
use crate::registry::discovery::to_snake_case;

const FILE_SUFFIX: &str = "_stages";
const EXTENSIONS: &[&str] = &["yaml", "yml", "toml"];

/// Parsed contents of one stage file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageFile {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl StageFile {
    pub fn definition(&self) -> StageDefinition {
        StageDefinition::new(self.stages.clone())
    }
}

/// Directory-backed, cached stage file loader
#[derive(Debug)]
pub struct StageConfigLoader {
    directory: PathBuf,
    cache: RwLock<Option<HashMap<String, StageFile>>>,
}

impl StageConfigLoader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        debug!(directory = %directory.display(), "StageConfigLoader initialized");
        Self {
            directory,
            cache: RwLock::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Stage files in the directory, sorted by path
    pub fn find_stage_files(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    directory = %self.directory.display(),
                    error = %e,
                    "Stage directory not readable"
                );
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && service_name_from_path(path).is_some())
            .collect();
        files.sort();
        files
    }

    /// Parse one stage file; a file without stages is an error
    pub fn load_file(&self, path: &Path) -> Result<StageFile, StageError> {
        let load_error = |reason: String| StageError::Load {
            path: path.display().to_string(),
            reason,
        };

        let parsed: StageFile = Config::builder()
            .add_source(File::from(path))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| load_error(e.to_string()))?;

        if parsed.stages.is_empty() {
            return Err(load_error("no stages defined".to_string()));
        }
        Ok(parsed)
    }

    /// Load every stage file, skipping (and logging) ones that fail to parse.
    /// Returns the number of files loaded.
    pub fn load_all(&self) -> usize {
        let mut loaded = HashMap::new();
        for path in self.find_stage_files() {
            let Some(name) = service_name_from_path(&path) else {
                continue;
            };
            match self.load_file(&path) {
                Ok(file) => {
                    debug!(service = %name, path = %path.display(), "Loaded stage file");
                    loaded.insert(name, file);
                }
                Err(e) => warn!(error = %e, "Skipping stage file"),
            }
        }

        let count = loaded.len();
        *self.cache.write() = Some(loaded);
        info!(count, directory = %self.directory.display(), "Stage files loaded");
        count
    }

    /// Drop the cache and read the directory again
    pub fn reload(&self) -> usize {
        *self.cache.write() = None;
        self.load_all()
    }

    fn ensure_loaded(&self) {
        if self.cache.read().is_none() {
            self.load_all();
        }
    }

    /// Stage file for `service_name` (exact, snake_case, then without `_service`)
    pub fn config_for(&self, service_name: &str) -> Option<StageFile> {
        self.ensure_loaded();
        let cache = self.cache.read();
        let files = cache.as_ref()?;

        if let Some(file) = files.get(service_name) {
            return Some(file.clone());
        }

        let snake = to_snake_case(service_name);
        if let Some(file) = files.get(&snake) {
            return Some(file.clone());
        }

        if let Some(base) = snake.strip_suffix("_service") {
            if let Some(file) = files.get(base) {
                return Some(file.clone());
            }
        }

        debug!(service = service_name, "No stage file found");
        None
    }

    /// Definition for `service_name`, falling back to the `default` file and
    /// then to the built-in single-stage definition
    pub fn definition_for(&self, service_name: &str) -> StageDefinition {
        if let Some(file) = self.config_for(service_name) {
            return file.definition();
        }
        info!(service = service_name, "Using default stage definition");
        self.config_for("default")
            .map(|file| file.definition())
            .unwrap_or_else(StageDefinition::fallback)
    }
}

/// `translate_stages.yaml` -> `translate`
fn service_name_from_path(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?;
    if !EXTENSIONS.contains(&extension) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.strip_suffix(FILE_SUFFIX)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const TRANSLATE_YAML: &str = r#"
service_name: translate
description: Text translation
stages:
  - id: loading_model
    progress: 20
  - id: translating
    progress: 60
    supports_substeps: true
    timeout_seconds: 120
"#;

    fn loader_with(files: &[(&str, &str)]) -> (TempDir, StageConfigLoader) {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        let loader = StageConfigLoader::new(dir.path());
        (dir, loader)
    }

    #[test]
    fn test_service_name_from_path() {
        assert_eq!(
            service_name_from_path(Path::new("x/translate_stages.yaml")).as_deref(),
            Some("translate")
        );
        assert_eq!(
            service_name_from_path(Path::new("file_service_stages.toml")).as_deref(),
            Some("file_service")
        );
        assert!(service_name_from_path(Path::new("translate.yaml")).is_none());
        assert!(service_name_from_path(Path::new("translate_stages.json")).is_none());
        assert!(service_name_from_path(Path::new("_stages.yaml")).is_none());
    }

    #[test]
    fn test_loads_yaml_stage_file() {
        let (_dir, loader) = loader_with(&[("translate_stages.yaml", TRANSLATE_YAML)]);
        assert_eq!(loader.load_all(), 1);

        let def = loader.definition_for("translate");
        assert_eq!(def.progress_for("translating"), 60);
        let translating = def.stage_by_id("translating").unwrap();
        assert!(translating.supports_substeps);
        assert_eq!(translating.timeout_seconds, Some(120));
        assert!(def.validate_sequence().is_ok());
    }

    #[test]
    fn test_lookup_fallbacks() {
        let (_dir, loader) = loader_with(&[("translate_stages.yaml", TRANSLATE_YAML)]);
        assert!(loader.config_for("translate").is_some());
        assert!(loader.config_for("Translate").is_some());
        assert!(loader.config_for("TranslateService").is_some());
        assert!(loader.config_for("translate_service").is_some());
        assert!(loader.config_for("speech").is_none());
    }

    #[test]
    fn test_toml_stage_file() {
        let toml = r#"
service_name = "speech"

[[stages]]
id = "decoding"
progress = 30

[[stages]]
id = "synthesizing"
progress = 80
"#;
        let (_dir, loader) = loader_with(&[("speech_stages.toml", toml)]);
        let def = loader.definition_for("speech");
        assert_eq!(def.own_stages().len(), 2);
        assert_eq!(def.progress_for("synthesizing"), 80);
    }

    #[test]
    fn test_missing_service_uses_fallback() {
        let (_dir, loader) = loader_with(&[]);
        let def = loader.definition_for("unknown_thing");
        assert_eq!(def, StageDefinition::fallback());
    }

    #[test]
    fn test_default_file_preferred_over_builtin_fallback() {
        let default_yaml = r#"
stages:
  - id: working
    progress: 40
"#;
        let (_dir, loader) = loader_with(&[("default_stages.yaml", default_yaml)]);
        let def = loader.definition_for("ocr");
        assert_eq!(def.progress_for("working"), 40);
    }

    #[test]
    fn test_invalid_files_are_skipped() {
        let (_dir, loader) = loader_with(&[
            ("translate_stages.yaml", TRANSLATE_YAML),
            ("empty_stages.yaml", "service_name: empty\nstages: []\n"),
            ("broken_stages.yaml", "stages: [: not yaml"),
        ]);
        assert_eq!(loader.load_all(), 1);
        assert!(loader.config_for("empty").is_none());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let loader = StageConfigLoader::new("/definitely/not/here");
        assert!(loader.find_stage_files().is_empty());
        assert_eq!(loader.load_all(), 0);
    }
}
