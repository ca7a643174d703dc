//! AuraSR model folder: checkpoint discovery and config resolution.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Folder names (compared case-insensitively) recognised under the models dir.
pub const AURA_FOLDER_NAMES: [&str; 3] = ["aura-sr", "aurasr", "aura_sr"];

/// Folder created when none of [`AURA_FOLDER_NAMES`] exists.
pub const DEFAULT_AURA_FOLDER: &str = "Aura-SR";

/// Checkpoint extensions the loader understands.
pub const SUPPORTED_EXTENSIONS: [&str; 1] = ["onnx"];

const CONFIG_STEM: &str = "config";
const CONFIG_EXTENSION: &str = "json";

/// Where a model's config JSON was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// `<dir>/<model stem>.json` next to the checkpoint.
    SameName,
    /// `<dir>/config.json` next to the checkpoint.
    Colocated,
    /// `config.json` at the AuraSR root while the checkpoint lives in a subfolder.
    RootFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub path: PathBuf,
    pub source: ConfigSource,
}

#[derive(Debug, Clone)]
pub struct ModelDirectory {
    root: PathBuf,
}

impl ModelDirectory {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Find the AuraSR folder inside `models_dir`, creating [`DEFAULT_AURA_FOLDER`]
    /// if there is none.
    pub fn locate(models_dir: &Path) -> Result<Self> {
        if let Some(existing) = find_aura_folder(models_dir) {
            debug!(root = %existing.display(), "Using AuraSR model folder");
            return Ok(Self::new(existing));
        }

        let root = models_dir.join(DEFAULT_AURA_FOLDER);
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create AuraSR model folder: {}", root.display()))?;
        info!(root = %root.display(), "Created AuraSR model folder");
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checkpoint names relative to the root, `/`-separated and sorted.
    pub fn list_models(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.root.is_dir() {
            return Ok(names);
        }

        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read model folder: {}", dir.display()))?;

            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !is_checkpoint(&path) {
                    continue;
                }
                if let Some(name) = self.relative_name(&path) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Absolute path of an existing checkpoint, `None` for unknown or escaping names.
    pub fn full_path(&self, model_name: &str) -> Option<PathBuf> {
        let relative = Path::new(model_name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if model_name.is_empty() || escapes {
            return None;
        }

        let path = self.root.join(relative);
        path.is_file().then_some(path)
    }

    /// Locate the config JSON for `model_name`.
    ///
    /// Priority: same-stem JSON next to the checkpoint (case-insensitive), then
    /// `config.json` next to it, then `config.json` at the root. The last one is
    /// only considered for checkpoints in a subfolder and logs a warning.
    pub fn resolve_config(&self, model_name: &str) -> Option<ResolvedConfig> {
        let checkpoint = self.full_path(model_name)?;
        let dir = checkpoint.parent()?;
        let stem = checkpoint.file_stem()?.to_string_lossy().to_string();

        if let Some(path) = find_json_with_stem(dir, &stem, false) {
            return Some(ResolvedConfig {
                path,
                source: ConfigSource::SameName,
            });
        }

        if let Some(path) = find_json_with_stem(dir, CONFIG_STEM, true) {
            return Some(ResolvedConfig {
                path,
                source: ConfigSource::Colocated,
            });
        }

        if dir != self.root.as_path() {
            if let Some(path) = find_json_with_stem(&self.root, CONFIG_STEM, true) {
                warn!(
                    model = %model_name,
                    config = %path.display(),
                    "No config next to the model, using the root config.json which may not match it"
                );
                return Some(ResolvedConfig {
                    path,
                    source: ConfigSource::RootFallback,
                });
            }
        }

        None
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

fn find_aura_folder(models_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(models_dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_lowercase())
                .is_some_and(|name| AURA_FOLDER_NAMES.contains(&name.as_str()))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn is_checkpoint(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// `<dir>/<stem>.json`; the stem is matched exactly when `exact_stem`,
/// case-insensitively otherwise. An exact match wins over a case-folded one.
fn find_json_with_stem(dir: &Path, stem: &str, exact_stem: bool) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let is_json = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(CONFIG_EXTENSION));
            let file_stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let stem_matches = if exact_stem {
                file_stem == stem
            } else {
                file_stem.eq_ignore_ascii_case(stem)
            };
            is_json && stem_matches
        })
        .collect();

    matches.sort();
    let exact = matches.iter().position(|path| {
        path.file_stem()
            .is_some_and(|s| s.to_string_lossy() == stem)
    });
    match exact {
        Some(index) => Some(matches.swap_remove(index)),
        None => matches.into_iter().next(),
    }
}
