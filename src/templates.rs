// Author: BlackIce Project
// License: MIT

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Templates outside these bounds are useless for matching: too small to
/// be distinctive, too large to be a UI element.
const MIN_DIMENSION: u32 = 10;
const MAX_DIMENSION: u32 = 500;
const MIN_EDGE_COUNT: u64 = 20;

pub const METADATA_FILE: &str = "templates_metadata.json";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template metadata unreadable: {0}")]
    Metadata(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("screenshot unreadable: {0}")]
    Screenshot(String),

    #[error("matcher backend failed: {0}")]
    Backend(String),
}

/// Sidecar entry for `templates/<category>/<name>.png`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub path: PathBuf,
    pub size: [u32; 2],
    pub added_ts: f64,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl TemplateMeta {
    /// Structural validity: dimensions in range and enough edges to match
    /// against. Edge counts are produced by the (external) matcher when a
    /// template is added; absent means unknown, which we accept.
    pub fn valid(&self) -> bool {
        let [w, h] = self.size;
        if w < MIN_DIMENSION || h < MIN_DIMENSION || w > MAX_DIMENSION || h > MAX_DIMENSION {
            return false;
        }
        match self.meta.get("edge_count").and_then(|v| v.as_u64()) {
            Some(edges) => edges >= MIN_EDGE_COUNT,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchHit {
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
}

/// The image-matching backend is an external collaborator; the core only
/// needs "best match above threshold, or nothing".
pub trait TemplateMatcher: Send + Sync {
    fn find(
        &self,
        template: &TemplateMeta,
        screenshot: &Path,
        min_confidence: f32,
    ) -> Result<Option<MatchHit>, MatchError>;
}

/// Matcher used when no backend is wired in; every lookup misses.
pub struct NullMatcher;

impl TemplateMatcher for NullMatcher {
    fn find(
        &self,
        _template: &TemplateMeta,
        _screenshot: &Path,
        _min_confidence: f32,
    ) -> Result<Option<MatchHit>, MatchError> {
        Ok(None)
    }
}

/// Index over the on-disk template tree, keyed by `<category>/<name>`.
pub struct TemplateLibrary {
    dir: PathBuf,
    index: HashMap<String, TemplateMeta>,
}

impl TemplateLibrary {
    /// Load the sidecar index. A missing sidecar is an empty library, a
    /// corrupt one is an error. Entries failing validation are dropped.
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let sidecar = dir.join(METADATA_FILE);
        if !sidecar.exists() {
            debug!(dir = %dir.display(), "no template metadata, starting empty");
            return Ok(Self {
                dir: dir.to_path_buf(),
                index: HashMap::new(),
            });
        }

        let raw = std::fs::read_to_string(&sidecar)?;
        let parsed: HashMap<String, TemplateMeta> =
            serde_json::from_str(&raw).map_err(|e| TemplateError::Metadata(e.to_string()))?;

        let mut index = HashMap::new();
        for (id, meta) in parsed {
            if meta.valid() {
                index.insert(id, meta);
            } else {
                warn!(template = %id, size = ?meta.size, "rejecting invalid template");
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, id: &str) -> Option<&TemplateMeta> {
        self.index.get(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }
}
