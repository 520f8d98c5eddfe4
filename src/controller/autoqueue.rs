//! Auto-queue patterns.
//!
//! A pattern with `*` or `?` is a case-insensitive glob over the whole name;
//! anything else matches as a case-insensitive substring. Patterns keep their
//! insertion order and are persisted as `{"patterns": [...]}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::persist::{read_optional, write_atomic, PersistError};

#[derive(Debug)]
pub enum PatternError {
    Empty,
    Invalid { pattern: String, error: String },
    Duplicate(String),
    NotFound(String),
    Persist(PersistError),
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternError::Empty => write!(f, "Pattern must not be empty"),
            PatternError::Invalid { pattern, error } => {
                write!(f, "Invalid pattern '{pattern}': {error}")
            }
            PatternError::Duplicate(p) => write!(f, "Pattern already exists: {p}"),
            PatternError::NotFound(p) => write!(f, "Pattern not found: {p}"),
            PatternError::Persist(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PatternError {}

impl From<PersistError> for PatternError {
    fn from(e: PersistError) -> Self {
        PatternError::Persist(e)
    }
}

/// One compiled pattern. Compares by its source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AutoQueuePattern {
    pattern: String,
    regex: Regex,
}

impl AutoQueuePattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        let source = if pattern.contains(['*', '?']) {
            let mut re = String::from("(?i)^");
            for c in pattern.chars() {
                match c {
                    '*' => re.push_str(".*"),
                    '?' => re.push('.'),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');
            re
        } else {
            format!("(?i){}", regex::escape(pattern))
        };
        let regex = Regex::new(&source).map_err(|e| PatternError::Invalid {
            pattern: pattern.to_string(),
            error: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

impl PartialEq for AutoQueuePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for AutoQueuePattern {}

impl std::hash::Hash for AutoQueuePattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl TryFrom<String> for AutoQueuePattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<AutoQueuePattern> for String {
    fn from(p: AutoQueuePattern) -> Self {
        p.pattern
    }
}

/// Ordered set of patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoQueuePatterns {
    #[serde(default)]
    patterns: Vec<AutoQueuePattern>,
}

impl AutoQueuePatterns {
    pub fn add(&mut self, pattern: AutoQueuePattern) -> Result<(), PatternError> {
        if self.patterns.contains(&pattern) {
            return Err(PatternError::Duplicate(pattern.pattern));
        }
        self.patterns.push(pattern);
        Ok(())
    }

    pub fn remove(&mut self, pattern: &str) -> Result<AutoQueuePattern, PatternError> {
        let pattern = pattern.trim();
        let idx = self
            .patterns
            .iter()
            .position(|p| p.pattern == pattern)
            .ok_or_else(|| PatternError::NotFound(pattern.to_string()))?;
        Ok(self.patterns.remove(idx))
    }

    pub fn patterns(&self) -> &[AutoQueuePattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether any pattern matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn load(path: &Path) -> Result<Self, PatternError> {
        match read_optional(path)? {
            Some(content) => serde_json::from_str(&content).map_err(|e| {
                PatternError::Persist(PersistError::Format {
                    path: path.display().to_string(),
                    error: e.to_string(),
                })
            }),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), PatternError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            PatternError::Persist(PersistError::Format {
                path: path.display().to_string(),
                error: e.to_string(),
            })
        })?;
        Ok(write_atomic(path, &content).await?)
    }
}

struct StoreInner {
    patterns: AutoQueuePatterns,
    generation: u64,
}

/// Shared, persisted pattern list.
///
/// Every successful change bumps a generation counter, which the controller
/// uses to re-evaluate files that are still waiting in `DEFAULT`.
#[derive(Clone)]
pub struct PatternStore {
    inner: Arc<RwLock<StoreInner>>,
    path: Option<PathBuf>,
}

impl PatternStore {
    /// A store saved to `path` after every change. `None` keeps it in memory.
    pub fn new(patterns: AutoQueuePatterns, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                patterns,
                generation: 0,
            })),
            path,
        }
    }

    pub fn open(path: PathBuf) -> Result<Self, PatternError> {
        let patterns = AutoQueuePatterns::load(&path)?;
        Ok(Self::new(patterns, Some(path)))
    }

    pub async fn add(&self, pattern: &str) -> Result<(), PatternError> {
        let pattern = AutoQueuePattern::new(pattern)?;
        let mut inner = self.inner.write().await;
        let mut next = inner.patterns.clone();
        let text = pattern.pattern().to_string();
        next.add(pattern)?;
        if let Some(path) = &self.path {
            next.save(path).await?;
        }
        inner.patterns = next;
        inner.generation += 1;
        info!(pattern = %text, "Auto-queue pattern added");
        Ok(())
    }

    pub async fn remove(&self, pattern: &str) -> Result<(), PatternError> {
        let mut inner = self.inner.write().await;
        let mut next = inner.patterns.clone();
        next.remove(pattern)?;
        if let Some(path) = &self.path {
            next.save(path).await?;
        }
        inner.patterns = next;
        inner.generation += 1;
        info!(pattern = %pattern.trim(), "Auto-queue pattern removed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .patterns
            .patterns()
            .iter()
            .map(|p| p.pattern().to_string())
            .collect()
    }

    /// Current generation and a copy of the patterns.
    pub async fn snapshot(&self) -> (u64, AutoQueuePatterns) {
        let inner = self.inner.read().await;
        (inner.generation, inner.patterns.clone())
    }
}
