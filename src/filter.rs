//! Filters deciding which listed remote entries the source ingests.
//!
//! A [`FilterChain`] runs its filters in order and stops at the first
//! rejection. The source always puts the name filter first, so names it
//! rejects never reach the durable store.

use std::sync::Arc;

use regex::Regex;

use crate::clock::Clock;
use crate::config::ConfigError;
use crate::error::FlowError;
use crate::metadata::MetadataStore;
use crate::remote::RemoteFileMetadata;

pub trait FileFilter: Send + Sync {
    fn accept(&self, file: &RemoteFileMetadata) -> Result<bool, FlowError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Shell-style pattern (`*.csv`, `report-??.txt`) matched against the file name.
#[derive(Debug)]
pub struct GlobFilter {
    pattern: glob::Pattern,
}

impl GlobFilter {
    pub fn new(pattern: &str) -> Result<Self, glob::PatternError> {
        Ok(Self {
            pattern: glob::Pattern::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl FileFilter for GlobFilter {
    fn accept(&self, file: &RemoteFileMetadata) -> Result<bool, FlowError> {
        Ok(!file.is_directory && self.pattern.matches(&file.name))
    }

    fn name(&self) -> &'static str {
        "glob"
    }
}

/// Regular expression that must match the whole file name.
#[derive(Debug)]
pub struct RegexFilter {
    regex: Regex,
}

impl RegexFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }
}

impl FileFilter for RegexFilter {
    fn accept(&self, file: &RemoteFileMetadata) -> Result<bool, FlowError> {
        Ok(!file.is_directory && self.regex.is_match(&file.name))
    }

    fn name(&self) -> &'static str {
        "regex"
    }
}

/// Accept-once filter backed by a [`MetadataStore`].
///
/// The record is written *before* `accept` returns `true`. A crash, or a
/// failed download, after that point leaves the file marked as seen: it will
/// not be ingested again until an operator removes its record. This trades
/// possible missed files for never ingesting a file twice.
pub struct PersistentFilter {
    store: Arc<dyn MetadataStore>,
    namespace: String,
    clock: Arc<dyn Clock>,
}

impl PersistentFilter {
    pub fn new(store: Arc<dyn MetadataStore>, namespace: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            namespace: namespace.trim_end_matches('/').to_string(),
            clock,
        }
    }

    /// Store key for a remote path.
    pub fn key_for(&self, remote_path: &str) -> String {
        record_key(&self.namespace, remote_path)
    }
}

/// `<namespace>/<remote path>`, with any trailing `/` on the namespace dropped.
pub fn record_key(namespace: &str, remote_path: &str) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), remote_path)
}

impl FileFilter for PersistentFilter {
    fn accept(&self, file: &RemoteFileMetadata) -> Result<bool, FlowError> {
        if file.is_directory {
            return Ok(false);
        }
        let key = self.key_for(&file.path);
        let marker = self.clock.now().timestamp_millis().to_string();
        let inserted = self.store.put_if_absent(&key, &marker)?;
        if !inserted {
            tracing::trace!(key = %key, "already ingested");
        }
        Ok(inserted)
    }

    fn name(&self) -> &'static str {
        "persistent"
    }
}

/// Ordered filters combined with short-circuit AND. Empty chains accept all
/// regular files.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn FileFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl FileFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn push(&mut self, filter: Box<dyn FileFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

impl FileFilter for FilterChain {
    fn accept(&self, file: &RemoteFileMetadata) -> Result<bool, FlowError> {
        if file.is_directory {
            return Ok(false);
        }
        for filter in &self.filters {
            if !filter.accept(file)? {
                tracing::trace!(file = %file.path, filter = filter.name(), "rejected");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

/// Build the name filter from the configured glob and regex.
///
/// They are mutually exclusive; when both are set the glob wins and the regex
/// is ignored.
pub fn name_filter(
    pattern: Option<&str>,
    regex: Option<&str>,
) -> Result<Option<Box<dyn FileFilter>>, ConfigError> {
    let pattern = pattern.filter(|p| !p.trim().is_empty());
    let regex = regex.filter(|r| !r.is_empty());

    if let Some(pattern) = pattern {
        if regex.is_some() {
            tracing::warn!(
                pattern,
                "both filename_pattern and filename_regex are set; ignoring filename_regex"
            );
        }
        let filter = GlobFilter::new(pattern)
            .map_err(|e| ConfigError::Invalid(format!("filename_pattern {pattern:?}: {e}")))?;
        return Ok(Some(Box::new(filter)));
    }

    if let Some(regex) = regex {
        let filter = RegexFilter::new(regex)
            .map_err(|e| ConfigError::Invalid(format!("filename_regex {regex:?}: {e}")))?;
        return Ok(Some(Box::new(filter)));
    }

    Ok(None)
}
