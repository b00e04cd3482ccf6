use crate::config::{JobConfig, StoreConfig};
use crate::error::StoreError;
use crate::job::{JobId, JobState};
use crate::metrics::JobMetrics;
use crate::oracle::{Finding, Severity};
use crate::protocol::Protocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Immutable record of a job that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub protocol: Protocol,
    pub config: JobConfig,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metrics: JobMetrics,
    pub findings: Vec<Finding>,
    pub peak_severity: Option<Severity>,
    /// Why the job failed, set only for `Failed` jobs.
    pub failure_reason: Option<String>,
}

impl JobSummary {
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }

    pub fn findings_count(&self) -> usize {
        self.findings.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Criteria for [`JobStore::query`]. An empty filter matches every job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub protocol: Option<Protocol>,
    pub status: Option<JobState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub target_contains: Option<String>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn status(mut self, status: JobState) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to jobs created in `[from, to)`.
    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_after = Some(from);
        self.created_before = Some(to);
        self
    }

    pub fn target_contains(mut self, needle: impl Into<String>) -> Self {
        self.target_contains = Some(needle.into());
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, summary: &JobSummary) -> bool {
        self.protocol.as_ref().is_none_or(|p| *p == summary.protocol)
            && self.status.is_none_or(|s| s == summary.state)
            && self.created_after.is_none_or(|t| summary.created_at >= t)
            && self.created_before.is_none_or(|t| summary.created_at < t)
            && self
                .target_contains
                .as_ref()
                .is_none_or(|needle| summary.config.target.contains(needle.as_str()))
    }

    fn apply<'a>(&self, summaries: impl Iterator<Item = &'a JobSummary>) -> Vec<JobSummary> {
        let mut matched: Vec<JobSummary> = summaries.filter(|s| self.matches(s)).cloned().collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        if self.order == SortOrder::NewestFirst {
            matched.reverse();
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Durable record of finished jobs.
///
/// `save` is an idempotent upsert keyed by job id. Once a terminal summary is stored it is
/// never replaced: saving an identical summary again succeeds, saving a different one fails
/// with [`StoreError::Immutable`].
pub trait JobStore: Send + Sync {
    /// Inserts or replaces the summary stored for `summary.job_id`.
    ///
    /// # Arguments
    /// * `summary`: The job summary to persist.
    ///
    /// # Returns
    /// `Ok(())` once the summary is stored, or [`StoreError::Immutable`] if a different
    /// terminal summary already exists for the job.
    fn save(&self, summary: JobSummary) -> Result<(), StoreError>;

    /// Looks up the summary of one job.
    ///
    /// # Arguments
    /// * `job_id`: The job to look up.
    ///
    /// # Returns
    /// `Ok(Some(summary))` if the job was saved, `Ok(None)` if it is unknown to this store.
    fn get(&self, job_id: &JobId) -> Result<Option<JobSummary>, StoreError>;

    /// Matching summaries, newest first unless the filter says otherwise.
    fn query(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_replaceable(existing: Option<&JobSummary>, incoming: &JobSummary) -> Result<bool, StoreError> {
    match existing {
        Some(current) if current.state.is_terminal() => {
            if current == incoming {
                Ok(false)
            } else {
                Err(StoreError::Immutable(incoming.job_id))
            }
        }
        _ => Ok(true),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    summaries: RwLock<HashMap<JobId, JobSummary>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn save(&self, summary: JobSummary) -> Result<(), StoreError> {
        let mut summaries = self.summaries.write().unwrap_or_else(PoisonError::into_inner);
        if check_replaceable(summaries.get(&summary.job_id), &summary)? {
            debug!(job_id = %summary.job_id, state = %summary.state, "Stored job summary");
            summaries.insert(summary.job_id, summary);
        }
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobSummary>, StoreError> {
        let summaries = self.summaries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(summaries.get(job_id).cloned())
    }

    fn query(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, StoreError> {
        let summaries = self.summaries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(filter.apply(summaries.values()))
    }

    fn len(&self) -> usize {
        self.summaries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Stores one JSON document per job in a directory.
///
/// Documents are written to a temporary file in the same directory and renamed into place,
/// so a crash never leaves a half-written summary. Existing documents are indexed on open.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    index: RwLock<HashMap<JobId, JobSummary>>,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut index = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<JobSummary>(&content) {
                Ok(summary) => {
                    index.insert(summary.job_id, summary);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job summary"),
            }
        }
        debug!(dir = %dir.display(), jobs = index.len(), "Opened job store");
        Ok(Self {
            dir,
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }
}

impl JobStore for FileJobStore {
    fn save(&self, summary: JobSummary) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            if !check_replaceable(index.get(&summary.job_id), &summary)? {
                return Ok(());
            }
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &summary)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&summary.job_id))
            .map_err(|e| StoreError::Io(e.error))?;

        debug!(job_id = %summary.job_id, state = %summary.state, "Persisted job summary");
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(summary.job_id, summary);
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobSummary>, StoreError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.get(job_id).cloned())
    }

    fn query(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, StoreError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(filter.apply(index.values()))
    }

    fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Builds the store selected by the engine configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    Ok(match config {
        StoreConfig::InMemory => Arc::new(InMemoryJobStore::new()),
        StoreConfig::OnDisk { path } => Arc::new(FileJobStore::open(path)?),
    })
}
