//! Work queue of bucket ids plus the per-bucket status store.
//!
//! One handle is created at startup and cloned into the scheduler and into
//! every caller that enqueues or reads status. Each operation takes the lock
//! once, so push/pop and status reads are atomic per call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::models::JobStatus;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    status: HashMap<String, JobStatus>,
    errored: HashMap<String, String>,
    executing: Option<String>,
}

#[derive(Clone, Default)]
pub struct JobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        Ok(self.state.lock()?)
    }

    /// Appends `bucket_id` unless it is already queued or executing.
    /// Returns whether it was appended.
    pub fn enqueue(&self, bucket_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        if state.executing.as_deref() == Some(bucket_id) || state.pending.iter().any(|b| b == bucket_id) {
            return Ok(false);
        }
        state.pending.push_back(bucket_id.to_string());
        Ok(true)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.state()?.pending.iter().cloned().collect())
    }

    /// Queued ids in positions `start..end`, clamped to the queue length.
    pub fn peek_range(&self, start: usize, end: usize) -> Result<Vec<String>> {
        let state = self.state()?;
        Ok(state
            .pending
            .iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .cloned()
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state()?.pending.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Pops the front id, drops every other occurrence of it and marks it
    /// executing.
    pub fn take_next(&self) -> Result<Option<String>> {
        let mut state = self.state()?;
        let Some(next) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.pending.retain(|b| *b != next);
        state.executing = Some(next.clone());
        Ok(Some(next))
    }

    pub fn remove_all(&self, bucket_id: &str) -> Result<usize> {
        let mut state = self.state()?;
        let before = state.pending.len();
        state.pending.retain(|b| b != bucket_id);
        Ok(before - state.pending.len())
    }

    pub fn finish_executing(&self) -> Result<()> {
        self.state()?.executing = None;
        Ok(())
    }

    pub fn executing(&self) -> Result<Option<String>> {
        Ok(self.state()?.executing.clone())
    }

    pub fn set_status(&self, bucket_id: &str, status: JobStatus) -> Result<()> {
        self.state()?.status.insert(bucket_id.to_string(), status);
        Ok(())
    }

    /// Current status, `idle` when the bucket never ran since the last reset.
    pub fn status(&self, bucket_id: &str) -> Result<JobStatus> {
        Ok(self
            .state()?
            .status
            .get(bucket_id)
            .cloned()
            .unwrap_or_else(JobStatus::idle))
    }

    pub fn has_run(&self, bucket_id: &str) -> Result<bool> {
        Ok(self.state()?.status.contains_key(bucket_id))
    }

    /// Overwrites the status with an error record and remembers the error.
    pub fn record_failure(&self, bucket_id: &str, error: &str) -> Result<()> {
        let mut state = self.state()?;
        state
            .status
            .insert(bucket_id.to_string(), JobStatus::failed(error));
        state
            .errored
            .insert(bucket_id.to_string(), error.to_string());
        Ok(())
    }

    pub fn errored(&self, bucket_id: &str) -> Result<Option<String>> {
        Ok(self.state()?.errored.get(bucket_id).cloned())
    }

    /// Forgets status and error for the bucket; it reads as idle afterwards.
    pub fn reset(&self, bucket_id: &str) -> Result<()> {
        let mut state = self.state()?;
        state.status.remove(bucket_id);
        state.errored.remove(bucket_id);
        Ok(())
    }

    /// Purges the queue and every status and error key.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state()?;
        state.pending.clear();
        state.status.clear();
        state.errored.clear();
        state.executing = None;
        Ok(())
    }
}
