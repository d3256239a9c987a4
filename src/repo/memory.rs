//! Process-local job store with transactional semantics.
//!
//! Mirrors what the Postgres store guarantees: selected records stay locked
//! until their transaction finishes and are skipped by other transactions, and
//! serializable transactions fail at commit when a concurrent commit touched a
//! job name they read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use super::{DueJobQuery, IsolationLevel, JobOp, JobRepo};
use crate::{
    JobId,
    entity::{JobName, JobRecord, NewJobRecord},
    error::JobError,
};

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<JobId, JobRecord>,
    locked: HashSet<JobId>,
    version: u64,
    name_versions: HashMap<JobName, u64>,
}

#[derive(Clone, Default)]
pub struct InMemoryJobRepo {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed records ordered by id.
    pub fn all_jobs(&self) -> Vec<JobRecord> {
        let state = self.state.lock().expect("Couldn't lock job store Mutex");
        state.rows.values().cloned().collect()
    }
}

#[async_trait]
impl JobRepo for InMemoryJobRepo {
    type Op = InMemoryJobOp;

    async fn begin_op(&self, isolation: IsolationLevel) -> Result<InMemoryJobOp, JobError> {
        let start_version = self
            .state
            .lock()
            .expect("Couldn't lock job store Mutex")
            .version;
        Ok(InMemoryJobOp {
            state: Arc::clone(&self.state),
            isolation,
            start_version,
            writes: BTreeMap::new(),
            read_names: HashSet::new(),
            locks: HashSet::new(),
            finished: false,
        })
    }
}

enum Write {
    Upsert(JobRecord),
    Delete(JobName),
}

pub struct InMemoryJobOp {
    state: Arc<Mutex<StoreState>>,
    isolation: IsolationLevel,
    start_version: u64,
    writes: BTreeMap<JobId, Write>,
    read_names: HashSet<JobName>,
    locks: HashSet<JobId>,
    finished: bool,
}

impl InMemoryJobOp {
    // Committed rows overlaid with this transaction's own writes.
    fn visible_rows(&self, state: &StoreState) -> Vec<JobRecord> {
        let mut rows: BTreeMap<JobId, JobRecord> = state.rows.clone();
        for (id, write) in &self.writes {
            match write {
                Write::Upsert(job) => {
                    rows.insert(*id, job.clone());
                }
                Write::Delete(_) => {
                    rows.remove(id);
                }
            }
        }
        rows.into_values().collect()
    }

    fn release_locks(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("Couldn't lock job store Mutex");
        for id in self.locks.drain() {
            state.locked.remove(&id);
        }
    }
}

#[async_trait]
impl JobOp for InMemoryJobOp {
    async fn find_due_job(&mut self, query: &DueJobQuery) -> Result<Option<JobRecord>, JobError> {
        let mut state = self.state.lock().expect("Couldn't lock job store Mutex");
        let mut candidates: Vec<JobRecord> = self
            .visible_rows(&state)
            .into_iter()
            .filter(|job| query.job_types.contains(&job.job_type))
            .filter(JobRecord::is_eligible)
            .filter(|job| query.due_at.is_none_or(|due_at| job.execution_time() <= due_at))
            .filter(|job| !state.locked.contains(&job.id) || self.locks.contains(&job.id))
            .collect();
        candidates.sort_by_key(|job| (job.execution_time(), job.id));
        let Some(job) = candidates.into_iter().next() else {
            return Ok(None);
        };
        state.locked.insert(job.id);
        drop(state);
        self.locks.insert(job.id);
        self.read_names.insert(job.job_name.clone());
        Ok(Some(job))
    }

    async fn find_existing_schedule(
        &mut self,
        job_name: &JobName,
        execution_time: Option<DateTime<Utc>>,
    ) -> Result<Option<JobRecord>, JobError> {
        let state = self.state.lock().expect("Couldn't lock job store Mutex");
        let existing = self.visible_rows(&state).into_iter().find(|job| {
            &job.job_name == job_name
                && execution_time.is_none_or(|time| job.execution_time() == time)
        });
        drop(state);
        self.read_names.insert(job_name.clone());
        Ok(existing)
    }

    async fn find_pending_schedule(
        &mut self,
        job_name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, JobError> {
        let state = self.state.lock().expect("Couldn't lock job store Mutex");
        let pending = self
            .visible_rows(&state)
            .into_iter()
            .filter(|job| {
                &job.job_name == job_name && !job.succeeded() && job.execution_time() > now
            })
            .min_by_key(|job| (job.execution_time(), job.id));
        drop(state);
        self.read_names.insert(job_name.clone());
        Ok(pending)
    }

    async fn find_by_id(&mut self, id: JobId) -> Result<Option<JobRecord>, JobError> {
        let state = self.state.lock().expect("Couldn't lock job store Mutex");
        Ok(self.visible_rows(&state).into_iter().find(|job| job.id == id))
    }

    async fn list_by_name(&mut self, job_name: &JobName) -> Result<Vec<JobRecord>, JobError> {
        let state = self.state.lock().expect("Couldn't lock job store Mutex");
        let jobs = self
            .visible_rows(&state)
            .into_iter()
            .filter(|job| &job.job_name == job_name)
            .collect();
        drop(state);
        self.read_names.insert(job_name.clone());
        Ok(jobs)
    }

    async fn insert(&mut self, new_job: NewJobRecord) -> Result<JobRecord, JobError> {
        let job = JobRecord::from(new_job);
        self.writes.insert(job.id, Write::Upsert(job.clone()));
        Ok(job)
    }

    async fn update(&mut self, job: &JobRecord) -> Result<(), JobError> {
        if self.find_by_id(job.id).await?.is_none() {
            return Err(JobError::RecordNotFound(job.id));
        }
        self.writes.insert(job.id, Write::Upsert(job.clone()));
        Ok(())
    }

    async fn delete(&mut self, id: JobId) -> Result<bool, JobError> {
        let Some(job) = self.find_by_id(id).await? else {
            return Ok(false);
        };
        self.writes.insert(id, Write::Delete(job.job_name));
        Ok(true)
    }

    async fn delete_records_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        let state = self.state.lock().expect("Couldn't lock job store Mutex");
        let expired: Vec<JobRecord> = self
            .visible_rows(&state)
            .into_iter()
            .filter(|job| !job.is_eligible() && job.execution_time() < cutoff)
            .collect();
        drop(state);
        let count = expired.len() as u64;
        for job in expired {
            self.writes.insert(job.id, Write::Delete(job.job_name));
        }
        Ok(count)
    }

    async fn commit(mut self) -> Result<(), JobError> {
        let writes = std::mem::take(&mut self.writes);
        {
            let mut state = self.state.lock().expect("Couldn't lock job store Mutex");
            if self.isolation == IsolationLevel::Serializable && !writes.is_empty() {
                let conflicted = self.read_names.iter().any(|name| {
                    state
                        .name_versions
                        .get(name)
                        .is_some_and(|version| *version > self.start_version)
                });
                if conflicted {
                    drop(state);
                    self.finished = true;
                    self.release_locks();
                    return Err(JobError::SerializationConflict);
                }
            }
            if !writes.is_empty() {
                state.version += 1;
                let version = state.version;
                for (id, write) in writes {
                    match write {
                        Write::Upsert(job) => {
                            state.name_versions.insert(job.job_name.clone(), version);
                            state.rows.insert(id, job);
                        }
                        Write::Delete(job_name) => {
                            state.name_versions.insert(job_name, version);
                            state.rows.remove(&id);
                        }
                    }
                }
            }
        }
        self.finished = true;
        self.release_locks();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), JobError> {
        self.finished = true;
        self.writes.clear();
        self.release_locks();
        Ok(())
    }
}

impl Drop for InMemoryJobOp {
    fn drop(&mut self) {
        if !self.finished {
            self.release_locks();
        }
    }
}
