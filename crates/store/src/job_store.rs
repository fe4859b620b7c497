//! Persistence of the active job snapshot.
//!
//! One record per node identity (`last_training__<node id>.json`), so a
//! restarted node only ever resumes its own last job.

use loopnode_core::job::Job;
use uuid::Uuid;

use crate::{RecordStore, StoreError};

/// Key prefix of the persisted job snapshot.
const JOB_KEY_PREFIX: &str = "last_training__";

/// Load/save/delete of the current [`Job`] for one node.
#[derive(Debug, Clone)]
pub struct JobStore {
    records: RecordStore,
    key: String,
}

impl JobStore {
    pub fn new(records: RecordStore, node_id: Uuid) -> Self {
        Self {
            records,
            key: format!("{JOB_KEY_PREFIX}{node_id}"),
        }
    }

    pub async fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.records.save(&self.key, job).await?;
        tracing::debug!(job_id = %job.id, state = %job.state, "Job snapshot persisted");
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<Job>, StoreError> {
        self.records.load(&self.key).await
    }

    pub async fn delete(&self) -> Result<(), StoreError> {
        self.records.delete(&self.key).await
    }

    pub async fn exists(&self) -> bool {
        self.records.exists(&self.key).await
    }
}
