//! Typed dispatch queue between the scheduler and workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use armada_state::{JobId, JobRecord, MessageId, QueueBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Everything a worker needs to run a reserved job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDispatch {
    pub job_id: JobId,
    pub cpus: u32,
    pub script: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<Duration>,
}

impl JobDispatch {
    pub fn from_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            cpus: job.spec.cpus_required,
            script: job.spec.script.clone(),
            environment: job.spec.environment.clone(),
            time_limit: job.spec.time_limit,
        }
    }
}

/// JSON-encoded [`JobDispatch`] messages on a named queue.
#[derive(Clone)]
pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
    name: String,
    visibility_timeout: Duration,
}

impl WorkQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, dispatch: &JobDispatch) -> Result<MessageId> {
        let payload = serde_json::to_vec(dispatch)?;
        let id = self.backend.publish(&self.name, &payload).await?;
        debug!(job_id = %dispatch.job_id, message_id = %id, "dispatch published");
        Ok(id)
    }

    /// Take the next dispatch off the queue.
    ///
    /// The message is acknowledged before it is returned, so each dispatch is
    /// handed out at most once. Undecodable messages are dropped.
    pub async fn take(&self) -> Result<Option<JobDispatch>> {
        let Some(message) = self
            .backend
            .receive(&self.name, self.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };

        self.backend.ack(&self.name, &message.id).await?;

        match serde_json::from_slice(&message.payload) {
            Ok(dispatch) => Ok(Some(dispatch)),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "dropping undecodable dispatch");
                Ok(None)
            }
        }
    }

    /// Dispatches waiting to be taken.
    pub async fn depth(&self) -> Result<usize> {
        Ok(self.backend.depth(&self.name).await?)
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
