use std::time::Duration;

use crate::common::config::SchedConfig;
use crate::common::error::SchedError;
use crate::common::utils::time::now_epoch;
use crate::scheduler::quota::QuotaLedger;
use crate::store::JobStore;
use crate::store::layout::Location;
use crate::store::record::{EnvSnapshot, JobKind, JobRecord};
use crate::{GpuIndex, Pid};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub lifetime_hours: f64,
    pub num_gpu: u32,
}

/// Access to the job store from the point of view of a single user.
pub struct JobClient {
    store: JobStore,
    user: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl JobClient {
    pub fn new(config: &SchedConfig, user: String) -> crate::Result<Self> {
        let store = JobStore::open(&config.root, config.lock_timeout())?;
        Ok(Self::with_store(
            store,
            user,
            config.poll_interval(),
            config.max_wait(),
        ))
    }

    pub fn with_store(
        store: JobStore,
        user: String,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            store,
            user,
            poll_interval,
            max_wait,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Quota, usage and remaining GPUs of the user.
    pub fn quota_status(&self) -> crate::Result<(Option<f64>, u32, f64)> {
        let ledger = self.ledger()?;
        Ok((
            ledger.quota(&self.user),
            ledger.usage(&self.user),
            ledger.remaining(&self.user),
        ))
    }

    /// Fails with [`SchedError::QuotaExceeded`] if `num_gpu` more GPUs would not fit into
    /// the quota right now. The scheduler checks the quota again before assigning GPUs.
    pub fn check_quota(&self, num_gpu: u32) -> crate::Result<()> {
        let ledger = self.ledger()?;
        if ledger.admit(&self.user, num_gpu) {
            Ok(())
        } else {
            Err(SchedError::QuotaExceeded {
                used: ledger.usage(&self.user),
                requested: num_gpu,
                quota: ledger.quota(&self.user).unwrap_or(0.0),
            })
        }
    }

    fn ledger(&self) -> crate::Result<QuotaLedger> {
        self.store.with_lock(|guard| {
            let slots = guard.read_slots()?;
            let mut ledger = QuotaLedger::from_slots(&slots);
            if let Some(quota) = guard.read_quota(&self.user)? {
                ledger.set_quota(&self.user, quota);
            }
            Ok(ledger)
        })
    }

    /// Puts a new job into the inbox of the user. `pid` identifies the submitting process.
    pub fn submit(
        &self,
        request: SubmitRequest,
        pid: Pid,
        env: &EnvSnapshot,
    ) -> crate::Result<JobRecord> {
        let record = JobRecord::new(
            now_epoch(),
            &self.user,
            pid,
            request.kind,
            request.lifetime_hours,
            request.num_gpu,
        )?;
        self.store.with_lock(|guard| {
            guard.create(&Location::Inbox(self.user.clone()), &record, env)
        })?;
        log::debug!("Job {} submitted", record.id());
        Ok(record)
    }

    /// GPUs whose slots contain the job. Fails with [`SchedError::NotFound`] when the job is
    /// neither assigned nor waiting, e.g. because the scheduler removed it.
    pub fn assigned_gpus(&self, record: &JobRecord) -> crate::Result<Vec<GpuIndex>> {
        let id = record.id();
        self.store.with_lock(|guard| {
            let mut gpus = Vec::new();
            for gpu in guard.slots()? {
                if guard.contains(&Location::Slot(gpu), id) {
                    gpus.push(gpu);
                }
            }
            if gpus.is_empty()
                && !guard.contains(&Location::Inbox(self.user.clone()), id)
                && !guard.contains(&Location::Pending, id)
            {
                return Err(SchedError::NotFound(id.to_string()));
            }
            Ok(gpus)
        })
    }

    /// Polls the store until all GPUs of the job are assigned or the maximum wait expires.
    pub async fn wait_for_gpus(&self, record: &JobRecord) -> crate::Result<Vec<GpuIndex>> {
        let poll = async {
            loop {
                let gpus = self.assigned_gpus(record)?;
                if gpus.len() >= record.num_gpu() as usize {
                    return Ok(gpus);
                }
                log::debug!(
                    "Waiting for {} GPU(s), {} assigned",
                    record.num_gpu(),
                    gpus.len()
                );
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.max_wait, poll).await {
            Ok(result) => result,
            Err(_) => Err(SchedError::ClientTimeout {
                waited_secs: self.max_wait.as_secs(),
            }),
        }
    }
}
