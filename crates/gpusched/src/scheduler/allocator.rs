use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::common::error::SchedError;
use crate::common::utils::str::format_comma_delimited;
use crate::scheduler::quota::QuotaLedger;
use crate::store::StoreGuard;
use crate::store::layout::Location;
use crate::store::record::{JobId, JobRecord};
use crate::{GpuIndex, Set};

/// Chooses which of the free GPUs are given to a job.
pub trait GpuPicker {
    /// Returns `count` distinct members of `free`. `free` has at least `count` items.
    fn pick(&mut self, free: &[GpuIndex], count: usize) -> Vec<GpuIndex>;
}

/// Picks a uniformly random subset of the free GPUs, so that load is spread over devices.
pub struct RandomPicker {
    random: SmallRng,
}

impl RandomPicker {
    pub fn new() -> Self {
        Self {
            random: SmallRng::from_os_rng(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            random: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuPicker for RandomPicker {
    fn pick(&mut self, free: &[GpuIndex], count: usize) -> Vec<GpuIndex> {
        let mut gpus = free.to_vec();
        gpus.shuffle(&mut self.random);
        gpus.truncate(count);
        gpus.sort_unstable();
        gpus
    }
}

#[derive(Debug)]
pub enum SkipReason {
    /// The job cannot be placed now (quota, capacity) or ever (more GPUs than the machine has).
    Refused(SchedError),
    /// An older job of the same class is waiting for free GPUs.
    Blocked { behind: JobId },
}

#[derive(Debug)]
pub struct Assignment {
    /// Record with its start and end times set.
    pub record: JobRecord,
    pub gpus: Vec<GpuIndex>,
}

#[derive(Debug, Default)]
pub struct AllocationPlan {
    pub assignments: Vec<Assignment>,
    pub skipped: Vec<(JobId, SkipReason)>,
}

/// Decides which pending jobs get which GPUs.
///
/// Interactive jobs are served before batch jobs; within each class the oldest job goes
/// first. A job is assigned all of its GPUs or nothing. Once a job of a class does not fit
/// into the remaining free GPUs, younger jobs of the same class wait behind it. `ledger`
/// is charged with every assignment.
pub fn plan_allocation(
    pending: &[JobRecord],
    free: &[GpuIndex],
    total_gpus: usize,
    ledger: &mut QuotaLedger,
    picker: &mut dyn GpuPicker,
    now: f64,
) -> AllocationPlan {
    let mut order: Vec<&JobRecord> = pending.iter().collect();
    order.sort_by(|a, b| {
        b.is_interactive()
            .cmp(&a.is_interactive())
            .then_with(|| a.id().submit_time().total_cmp(&b.id().submit_time()))
            .then_with(|| a.id().cmp(b.id()))
    });

    let mut free: Vec<GpuIndex> = free.to_vec();
    let mut blocked_interactive: Option<JobId> = None;
    let mut blocked_batch: Option<JobId> = None;
    let mut plan = AllocationPlan::default();

    for job in order {
        let id = job.id();
        let blocked = if job.is_interactive() {
            &mut blocked_interactive
        } else {
            &mut blocked_batch
        };
        if let Some(behind) = blocked {
            plan.skipped.push((
                id.clone(),
                SkipReason::Blocked {
                    behind: behind.clone(),
                },
            ));
            continue;
        }

        let requested = job.num_gpu();
        if requested as usize > total_gpus {
            plan.skipped.push((
                id.clone(),
                SkipReason::Refused(SchedError::ImpossibleRequest {
                    requested,
                    total: total_gpus,
                }),
            ));
            continue;
        }
        if !ledger.admit(job.user(), requested) {
            plan.skipped.push((
                id.clone(),
                SkipReason::Refused(SchedError::QuotaExceeded {
                    used: ledger.usage(job.user()),
                    requested,
                    quota: ledger.quota(job.user()).unwrap_or(0.0),
                }),
            ));
            continue;
        }
        if requested as usize > free.len() {
            plan.skipped.push((
                id.clone(),
                SkipReason::Refused(SchedError::InsufficientCapacity {
                    requested,
                    free: free.len(),
                }),
            ));
            *blocked = Some(id.clone());
            continue;
        }

        let mut record = job.clone();
        if let Err(error) = record.assign(now) {
            plan.skipped.push((id.clone(), SkipReason::Refused(error)));
            continue;
        }
        let gpus = picker.pick(&free, requested as usize);
        let picked: Set<GpuIndex> = gpus.iter().copied().collect();
        free.retain(|gpu| !picked.contains(gpu));
        ledger.charge(job.user(), &gpus);
        plan.assignments.push(Assignment { record, gpus });
    }
    plan
}

/// Writes the planned assignments into the store.
///
/// Each job is written into all of its slots before it is removed from the pending queue.
/// If any slot write fails, the slots written so far are cleared and the job stays pending.
/// Returns the assignments that were stored.
pub fn apply_plan(guard: &StoreGuard<'_>, plan: AllocationPlan) -> Vec<Assignment> {
    let mut applied = Vec::with_capacity(plan.assignments.len());
    for assignment in plan.assignments {
        let id = assignment.record.id();
        match write_slots(guard, &assignment) {
            Ok(()) => {
                if let Err(error) = guard.delete(&Location::Pending, id) {
                    // The pending copy becomes a duplicate removed by the next ingest.
                    log::warn!("Cannot remove assigned job {id} from the pending queue: {error}");
                }
                log::info!(
                    "Job {id} assigned to GPU(s) {}",
                    format_gpus(&assignment.gpus)
                );
                applied.push(assignment);
            }
            Err(error) => {
                log::error!("Cannot assign job {id}: {error}");
            }
        }
    }
    applied
}

fn write_slots(guard: &StoreGuard<'_>, assignment: &Assignment) -> crate::Result<()> {
    let id = assignment.record.id();
    for (index, gpu) in assignment.gpus.iter().enumerate() {
        let written = guard.copy_to(&Location::Pending, &Location::Slot(*gpu), &assignment.record);
        if let Err(error) = written {
            for written in &assignment.gpus[..=index] {
                if let Err(error) = guard.delete(&Location::Slot(*written), id) {
                    log::error!("Cannot roll back job {id} from GPU {written}: {error}");
                }
            }
            return Err(error);
        }
    }
    Ok(())
}

/// Formats GPU indices the way the visibility variable expects them (`0,2,3`).
pub fn format_gpus(gpus: &[GpuIndex]) -> String {
    format_comma_delimited(gpus)
}
