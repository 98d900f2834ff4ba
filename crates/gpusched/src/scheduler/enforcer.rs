//! Enforcement sweeps run by the daemon before every allocation pass.
//!
//! * validity sweep: removes inbox and pending records that cannot be scheduled
//! * expiry sweep: terminates and removes jobs whose lifetime ended or whose process died
//! * intruder sweep: kills GPU processes that do not belong to any assigned job
//!
//! Sweeps that signal processes never hold the store lock while signaling or waiting.

use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use crate::common::error::SchedError;
use crate::scheduler::allocator::format_gpus;
use crate::scheduler::probe::GpuProbe;
use crate::scheduler::process::ProcessControl;
use crate::store::layout::Location;
use crate::store::record::{JobId, JobRecord};
use crate::store::{JobStore, RecordEntry, StoreGuard};
use crate::{GpuIndex, Map, Pid, Set};

const TERMINATION_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    LifetimeExceeded,
    ProcessVanished,
}

impl Display for EvictionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::LifetimeExceeded => f.write_str("lifetime exceeded"),
            EvictionReason::ProcessVanished => f.write_str("process vanished"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub job: JobId,
    pub gpus: Vec<GpuIndex>,
    pub reason: EvictionReason,
}

/// A record removed from the store because it could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct Quarantine {
    pub location: Location,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntruderKill {
    pub gpu: GpuIndex,
    pub pid: Pid,
}

#[derive(Debug, Default)]
pub struct SweepResult {
    /// Records that passed validation, ordered by name.
    pub valid: Vec<JobRecord>,
    pub quarantined: Vec<Quarantine>,
}

/// Validates all records of an inbox or of the pending queue and deletes invalid ones.
///
/// A record is invalid when its name or body cannot be decoded, its environment snapshot
/// is missing, it sits in the inbox of another user, it has already been assigned, or it
/// is an interactive job whose submitting process is gone.
pub fn sweep_location(
    guard: &StoreGuard<'_>,
    location: &Location,
    procs: &dyn ProcessControl,
) -> crate::Result<SweepResult> {
    let mut result = SweepResult::default();
    for entry in guard.list_entries(location)? {
        let id = match entry {
            RecordEntry::Job(id) => id,
            RecordEntry::Malformed { stem, reason } => {
                quarantine(guard, location, &stem, reason, &mut result.quarantined)?;
                continue;
            }
        };
        match check_record(guard, location, &id, procs) {
            Ok(record) => result.valid.push(record),
            Err(SchedError::NotFound(_)) => {}
            Err(error) => {
                let reason = match error {
                    SchedError::MalformedRecord { reason, .. } => reason,
                    error => error.to_string(),
                };
                quarantine(guard, location, id.name(), reason, &mut result.quarantined)?;
            }
        }
    }
    Ok(result)
}

fn check_record(
    guard: &StoreGuard<'_>,
    location: &Location,
    id: &JobId,
    procs: &dyn ProcessControl,
) -> crate::Result<JobRecord> {
    let record = guard.read(location, id)?;
    guard.read_env(location, id)?;
    if let Location::Inbox(user) = location {
        if id.user() != user {
            return Err(SchedError::malformed(
                id.name(),
                format!("submitted into the inbox of {user}"),
            ));
        }
    }
    if record.is_assigned() {
        return Err(SchedError::malformed(
            id.name(),
            "waiting job has assignment times",
        ));
    }
    if record.is_interactive() && !procs.is_alive(id.pid()) {
        return Err(SchedError::ProcessVanished(id.pid()));
    }
    Ok(record)
}

fn quarantine(
    guard: &StoreGuard<'_>,
    location: &Location,
    name: &str,
    reason: String,
    quarantined: &mut Vec<Quarantine>,
) -> crate::Result<()> {
    log::warn!("Removing invalid record {name} from {location}: {reason}");
    guard.delete_stem(location, name)?;
    quarantined.push(Quarantine {
        location: location.clone(),
        name: name.to_string(),
        reason,
    });
    Ok(())
}

/// Job found in the GPU slots that has to be evicted.
#[derive(Debug, Clone)]
struct ExpiredJob {
    id: JobId,
    gpus: Vec<GpuIndex>,
    owner: Option<Pid>,
    reason: EvictionReason,
}

/// Terminates and removes jobs whose lifetime has ended or whose owning process has died.
///
/// Records in the slots that cannot be decoded are removed as well and returned as
/// quarantined.
pub async fn expiry_sweep(
    store: &JobStore,
    procs: &dyn ProcessControl,
    grace_period: Duration,
    now: f64,
) -> crate::Result<(Vec<Eviction>, Vec<Quarantine>)> {
    let (expired, quarantined) = store.with_lock(|guard| find_expired(guard, procs, now))?;
    if expired.is_empty() {
        return Ok((Vec::new(), quarantined));
    }

    for job in &expired {
        log::info!(
            "Evicting job {} from GPU(s) {}: {}",
            job.id,
            format_gpus(&job.gpus),
            job.reason
        );
        if let Some(pid) = job.owner {
            terminate_tree(procs, pid, grace_period).await;
        }
    }

    store.with_lock(|guard| {
        let mut evictions = Vec::with_capacity(expired.len());
        for job in expired {
            for gpu in &job.gpus {
                guard.delete(&Location::Slot(*gpu), &job.id)?;
            }
            evictions.push(Eviction {
                job: job.id,
                gpus: job.gpus,
                reason: job.reason,
            });
        }
        Ok((evictions, quarantined))
    })
}

fn find_expired(
    guard: &StoreGuard<'_>,
    procs: &dyn ProcessControl,
    now: f64,
) -> crate::Result<(Vec<ExpiredJob>, Vec<Quarantine>)> {
    let slots = guard.read_slots()?;
    let mut quarantined = Vec::new();
    for (location, name, reason) in &slots.broken {
        quarantine(guard, location, name, reason.clone(), &mut quarantined)?;
    }

    let mut expired = Vec::new();
    for (id, (record, gpus)) in slots.jobs() {
        if !record.is_assigned() {
            for gpu in &gpus {
                quarantine(
                    guard,
                    &Location::Slot(*gpu),
                    id.name(),
                    "record without assignment times".to_string(),
                    &mut quarantined,
                )?;
            }
            continue;
        }
        let owner = record.owner_pid();
        let reason = if record.is_expired(now) {
            EvictionReason::LifetimeExceeded
        } else if record.is_awaiting_launch() && gpus.len() >= record.num_gpu() as usize {
            // Started by the launch pass of the same cycle
            continue;
        } else if !owner.is_some_and(|pid| procs.is_alive(pid)) {
            EvictionReason::ProcessVanished
        } else {
            continue;
        };
        expired.push(ExpiredJob {
            id,
            gpus,
            owner,
            reason,
        });
    }
    Ok((expired, quarantined))
}

/// Sends SIGTERM to `pid` and all its descendants, waits up to `grace_period` for them
/// to exit and kills the survivors with SIGKILL.
pub async fn terminate_tree(procs: &dyn ProcessControl, pid: Pid, grace_period: Duration) {
    let mut targets = vec![pid];
    match procs.snapshot() {
        Ok(table) => targets.extend(table.descendants(pid)),
        Err(error) => log::error!("Cannot list descendants of process {pid}: {error}"),
    }
    targets.retain(|pid| procs.is_alive(*pid));
    if targets.is_empty() {
        return;
    }

    log::debug!("Sending SIGTERM to {targets:?}");
    for target in &targets {
        if let Err(error) = procs.signal(*target, Signal::SIGTERM) {
            log::error!("{error}");
        }
    }

    let deadline = Instant::now() + grace_period;
    loop {
        targets.retain(|pid| procs.is_alive(*pid));
        if targets.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(TERMINATION_CHECK_INTERVAL).await;
    }

    log::debug!("Process(es) {targets:?} did not exit after SIGTERM, sending SIGKILL");
    for target in &targets {
        if let Err(error) = procs.signal(*target, Signal::SIGKILL) {
            log::error!("{error}");
        }
    }
}

/// Kills every process resident on a GPU that is not the owning process of a job
/// assigned to that GPU, or one of its descendants.
///
/// Only devices that have a slot in the store are inspected.
pub fn intruder_sweep(
    store: &JobStore,
    procs: &dyn ProcessControl,
    probe: &dyn GpuProbe,
) -> crate::Result<Vec<IntruderKill>> {
    // Every resident process exists before the snapshot is taken, so its ancestry is known
    let resident = probe.resident_processes()?;
    if resident.values().all(|pids| pids.is_empty()) {
        return Ok(Vec::new());
    }
    let table = procs.snapshot()?;

    let owners: Map<GpuIndex, Vec<Pid>> = store.with_lock(|guard| {
        let slots = guard.read_slots()?;
        Ok(slots
            .slots
            .into_iter()
            .map(|(gpu, records)| {
                (
                    gpu,
                    records.iter().filter_map(|r| r.owner_pid()).collect(),
                )
            })
            .collect())
    })?;

    let mut kills = Vec::new();
    for (gpu, pids) in resident {
        let Some(gpu_owners) = owners.get(&gpu) else {
            log::debug!("GPU {gpu} is not managed by the scheduler");
            continue;
        };
        let authorized: Set<Pid> = gpu_owners
            .iter()
            .flat_map(|owner| std::iter::once(*owner).chain(table.descendants(*owner)))
            .collect();
        for pid in pids {
            if authorized.contains(&pid) {
                continue;
            }
            log::warn!("{}, killing it", SchedError::IntruderDetected { gpu, pid });
            match procs.signal(pid, Signal::SIGKILL) {
                Ok(()) => kills.push(IntruderKill { gpu, pid }),
                Err(error) => log::error!("{error}"),
            }
        }
    }
    Ok(kills)
}
