use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;

use crate::common::config::SchedConfig;
use crate::common::error::SchedError;
use crate::common::utils::time::now_epoch;
use crate::scheduler::allocator::{
    Assignment, GpuPicker, RandomPicker, SkipReason, apply_plan, format_gpus, plan_allocation,
};
use crate::scheduler::enforcer::{
    Eviction, IntruderKill, Quarantine, expiry_sweep, intruder_sweep, sweep_location,
    terminate_tree,
};
use crate::scheduler::launcher::{LaunchRequest, Launcher, UserLauncher};
use crate::scheduler::probe::{GpuProbe, create_probe};
use crate::scheduler::process::{ProcessControl, SystemProcesses};
use crate::scheduler::quota::QuotaLedger;
use crate::store::layout::Location;
use crate::store::record::{JobId, JobRecord};
use crate::store::{JobStore, StoreGuard};
use crate::{GpuIndex, Map, Pid};

/// What happened during one scheduling cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Jobs moved from an inbox into the pending queue.
    pub ingested: Vec<JobId>,
    pub quarantined: Vec<Quarantine>,
    /// Stale copies left behind by an interrupted relocation.
    pub duplicates: Vec<(Location, JobId)>,
    /// Slot copies of jobs whose assignment was interrupted, removed so that the job
    /// is assigned again from the pending queue.
    pub incomplete: Vec<(JobId, Vec<GpuIndex>)>,
    pub evictions: Vec<Eviction>,
    pub intruders: Vec<IntruderKill>,
    pub assigned: Vec<(JobId, Vec<GpuIndex>)>,
    pub launched: Vec<(JobId, Pid)>,
    pub skipped: Vec<(JobId, SkipReason)>,
}

impl CycleReport {
    fn is_quiet(&self) -> bool {
        self.ingested.is_empty()
            && self.quarantined.is_empty()
            && self.duplicates.is_empty()
            && self.incomplete.is_empty()
            && self.evictions.is_empty()
            && self.intruders.is_empty()
            && self.assigned.is_empty()
    }
}

pub struct SchedulerDaemon {
    config: SchedConfig,
    store: JobStore,
    procs: Box<dyn ProcessControl>,
    probe: Box<dyn GpuProbe>,
    launcher: Box<dyn Launcher>,
    picker: Box<dyn GpuPicker>,
}

impl SchedulerDaemon {
    pub fn new(
        config: SchedConfig,
        store: JobStore,
        procs: Box<dyn ProcessControl>,
        probe: Box<dyn GpuProbe>,
        launcher: Box<dyn Launcher>,
        picker: Box<dyn GpuPicker>,
    ) -> Self {
        Self {
            config,
            store,
            procs,
            probe,
            launcher,
            picker,
        }
    }

    /// Daemon working with the real processes and devices of this machine.
    pub fn from_config(config: SchedConfig) -> crate::Result<Self> {
        let store = JobStore::open(&config.root, config.lock_timeout())?;
        let probe = create_probe(config.gpu_probe);
        Ok(Self::new(
            config,
            store,
            Box::new(SystemProcesses),
            probe,
            Box::new(UserLauncher::default()),
            Box::new(RandomPicker::new()),
        ))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Runs scheduling cycles until SIGINT or SIGTERM is received.
    ///
    /// A cycle that fails is logged and the next one starts on the next tick.
    pub async fn run(mut self) -> crate::Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interval = tokio::time::interval(self.config.cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Scheduler started (store {}, cycle every {}s)",
            self.config.root.display(),
            self.config.cycle_secs
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = interrupt.recv() => {
                    log::info!("Received SIGINT, stopping the scheduler");
                    break;
                }
                _ = terminate.recv() => {
                    log::info!("Received SIGTERM, stopping the scheduler");
                    break;
                }
            }
            match self.run_cycle().await {
                Ok(report) if report.is_quiet() => {}
                Ok(report) => log::debug!("Cycle finished: {report:?}"),
                Err(SchedError::StoreUnavailable(message)) => {
                    log::warn!("Job store is unavailable, skipping cycle: {message}");
                }
                Err(error) => log::error!("Scheduling cycle failed: {error}"),
            }
        }
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> crate::Result<CycleReport> {
        self.run_cycle_at(now_epoch()).await
    }

    /// Runs a single cycle as if the current time was `now`:
    /// ingest and validate, evict, kill intruders, allocate and launch.
    pub async fn run_cycle_at(&mut self, now: f64) -> crate::Result<CycleReport> {
        let mut report = CycleReport::default();
        self.launcher.reap();

        let procs = self.procs.as_ref();
        self.store.with_lock(|guard| ingest(guard, procs, &mut report))?;

        let (evictions, quarantined) =
            expiry_sweep(&self.store, procs, self.config.grace_period(), now).await?;
        report.evictions = evictions;
        report.quarantined.extend(quarantined);

        match intruder_sweep(&self.store, procs, self.probe.as_ref()) {
            Ok(kills) => report.intruders = kills,
            Err(error @ SchedError::StoreUnavailable(_)) => return Err(error),
            Err(error) => log::error!("Intruder sweep failed: {error}"),
        }

        let assignments = self.allocate(now, &mut report)?;
        report.assigned = assignments
            .iter()
            .map(|a| (a.record.id().clone(), a.gpus.clone()))
            .collect();

        for assignment in self.awaiting_launch()? {
            let id = assignment.record.id().clone();
            match self.launch(assignment).await {
                Ok(Some(launched)) => report.launched.push(launched),
                Ok(None) => {}
                Err(error) => log::error!("Cannot launch job {id}, retrying next cycle: {error}"),
            }
        }
        Ok(report)
    }

    fn allocate(&mut self, now: f64, report: &mut CycleReport) -> crate::Result<Vec<Assignment>> {
        let picker = self.picker.as_mut();
        self.store.with_lock(|guard| {
            let slots = guard.read_slots()?;
            for (gpu, jobs) in slots.shared_slots() {
                let names: Vec<String> = jobs.iter().map(|id| id.to_string()).collect();
                log::error!("GPU {gpu} is shared by jobs {}", names.join(", "));
            }
            let mut ledger = QuotaLedger::load(guard, &slots)?;

            let mut pending = Vec::new();
            for id in guard.list(&Location::Pending)? {
                match guard.read(&Location::Pending, &id) {
                    Ok(record) => pending.push(record),
                    Err(error) => log::warn!("Skipping pending job {id}: {error}"),
                }
            }

            let mut plan = plan_allocation(
                &pending,
                &slots.free_gpus(),
                slots.total_gpus(),
                &mut ledger,
                picker,
                now,
            );
            for (id, reason) in &plan.skipped {
                match reason {
                    SkipReason::Refused(error @ SchedError::ImpossibleRequest { .. }) => {
                        log::warn!("Job {id} can never run: {error}")
                    }
                    SkipReason::Refused(error) => log::info!("Job {id} stays queued: {error}"),
                    SkipReason::Blocked { behind } => {
                        log::debug!("Job {id} waits behind job {behind}")
                    }
                }
            }
            report.skipped = std::mem::take(&mut plan.skipped);
            Ok(apply_plan(guard, plan))
        })
    }

    /// Batch jobs that hold all their GPUs and whose command has not been started yet.
    fn awaiting_launch(&self) -> crate::Result<Vec<Assignment>> {
        self.store.with_lock(|guard| {
            Ok(guard
                .read_slots()?
                .jobs()
                .into_values()
                .filter(|(record, gpus)| {
                    record.is_awaiting_launch() && gpus.len() >= record.num_gpu() as usize
                })
                .map(|(record, gpus)| Assignment { record, gpus })
                .collect())
        })
    }

    /// Starts an assigned batch job and records its PID in the slots.
    ///
    /// A job that cannot be started is removed from its slots. If the PID cannot be
    /// recorded, the started process is terminated and the job stays awaiting launch.
    async fn launch(&mut self, assignment: Assignment) -> crate::Result<Option<(JobId, Pid)>> {
        let Assignment { mut record, gpus } = assignment;
        let id = record.id().clone();
        let Some(first_gpu) = gpus.first() else {
            return Ok(None);
        };
        let env = match self
            .store
            .with_lock(|guard| guard.read_env(&Location::Slot(*first_gpu), &id))
        {
            Ok(env) => env,
            Err(error @ SchedError::MalformedRecord { .. }) => {
                log::error!("Cannot launch job {id}: {error}");
                self.release(&id, &gpus)?;
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        let request = LaunchRequest {
            job: &record,
            env: &env,
            gpus: &gpus,
            visibility_var: &self.config.visibility_var,
        };
        let pid = match self.launcher.launch(&request) {
            Ok(pid) => pid,
            Err(error) => {
                log::error!(
                    "Cannot launch job {id} on GPU(s) {}: {error}",
                    format_gpus(&gpus)
                );
                self.release(&id, &gpus)?;
                return Ok(None);
            }
        };

        record.set_run_pid(pid);
        if let Err(error) = self
            .store
            .with_lock(|guard| write_slots(guard, &record, &gpus))
        {
            log::error!("Cannot record process {pid} of job {id}, terminating it: {error}");
            terminate_tree(self.procs.as_ref(), pid, self.config.grace_period()).await;
            return Err(error);
        }
        Ok(Some((id, pid)))
    }

    fn release(&self, id: &JobId, gpus: &[GpuIndex]) -> crate::Result<()> {
        self.store.with_lock(|guard| {
            for gpu in gpus {
                guard.delete(&Location::Slot(*gpu), id)?;
            }
            Ok(())
        })
    }
}

fn write_slots(
    guard: &StoreGuard<'_>,
    record: &JobRecord,
    gpus: &[GpuIndex],
) -> crate::Result<()> {
    for gpu in gpus {
        guard.write(&Location::Slot(*gpu), record)?;
    }
    Ok(())
}

/// Validates inboxes and moves their valid jobs into the pending queue, then validates
/// the pending queue. Copies left behind by an interrupted relocation are removed.
///
/// A waiting job that also sits in fewer slots than it requested was being assigned when
/// the daemon stopped. Its slot copies are removed and the waiting copy is kept.
fn ingest(
    guard: &StoreGuard<'_>,
    procs: &dyn ProcessControl,
    report: &mut CycleReport,
) -> crate::Result<()> {
    let mut assigned: Map<JobId, Vec<GpuIndex>> = guard
        .read_slots()?
        .jobs()
        .into_iter()
        .map(|(id, (_, gpus))| (id, gpus))
        .collect();

    for user in guard.users()? {
        let inbox = Location::Inbox(user);
        let sweep = match sweep_location(guard, &inbox, procs) {
            Ok(sweep) => sweep,
            Err(error) => {
                log::error!("Cannot process {inbox}: {error}");
                continue;
            }
        };
        report.quarantined.extend(sweep.quarantined);
        for record in sweep.valid {
            let id = record.id();
            if guard.contains(&Location::Pending, id) || is_fully_assigned(&assigned, &record) {
                remove_duplicate(guard, &inbox, id, report)?;
                continue;
            }
            if let Some(gpus) = assigned.remove(id) {
                remove_incomplete(guard, id, gpus, report)?;
            }
            match guard.relocate(&inbox, &Location::Pending, &record) {
                Ok(()) => {
                    log::info!(
                        "Job {id} queued: {} GPU(s) for {}h",
                        record.num_gpu(),
                        record.lifetime_hours()
                    );
                    report.ingested.push(id.clone());
                }
                Err(error) => log::error!("Cannot queue job {id}: {error}"),
            }
        }
    }

    let sweep = sweep_location(guard, &Location::Pending, procs)?;
    report.quarantined.extend(sweep.quarantined);
    for record in sweep.valid {
        let id = record.id();
        if is_fully_assigned(&assigned, &record) {
            remove_duplicate(guard, &Location::Pending, id, report)?;
        } else if let Some(gpus) = assigned.remove(id) {
            remove_incomplete(guard, id, gpus, report)?;
        }
    }
    Ok(())
}

fn is_fully_assigned(assigned: &Map<JobId, Vec<GpuIndex>>, record: &JobRecord) -> bool {
    assigned
        .get(record.id())
        .is_some_and(|gpus| gpus.len() >= record.num_gpu() as usize)
}

fn remove_incomplete(
    guard: &StoreGuard<'_>,
    id: &JobId,
    gpus: Vec<GpuIndex>,
    report: &mut CycleReport,
) -> crate::Result<()> {
    log::warn!(
        "Job {id} is only partially assigned to GPU(s) {}, returning it to the queue",
        format_gpus(&gpus)
    );
    for gpu in &gpus {
        guard.delete(&Location::Slot(*gpu), id)?;
    }
    report.incomplete.push((id.clone(), gpus));
    Ok(())
}

fn remove_duplicate(
    guard: &StoreGuard<'_>,
    location: &Location,
    id: &JobId,
    report: &mut CycleReport,
) -> crate::Result<()> {
    log::warn!("Removing stale copy of job {id} from {location}");
    guard.delete(location, id)?;
    report.duplicates.push((location.clone(), id.clone()));
    Ok(())
}
