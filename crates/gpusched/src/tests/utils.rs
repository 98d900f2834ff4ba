use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tempfile::TempDir;

use crate::common::config::{ProbeKind, SchedConfig};
use crate::scheduler::allocator::{GpuPicker, format_gpus};
use crate::scheduler::daemon::SchedulerDaemon;
use crate::scheduler::launcher::{LaunchRequest, Launcher};
use crate::scheduler::probe::GpuProbe;
use crate::scheduler::process::{ProcessControl, ProcessTable};
use crate::store::JobStore;
use crate::store::layout::Location;
use crate::store::record::{EnvSnapshot, JobId, JobKind, JobRecord};
use crate::{GpuIndex, Map, Pid};

/// Time at which [`assigned`] marks jobs as assigned.
pub const ASSIGN_TIME: f64 = 1000.0;

/// Job store in a temporary directory, removed on drop.
pub struct TestStore {
    pub store: JobStore,
    dir: TempDir,
}

impl TestStore {
    pub fn new(gpu_count: u32) -> Self {
        let dir = TempDir::with_prefix("gpusched").unwrap();
        let store = JobStore::init(dir.path(), gpu_count, Duration::from_secs(5)).unwrap();
        Self { store, dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Creates the inbox and the quota file of `user`.
    pub fn add_user(&self, user: &str, quota: f64) {
        let inbox = self.root().join("addqueue");
        std::fs::create_dir_all(inbox.join(user)).unwrap();
        std::fs::write(inbox.join(format!("{user}.quota")), format!("{quota}\n")).unwrap();
    }

    /// Stores `record` with an empty environment.
    pub fn put(&self, location: &Location, record: &JobRecord) {
        self.store
            .with_lock(|guard| {
                guard.write_env(location, record.id(), &EnvSnapshot::default())?;
                guard.write(location, record)
            })
            .unwrap();
    }
}

/// Interactive job submitted by process `pid` at time `pid`, for one hour.
pub fn interactive_job(user: &str, pid: Pid, num_gpu: u32) -> JobRecord {
    JobRecord::new(pid as f64, user, pid, JobKind::Interactive, 1.0, num_gpu).unwrap()
}

/// Batch job submitted by process `pid` at time `pid`, for one hour.
pub fn batch_job(user: &str, pid: Pid, num_gpu: u32, command: &str) -> JobRecord {
    let kind = JobKind::Batch {
        command: command.to_string(),
    };
    JobRecord::new(pid as f64, user, pid, kind, 1.0, num_gpu).unwrap()
}

pub fn assigned(record: JobRecord) -> JobRecord {
    assigned_at(record, ASSIGN_TIME)
}

pub fn assigned_at(mut record: JobRecord, time: f64) -> JobRecord {
    record.assign(time).unwrap();
    record
}

pub fn env_with(vars: &[(&str, &str)]) -> EnvSnapshot {
    vars.iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Always picks the lowest free GPUs.
pub struct FirstPicker;

impl GpuPicker for FirstPicker {
    fn pick(&mut self, free: &[GpuIndex], count: usize) -> Vec<GpuIndex> {
        free[..count].to_vec()
    }
}

struct MockProcess {
    parent: Option<Pid>,
    running: bool,
    ignore_sigterm: bool,
}

#[derive(Default)]
struct ProcessState {
    processes: Map<Pid, MockProcess>,
    signals: Map<Pid, Vec<Signal>>,
}

/// Simulated process table. Clones share the same state.
#[derive(Clone, Default)]
pub struct MockProcesses {
    state: Rc<RefCell<ProcessState>>,
}

impl MockProcesses {
    pub fn spawn(&self, pid: Pid, parent: Option<Pid>) {
        self.state.borrow_mut().processes.insert(
            pid,
            MockProcess {
                parent,
                running: true,
                ignore_sigterm: false,
            },
        );
    }

    pub fn ignore_sigterm(&self, pid: Pid) {
        if let Some(process) = self.state.borrow_mut().processes.get_mut(&pid) {
            process.ignore_sigterm = true;
        }
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .is_some_and(|p| p.running)
    }

    pub fn received(&self, pid: Pid) -> Vec<Signal> {
        self.state
            .borrow()
            .signals
            .get(&pid)
            .cloned()
            .unwrap_or_default()
    }
}

impl ProcessControl for MockProcesses {
    fn is_alive(&self, pid: Pid) -> bool {
        self.is_running(pid)
    }

    fn snapshot(&self) -> crate::Result<ProcessTable> {
        let mut table = ProcessTable::default();
        for (pid, process) in &self.state.borrow().processes {
            if process.running {
                table.insert(*pid, process.parent);
            }
        }
        Ok(table)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> crate::Result<()> {
        let mut state = self.state.borrow_mut();
        state.signals.entry(pid).or_default().push(signal);
        if let Some(process) = state.processes.get_mut(&pid) {
            if signal == Signal::SIGKILL || !process.ignore_sigterm {
                process.running = false;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockProbe {
    resident: Rc<RefCell<Map<GpuIndex, Vec<Pid>>>>,
}

impl MockProbe {
    pub fn set(&self, gpu: GpuIndex, pids: Vec<Pid>) {
        self.resident.borrow_mut().insert(gpu, pids);
    }
}

impl GpuProbe for MockProbe {
    fn resident_processes(&self) -> crate::Result<Map<GpuIndex, Vec<Pid>>> {
        Ok(self.resident.borrow().clone())
    }
}

#[derive(Debug, Clone)]
pub struct LaunchedJob {
    pub job: JobId,
    pub gpus: Vec<GpuIndex>,
    /// Environment the command would receive.
    pub env: EnvSnapshot,
}

#[derive(Default)]
struct LauncherState {
    launched: Vec<LaunchedJob>,
    fail_next: bool,
    next_pid: Pid,
}

/// Pretends to start jobs by adding processes to a [`MockProcesses`] table.
#[derive(Clone)]
pub struct MockLauncher {
    state: Rc<RefCell<LauncherState>>,
    procs: MockProcesses,
}

impl MockLauncher {
    pub fn new(procs: MockProcesses) -> Self {
        Self {
            state: Rc::new(RefCell::new(LauncherState {
                next_pid: 10_000,
                ..Default::default()
            })),
            procs,
        }
    }

    pub fn fail_next(&self) {
        self.state.borrow_mut().fail_next = true;
    }

    pub fn launched(&self) -> Vec<LaunchedJob> {
        self.state.borrow().launched.clone()
    }
}

impl Launcher for MockLauncher {
    fn launch(&mut self, request: &LaunchRequest<'_>) -> crate::Result<Pid> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next) {
            return Err("launch failed".into());
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let mut env = request.env.clone();
        env.insert(request.visibility_var, format_gpus(request.gpus));
        state.launched.push(LaunchedJob {
            job: request.job.id().clone(),
            gpus: request.gpus.to_vec(),
            env,
        });
        self.procs.spawn(pid, None);
        Ok(pid)
    }
}

/// Daemon over a temporary store, with simulated processes and devices.
pub struct TestDaemon {
    pub store: TestStore,
    pub daemon: SchedulerDaemon,
    pub procs: MockProcesses,
    pub probe: MockProbe,
    pub launcher: MockLauncher,
}

impl TestDaemon {
    pub fn new(gpu_count: u32) -> Self {
        let store = TestStore::new(gpu_count);
        let config = SchedConfig {
            root: store.root().to_path_buf(),
            grace_secs: 1,
            lock_timeout_secs: 1,
            gpu_probe: ProbeKind::None,
            ..Default::default()
        };
        let procs = MockProcesses::default();
        let probe = MockProbe::default();
        let launcher = MockLauncher::new(procs.clone());
        let daemon = SchedulerDaemon::new(
            config.clone(),
            JobStore::open(&config.root, config.lock_timeout()).unwrap(),
            Box::new(procs.clone()),
            Box::new(probe.clone()),
            Box::new(launcher.clone()),
            Box::new(FirstPicker),
        );
        Self {
            store,
            daemon,
            procs,
            probe,
            launcher,
        }
    }
}
