use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use psutil::process::{Process, Status};

use crate::{Map, Pid, Set};

/// Inspection and signaling of operating system processes.
pub trait ProcessControl {
    /// Returns false for processes that do not exist or are zombies.
    fn is_alive(&self, pid: Pid) -> bool;

    /// Parent/child relations of all processes.
    fn snapshot(&self) -> crate::Result<ProcessTable>;

    /// Sends `signal` to `pid`. Signaling a process that no longer exists is not an error.
    fn signal(&self, pid: Pid, signal: Signal) -> crate::Result<()>;
}

/// Process tree captured at a single moment.
#[derive(Debug, Default, Clone)]
pub struct ProcessTable {
    children: Map<Pid, Vec<Pid>>,
    alive: Set<Pid>,
}

impl ProcessTable {
    pub fn insert(&mut self, pid: Pid, parent: Option<Pid>) {
        self.alive.insert(pid);
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().push(pid);
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.alive.contains(&pid)
    }

    /// All transitive children of `pid`, not including `pid` itself.
    pub fn descendants(&self, pid: Pid) -> Vec<Pid> {
        let mut result = Vec::new();
        let mut visited: Set<Pid> = Set::new();
        let mut stack = vec![pid];
        visited.insert(pid);
        while let Some(current) = stack.pop() {
            for child in self.children.get(&current).into_iter().flatten() {
                if visited.insert(*child) {
                    result.push(*child);
                    stack.push(*child);
                }
            }
        }
        result
    }
}

/// Processes of the local machine, inspected through `/proc` and signaled with `kill(2)`.
#[derive(Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: Pid) -> bool {
        if pid == 0 {
            return false;
        }
        match Process::new(pid) {
            Ok(process) => !matches!(process.status(), Ok(Status::Zombie) | Err(_)),
            Err(_) => false,
        }
    }

    fn snapshot(&self) -> crate::Result<ProcessTable> {
        let mut table = ProcessTable::default();
        for process in psutil::process::processes()? {
            // Processes may exit while they are being listed
            let Ok(process) = process else {
                continue;
            };
            if matches!(process.status(), Ok(Status::Zombie)) {
                continue;
            }
            let parent = process.ppid().ok().flatten();
            table.insert(process.pid(), parent);
        }
        Ok(table)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> crate::Result<()> {
        let raw = i32::try_from(pid).map_err(|_| format!("Invalid PID {pid}"))?;
        if raw <= 0 {
            return Err(format!("Refusing to signal PID {pid}").into());
        }
        match signal::kill(nix::unistd::Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(error) => Err(format!("Cannot send {signal} to PID {pid}: {error}").into()),
        }
    }
}
