use std::ffi::CString;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use nix::unistd::User;

use crate::common::env::{CUDA_DEVICE_ORDER, GPUSCHED_JOB_NAME};
use crate::common::error::SchedError;
use crate::scheduler::allocator::format_gpus;
use crate::store::record::{EnvSnapshot, JobId, JobKind, JobRecord};
use crate::{GpuIndex, Pid};

pub struct LaunchRequest<'a> {
    pub job: &'a JobRecord,
    pub env: &'a EnvSnapshot,
    pub gpus: &'a [GpuIndex],
    /// Variable that receives the comma separated list of assigned GPUs.
    pub visibility_var: &'a str,
}

/// Starts the command of an assigned batch job.
pub trait Launcher {
    /// Returns the PID of the started process.
    fn launch(&mut self, request: &LaunchRequest<'_>) -> crate::Result<Pid>;

    /// Collects finished processes, if the launcher keeps track of them.
    fn reap(&mut self) {}
}

/// Runs commands through `/bin/sh -c` as the submitting user, in a new session.
#[derive(Default)]
pub struct UserLauncher {
    children: Vec<(JobId, Child)>,
}

impl Launcher for UserLauncher {
    fn launch(&mut self, request: &LaunchRequest<'_>) -> crate::Result<Pid> {
        let job = request.job;
        let JobKind::Batch { command } = job.kind() else {
            return Err(format!("Job {} is interactive and cannot be launched", job.id()).into());
        };

        let user = resolve_user(job.user())?;
        if !nix::unistd::geteuid().is_root() {
            return Err(SchedError::UnsupportedEnvironment(
                "the daemon has to run as root to launch jobs of other users".to_string(),
            ));
        }
        let user_name = CString::new(user.name.as_str())
            .map_err(|_| format!("Invalid user name {}", user.name))?;
        let (uid, gid) = (user.uid, user.gid);

        let mut process = Command::new("/bin/sh");
        process
            .arg("-c")
            .arg(command)
            .env_clear()
            .envs(request.env.iter())
            .env(request.visibility_var, format_gpus(request.gpus))
            .env(CUDA_DEVICE_ORDER, "PCI_BUS_ID")
            .env(GPUSCHED_JOB_NAME, job.id().name())
            .current_dir(working_directory(request.env, &user.dir))
            .stdin(Stdio::null());

        unsafe {
            process.pre_exec(move || {
                // A new session, so that the whole job can be signaled without touching us
                nix::unistd::setsid()?;
                nix::unistd::initgroups(&user_name, gid)?;
                nix::unistd::setgid(gid)?;
                nix::unistd::setuid(uid)?;
                Ok(())
            });
        }

        let child = process
            .spawn()
            .map_err(|error| format!("Cannot start job {}: {error}", job.id()))?;
        let pid = child.id();
        log::info!(
            "Job {} started as process {pid} of user {} on GPU(s) {}",
            job.id(),
            user.name,
            format_gpus(request.gpus)
        );
        self.children.push((job.id().clone(), child));
        Ok(pid)
    }

    fn reap(&mut self) {
        self.children.retain_mut(|(id, child)| match child.try_wait() {
            Ok(Some(status)) => {
                log::info!("Job {id} has finished: {status}");
                false
            }
            Ok(None) => true,
            Err(error) => {
                log::error!("Cannot get status of job {id}: {error}");
                false
            }
        });
    }
}

/// Looks up the account a job runs under. Root is never a valid target.
fn resolve_user(name: &str) -> crate::Result<User> {
    let user = User::from_name(name)?
        .ok_or_else(|| SchedError::SystemError(format!("Unknown user `{name}`")))?;
    if user.uid.is_root() {
        return Err(format!("Refusing to launch a job as root (user `{name}`)").into());
    }
    Ok(user)
}

/// The directory the job was submitted from, or the home directory if it no longer exists.
fn working_directory<'a>(env: &'a EnvSnapshot, home: &'a Path) -> &'a Path {
    env.get("PWD")
        .map(Path::new)
        .filter(|dir| dir.is_dir())
        .unwrap_or(home)
}
