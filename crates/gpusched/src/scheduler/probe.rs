use std::process::Command;

use crate::common::config::ProbeKind;
use crate::common::error::SchedError;
use crate::{GpuIndex, Map, Pid};

/// Lists processes that hold a context on a GPU device.
pub trait GpuProbe {
    fn resident_processes(&self) -> crate::Result<Map<GpuIndex, Vec<Pid>>>;
}

pub fn create_probe(kind: ProbeKind) -> Box<dyn GpuProbe> {
    match kind {
        ProbeKind::Nvidia => Box::new(NvidiaProbe),
        ProbeKind::None => Box::new(NoProbe),
    }
}

/// Queries the NVIDIA driver through `nvidia-smi`.
pub struct NvidiaProbe;

impl GpuProbe for NvidiaProbe {
    /// Example expected output:
    /// ```console
    /// $ nvidia-smi --format=csv,noheader --query-gpu=index,uuid
    /// 0, GPU-4b1a3c2e-0000-1111-2222-333344445555
    /// 1, GPU-9f2d7e10-6666-7777-8888-9999aaaabbbb
    /// $ nvidia-smi --format=csv,noheader --query-compute-apps=gpu_uuid,pid
    /// GPU-9f2d7e10-6666-7777-8888-9999aaaabbbb, 48213
    /// ```
    fn resident_processes(&self) -> crate::Result<Map<GpuIndex, Vec<Pid>>> {
        let gpus = parse_gpu_indices(&run_nvidia_smi("--query-gpu=index,uuid")?)?;
        let apps = parse_compute_apps(&run_nvidia_smi("--query-compute-apps=gpu_uuid,pid")?)?;

        let mut result: Map<GpuIndex, Vec<Pid>> =
            gpus.values().map(|index| (*index, Vec::new())).collect();
        for (uuid, pid) in apps {
            match gpus.get(&uuid) {
                Some(index) => result.entry(*index).or_default().push(pid),
                None => log::warn!("nvidia-smi reported process {pid} on unknown GPU {uuid}"),
            }
        }
        Ok(result)
    }
}

/// Used on machines without a supported driver tool. Reports no resident processes.
pub struct NoProbe;

impl GpuProbe for NoProbe {
    fn resident_processes(&self) -> crate::Result<Map<GpuIndex, Vec<Pid>>> {
        Ok(Map::new())
    }
}

fn run_nvidia_smi(query: &str) -> crate::Result<String> {
    let output = Command::new("nvidia-smi")
        .args(["--format=csv,noheader", query])
        .output()
        .map_err(|error| {
            SchedError::UnsupportedEnvironment(format!("Cannot execute nvidia-smi: {error:?}"))
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "nvidia-smi exited with error code {}\nStdout: {stdout}\nStderr: {stderr}",
            output.status
        )
        .into());
    }
    Ok(stdout.into_owned())
}

/// Maps GPU UUIDs to device indices.
fn parse_gpu_indices(output: &str) -> crate::Result<Map<String, GpuIndex>> {
    let mut gpus = Map::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let (index, uuid) = split_pair(line)?;
        let index = index
            .parse::<GpuIndex>()
            .map_err(|_| format!("Invalid GPU index in nvidia-smi output: `{line}`"))?;
        gpus.insert(uuid.to_string(), index);
    }
    Ok(gpus)
}

fn parse_compute_apps(output: &str) -> crate::Result<Vec<(String, Pid)>> {
    let mut apps = Vec::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        // Printed instead of a process list by some driver versions
        if line.contains("No running processes found") {
            continue;
        }
        let (uuid, pid) = split_pair(line)?;
        let pid = pid
            .parse::<Pid>()
            .map_err(|_| format!("Invalid PID in nvidia-smi output: `{line}`"))?;
        apps.push((uuid.to_string(), pid));
    }
    Ok(apps)
}

fn split_pair(line: &str) -> crate::Result<(&str, &str)> {
    line.split_once(',')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| format!("Unexpected nvidia-smi output: `{line}`").into())
}
