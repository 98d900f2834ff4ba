use thiserror::Error;

use crate::common::error::SchedError::GenericError;
use crate::{GpuIndex, Pid};

#[derive(Debug, Error)]
pub enum SchedError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Malformed record {name}: {reason}")]
    MalformedRecord { name: String, reason: String },
    #[error("Record {0} not found")]
    NotFound(String),
    #[error("Job store is unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Quota exceeded: {used} GPU(s) in use, {requested} requested, quota is {quota}")]
    QuotaExceeded { used: u32, requested: u32, quota: f64 },
    #[error("Not enough free GPUs: {requested} requested, {free} free")]
    InsufficientCapacity { requested: u32, free: usize },
    #[error("Impossible request: {requested} GPU(s) requested, the machine has only {total}")]
    ImpossibleRequest { requested: u32, total: usize },
    #[error("Process {0} does not exist")]
    ProcessVanished(Pid),
    #[error("Unauthorized process {pid} found on GPU {gpu}")]
    IntruderDetected { gpu: GpuIndex, pid: Pid },
    #[error("Shell `{0}` is not supported, use bash or zsh")]
    UnsupportedShell(String),
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),
    #[error("No GPU was assigned after waiting {waited_secs}s, please check the queue")]
    ClientTimeout { waited_secs: u64 },
    #[error("System error: {0}")]
    SystemError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl SchedError {
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::error::Error> for SchedError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<nix::errno::Errno> for SchedError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::SystemError(e.to_string())
    }
}

impl From<psutil::Error> for SchedError {
    fn from(e: psutil::Error) -> Self {
        Self::SystemError(e.to_string())
    }
}

impl From<psutil::process::ProcessError> for SchedError {
    fn from(e: psutil::process::ProcessError) -> Self {
        Self::SystemError(e.to_string())
    }
}

impl From<String> for SchedError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

impl From<&str> for SchedError {
    fn from(e: &str) -> Self {
        GenericError(e.to_string())
    }
}
