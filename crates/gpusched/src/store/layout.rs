use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use crate::GpuIndex;

const INBOX_DIR: &str = "addqueue";
const PENDING_DIR: &str = "queue";
const GPU_DIR: &str = "gpu";
const LOCK_DIR: &str = "locks";
const LOCK_FILE: &str = "lock";
const QUOTA_SUFFIX: &str = ".quota";

/// Logical place where a job record can reside.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    /// Submission area of a single user.
    Inbox(String),
    /// Accepted jobs that wait for GPUs.
    Pending,
    /// Jobs assigned to a single GPU device.
    Slot(GpuIndex),
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Inbox(user) => write!(f, "inbox of {user}"),
            Location::Pending => f.write_str("pending queue"),
            Location::Slot(gpu) => write!(f, "GPU {gpu}"),
        }
    }
}

/// Maps logical locations to directories below the store root.
///
/// ```text
/// <root>/addqueue/<user>/        inbox of <user>
/// <root>/addqueue/<user>.quota   GPU quota of <user>
/// <root>/queue/                  pending queue
/// <root>/gpu/<index>/            slot of GPU <index>
/// <root>/locks/lock              lock file
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inbox_root(&self) -> PathBuf {
        self.root.join(INBOX_DIR)
    }

    pub fn gpu_root(&self) -> PathBuf {
        self.root.join(GPU_DIR)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_dir().join(LOCK_FILE)
    }

    pub fn quota_file(&self, user: &str) -> PathBuf {
        self.inbox_root().join(format!("{user}{QUOTA_SUFFIX}"))
    }

    pub fn location_dir(&self, location: &Location) -> PathBuf {
        match location {
            Location::Inbox(user) => self.inbox_root().join(user),
            Location::Pending => self.root.join(PENDING_DIR),
            Location::Slot(gpu) => self.gpu_root().join(gpu.to_string()),
        }
    }
}
