pub mod client;
pub mod common;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::SchedError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = std::collections::BTreeMap<K, V>;
pub type Set<T> = std::collections::BTreeSet<T>;

/// Index of a physical GPU device, as used by the driver and by the slot directories.
pub type GpuIndex = u32;

/// Operating system process id.
pub type Pid = u32;

pub const GPUSCHED_VERSION: &str = env!("CARGO_PKG_VERSION");
