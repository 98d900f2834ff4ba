macro_rules! create_gpusched_env {
    ($name: literal) => {
        concat!("GPUSCHED_", $name)
    };
}

/// Root directory of the job store.
pub const GPUSCHED_ROOT: &str = create_gpusched_env!("ROOT");
/// Path to a TOML configuration file.
pub const GPUSCHED_CONFIG: &str = create_gpusched_env!("CONFIG");
/// Exported into launched batch jobs, contains the name of the job record.
pub const GPUSCHED_JOB_NAME: &str = create_gpusched_env!("JOB_NAME");

pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
pub const CUDA_DEVICE_ORDER: &str = "CUDA_DEVICE_ORDER";
