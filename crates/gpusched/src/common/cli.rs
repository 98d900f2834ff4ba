use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};
use cli_table::ColorChoice;

use crate::common::config::{ProbeKind, SchedConfig};
use crate::common::env::{GPUSCHED_CONFIG, GPUSCHED_ROOT};
use crate::common::utils::time::parse_lifetime_hours;

macro_rules! arg_wrapper {
    ($name:ident, $wrapped_type:ty, $parser:expr) => {
        #[derive(Clone)]
        pub struct $name($wrapped_type);

        impl ::std::str::FromStr for $name {
            type Err = ::anyhow::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                ::std::result::Result::Ok(Self($parser(s)?))
            }
        }

        impl $name {
            pub fn get(&self) -> &$wrapped_type {
                &self.0
            }
            pub fn unpack(self) -> $wrapped_type {
                self.0
            }
        }
    };
}

arg_wrapper!(ArgDuration, Duration, humantime::parse_duration);
arg_wrapper!(ArgLifetime, f64, parse_lifetime_hours);

#[derive(clap::ValueEnum, Clone)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

impl ColorPolicy {
    pub fn color_choice(&self) -> ColorChoice {
        match self {
            ColorPolicy::Always => ColorChoice::AlwaysAnsi,
            ColorPolicy::Auto => {
                if std::io::stdout().is_terminal() {
                    ColorChoice::Auto
                } else {
                    ColorChoice::Never
                }
            }
            ColorPolicy::Never => ColorChoice::Never,
        }
    }
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to a TOML configuration file
    #[arg(
        long,
        value_hint = ValueHint::FilePath,
        global = true,
        env = GPUSCHED_CONFIG,
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: Option<PathBuf>,

    /// Root directory of the job store [default: /var/gpusched]
    #[arg(
        long,
        value_hint = ValueHint::DirPath,
        global = true,
        env = GPUSCHED_ROOT,
        help_heading("GLOBAL OPTIONS")
    )]
    pub root: Option<PathBuf>,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Enables more detailed log output
    #[arg(
        long,
        short,
        global = true,
        help_heading("GLOBAL OPTIONS")
    )]
    pub verbose: bool,
}

impl CommonOpts {
    /// Configuration file (or defaults) with the command line root applied.
    pub fn load_config(&self) -> anyhow::Result<SchedConfig> {
        let mut config = match &self.config {
            Some(path) => SchedConfig::load(path).map_err(|error| {
                anyhow::anyhow!("Cannot load configuration {}: {error}", path.display())
            })?,
            None => SchedConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        Ok(config)
    }
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::GPUSCHED_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Run the scheduler daemon (as root)
    Daemon(DaemonOpts),
    /// Allocate GPUs and start an interactive shell that can use them
    Salloc(SallocOpts),
    /// Submit a command that is started once GPUs are available
    Sbatch(SbatchOpts),
    /// Display running and waiting jobs
    Queue,
    /// Display your GPU quota and its usage
    Quota,
}

#[derive(Parser)]
pub struct DaemonOpts {
    /// Create the store layout with the given number of GPU slots before starting
    #[arg(long, value_name = "GPU_COUNT")]
    pub init: Option<u32>,

    /// Delay between scheduling cycles (e.g. "10s")
    #[arg(long)]
    pub cycle: Option<ArgDuration>,

    /// How long evicted jobs get to exit before they are killed (e.g. "5s")
    #[arg(long)]
    pub grace: Option<ArgDuration>,

    /// How GPU processes are discovered
    #[arg(long, value_enum)]
    pub gpu_probe: Option<ProbeKind>,
}

impl DaemonOpts {
    pub fn apply(&self, config: &mut SchedConfig) -> anyhow::Result<()> {
        if let Some(cycle) = &self.cycle {
            config.cycle_secs = cycle.get().as_secs();
        }
        if let Some(grace) = &self.grace {
            config.grace_secs = grace.get().as_secs();
        }
        if let Some(probe) = self.gpu_probe {
            config.gpu_probe = probe;
        }
        config.validate()?;
        Ok(())
    }
}

#[derive(Parser)]
pub struct SallocOpts {
    /// Number of GPUs
    #[arg(long, short = 'n', default_value_t = 1)]
    pub gpus: u32,

    /// Time limit, in hours ("1.5") or as a duration ("90m")
    #[arg(long, short = 't', default_value = "1")]
    pub time: ArgLifetime,

    /// Shell to start [default: $SHELL]
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    pub shell: Option<PathBuf>,
}

#[derive(Parser)]
pub struct SbatchOpts {
    /// Number of GPUs
    #[arg(long, short = 'n', default_value_t = 1)]
    pub gpus: u32,

    /// Time limit, in hours ("1.5") or as a duration ("90m")
    #[arg(long, short = 't', default_value = "1")]
    pub time: ArgLifetime,

    /// Wait until the job has been assigned its GPUs
    #[arg(long)]
    pub wait: bool,

    /// Command executed by /bin/sh once GPUs are assigned
    #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use crate::common::cli::{RootOptions, SubCommand};
    use crate::common::config::ProbeKind;

    #[test]
    fn parse_sbatch() {
        let opts = RootOptions::try_parse_from([
            "gpusched", "sbatch", "-n", "2", "--time", "90m", "--", "python", "train.py", "--lr",
            "0.1",
        ])
        .unwrap();
        let SubCommand::Sbatch(sbatch) = opts.subcmd else {
            panic!("expected sbatch");
        };
        assert_eq!(sbatch.gpus, 2);
        assert_eq!(*sbatch.time.get(), 1.5);
        assert_eq!(sbatch.command, vec!["python", "train.py", "--lr", "0.1"]);
        assert!(!sbatch.wait);
    }

    #[test]
    fn sbatch_requires_command() {
        assert!(RootOptions::try_parse_from(["gpusched", "sbatch"]).is_err());
    }

    #[test]
    fn invalid_time_is_rejected() {
        assert!(RootOptions::try_parse_from(["gpusched", "salloc", "-t", "0"]).is_err());
    }

    #[test]
    fn daemon_overrides_config() {
        let opts = RootOptions::try_parse_from([
            "gpusched",
            "--root",
            "/tmp/store",
            "daemon",
            "--cycle",
            "3s",
            "--gpu-probe",
            "none",
        ])
        .unwrap();
        let mut config = opts.common.load_config().unwrap();
        let SubCommand::Daemon(daemon) = opts.subcmd else {
            panic!("expected daemon");
        };
        daemon.apply(&mut config).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/store"));
        assert_eq!(config.cycle_secs, 3);
        assert_eq!(config.gpu_probe, ProbeKind::None);
        assert_eq!(config.poll_secs, 2);
    }
}
