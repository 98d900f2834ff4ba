use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches};
use cli_table::format::Justify;
use cli_table::{Cell, ColorChoice, Style, Table, print_stdout};

use gpusched::client::current_user;
use gpusched::client::queue::{collect_queue, print_queue};
use gpusched::client::shell::{ShellKind, ShellSession};
use gpusched::client::submit::{JobClient, SubmitRequest};
use gpusched::common::cli::{DaemonOpts, RootOptions, SallocOpts, SbatchOpts, SubCommand};
use gpusched::common::config::SchedConfig;
use gpusched::common::setup::setup_logging;
use gpusched::common::utils::str::{pluralize, shell_join};
use gpusched::common::utils::time::now_epoch;
use gpusched::scheduler::allocator::format_gpus;
use gpusched::scheduler::daemon::SchedulerDaemon;
use gpusched::store::JobStore;
use gpusched::store::record::{EnvSnapshot, JobKind};

const DEFAULT_SHELL: &str = "/bin/bash";

// Commands

async fn command_daemon(mut config: SchedConfig, opts: DaemonOpts) -> anyhow::Result<()> {
    opts.apply(&mut config)?;
    if let Some(gpu_count) = opts.init {
        JobStore::init(&config.root, gpu_count, config.lock_timeout())
            .with_context(|| format!("Cannot initialize store at {}", config.root.display()))?;
        log::info!(
            "Store at {} initialized with {gpu_count} GPU {}",
            config.root.display(),
            pluralize("slot", gpu_count as usize)
        );
    }
    let daemon = SchedulerDaemon::from_config(config)?;
    daemon.run().await?;
    Ok(())
}

async fn command_salloc(config: SchedConfig, opts: SallocOpts) -> anyhow::Result<()> {
    let user = current_user()?;
    let shell = opts
        .shell
        .or_else(|| std::env::var_os("SHELL").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
    // Fail before anything is submitted
    ShellKind::detect(&shell)?;

    let client = JobClient::new(&config, user)?;
    client.check_quota(opts.gpus)?;
    let record = client.submit(
        SubmitRequest {
            kind: JobKind::Interactive,
            lifetime_hours: opts.time.unpack(),
            num_gpu: opts.gpus,
        },
        std::process::id(),
        &EnvSnapshot::capture(),
    )?;
    println!(
        "Waiting for {} {} (job {})",
        opts.gpus,
        pluralize("GPU", opts.gpus as usize),
        record.id()
    );
    let gpus = client.wait_for_gpus(&record).await?;

    let home = home_directory(client.user())?;
    let session = ShellSession::prepare(&shell, &home, &config.visibility_var, &gpus)?;
    println!(
        "Allocated {} {}, starting {}",
        pluralize("GPU", gpus.len()),
        format_gpus(&gpus),
        shell.display()
    );
    let status = session
        .command()
        .status()
        .with_context(|| format!("Cannot start shell {}", shell.display()))?;
    println!(
        "Shell exited with {status}, releasing {}",
        pluralize("GPU", gpus.len())
    );
    Ok(())
}

fn home_directory(user: &str) -> anyhow::Result<PathBuf> {
    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home));
    }
    let entry = nix::unistd::User::from_name(user)?
        .with_context(|| format!("Cannot find home directory of {user}"))?;
    Ok(entry.dir)
}

async fn command_sbatch(config: SchedConfig, opts: SbatchOpts) -> anyhow::Result<()> {
    let client = JobClient::new(&config, current_user()?)?;
    client.check_quota(opts.gpus)?;
    let record = client.submit(
        SubmitRequest {
            kind: JobKind::Batch {
                command: shell_join(&opts.command),
            },
            lifetime_hours: opts.time.unpack(),
            num_gpu: opts.gpus,
        },
        std::process::id(),
        &EnvSnapshot::capture(),
    )?;
    println!("Job {} submitted", record.id());
    if opts.wait {
        let gpus = client.wait_for_gpus(&record).await?;
        println!(
            "Job {} assigned to {} {}",
            record.id(),
            pluralize("GPU", gpus.len()),
            format_gpus(&gpus)
        );
    }
    Ok(())
}

fn command_queue(config: SchedConfig, color: ColorChoice) -> anyhow::Result<()> {
    let store = JobStore::open(&config.root, config.lock_timeout())?;
    let entries = store.with_lock(collect_queue)?;
    print_queue(&entries, now_epoch(), color);
    Ok(())
}

fn command_quota(config: SchedConfig, color: ColorChoice) -> anyhow::Result<()> {
    let client = JobClient::new(&config, current_user()?)?;
    let (quota, used, remaining) = client.quota_status()?;
    let quota = match quota {
        Some(quota) => quota.to_string(),
        None => "none".to_string(),
    };
    let rows = vec![
        vec!["User".cell().bold(true), client.user().cell()],
        vec![
            "Quota".cell().bold(true),
            quota.cell().justify(Justify::Right),
        ],
        vec!["Used".cell().bold(true), used.cell().justify(Justify::Right)],
        vec![
            "Remaining".cell().bold(true),
            remaining.cell().justify(Justify::Right),
        ],
    ];
    let table = rows.table().color_choice(color);
    print_stdout(table).context("Cannot print table to stdout")?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> gpusched::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.verbose);

    let color = top_opts.common.colors.color_choice();
    let result = match top_opts.common.load_config() {
        Ok(config) => match top_opts.subcmd {
            SubCommand::Daemon(opts) => command_daemon(config, opts).await,
            SubCommand::Salloc(opts) => command_salloc(config, opts).await,
            SubCommand::Sbatch(opts) => command_sbatch(config, opts).await,
            SubCommand::Queue => command_queue(config, color),
            SubCommand::Quota => command_quota(config, color),
        },
        Err(error) => Err(error),
    };

    if let Err(error) = result {
        eprintln!("Error: {error:?}");
        std::process::exit(1);
    }

    Ok(())
}
