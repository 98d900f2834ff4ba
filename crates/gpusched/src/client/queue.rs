use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, ColorChoice, Style, Table, print_stdout};

use crate::common::error::SchedError;
use crate::common::utils::time::{hours_to_secs, human_duration};
use crate::scheduler::allocator::format_gpus;
use crate::store::StoreGuard;
use crate::store::layout::Location;
use crate::store::record::JobRecord;
use crate::GpuIndex;

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    /// Submitted, not yet seen by the scheduler.
    Submitted,
    Waiting,
    /// Requests more GPUs than the machine has.
    Impossible,
    Running(Vec<GpuIndex>),
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub record: JobRecord,
    pub state: JobState,
}

/// Collects all readable jobs of the store: running jobs first, then waiting jobs in the
/// order in which they would be considered by the scheduler.
pub fn collect_queue(guard: &StoreGuard<'_>) -> crate::Result<Vec<QueueEntry>> {
    let slots = guard.read_slots()?;
    let total = slots.total_gpus();
    let mut entries: Vec<QueueEntry> = slots
        .jobs()
        .into_values()
        .map(|(record, gpus)| QueueEntry {
            record,
            state: JobState::Running(gpus),
        })
        .collect();

    let mut waiting = Vec::new();
    for record in read_location(guard, &Location::Pending)? {
        let state = if record.num_gpu() as usize > total {
            JobState::Impossible
        } else {
            JobState::Waiting
        };
        waiting.push(QueueEntry { record, state });
    }
    for user in guard.users()? {
        match read_location(guard, &Location::Inbox(user.clone())) {
            Ok(records) => waiting.extend(records.into_iter().map(|record| QueueEntry {
                record,
                state: JobState::Submitted,
            })),
            // Inboxes of other users may not be readable
            Err(SchedError::IoError(error)) => {
                log::debug!("Cannot read inbox of {user}: {error}");
            }
            Err(error) => return Err(error),
        }
    }
    waiting.sort_by(|a, b| {
        b.record
            .is_interactive()
            .cmp(&a.record.is_interactive())
            .then_with(|| {
                a.record
                    .id()
                    .submit_time()
                    .total_cmp(&b.record.id().submit_time())
            })
    });
    entries.extend(waiting);
    Ok(entries)
}

fn read_location(guard: &StoreGuard<'_>, location: &Location) -> crate::Result<Vec<JobRecord>> {
    let mut records = Vec::new();
    for id in guard.list(location)? {
        match guard.read(location, &id) {
            Ok(record) => records.push(record),
            Err(error) => log::debug!("Skipping {id} in {location}: {error}"),
        }
    }
    Ok(records)
}

pub fn print_queue(entries: &[QueueEntry], now: f64, color: ColorChoice) {
    if entries.is_empty() {
        println!("No jobs found");
        return;
    }
    let header = vec![
        "Job".cell().bold(true),
        "User".cell().bold(true),
        "Type".cell().bold(true),
        "GPUs".cell().bold(true),
        "State".cell().bold(true),
        "Time left".cell().bold(true),
    ];
    let rows: Vec<Vec<CellStruct>> = entries
        .iter()
        .map(|entry| {
            let record = &entry.record;
            let (state, time) = match &entry.state {
                JobState::Submitted => ("submitted".to_string(), lifetime(record)),
                JobState::Waiting => ("waiting".to_string(), lifetime(record)),
                JobState::Impossible => ("impossible".to_string(), lifetime(record)),
                JobState::Running(gpus) => (
                    format!("running on {}", format_gpus(gpus)),
                    human_duration(record.end().unwrap_or(now) - now),
                ),
            };
            vec![
                record.id().pid().cell(),
                record.user().cell(),
                record.id().job_type().cell(),
                record.num_gpu().cell().justify(Justify::Right),
                state.cell(),
                time.cell(),
            ]
        })
        .collect();

    let table = rows
        .table()
        .separator(
            Separator::builder()
                .title(Some(Default::default()))
                .column(Some(Default::default()))
                .build(),
        )
        .title(header)
        .color_choice(color);
    if let Err(error) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {error:?}");
    }
}

fn lifetime(record: &JobRecord) -> String {
    human_duration(hours_to_secs(record.lifetime_hours()))
}
