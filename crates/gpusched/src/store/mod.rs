//! Job store: job records kept as files in a directory tree shared by the daemon and all
//! clients. Every access happens while holding the store lock; the only way to reach the
//! records is through a [`StoreGuard`].

pub mod layout;
pub mod lock;
pub mod record;

use std::fs::{OpenOptions, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;

use crate::common::error::SchedError;
use crate::store::layout::{Location, StoreLayout};
use crate::store::lock::{LockGuard, StoreLock};
use crate::store::record::{EnvSnapshot, JOB_SUFFIX, JobId, JobRecord};
use crate::{GpuIndex, Map};

const JOB_FILE_MODE: u32 = 0o644;
// Environment snapshots may contain secrets of the submitting user.
const ENV_FILE_MODE: u32 = 0o600;
const TEMP_PREFIX: &str = ".tmp";

/// Name of a `.job` file found in a location.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEntry {
    Job(JobId),
    /// A `.job` file whose name does not encode a valid job identity.
    Malformed { stem: String, reason: String },
}

pub struct JobStore {
    layout: StoreLayout,
    lock: StoreLock,
}

impl JobStore {
    /// Opens an existing store.
    pub fn open(root: &Path, lock_timeout: Duration) -> crate::Result<Self> {
        let layout = StoreLayout::new(root);
        for dir in [
            layout.inbox_root(),
            layout.location_dir(&Location::Pending),
            layout.gpu_root(),
        ] {
            if !dir.is_dir() {
                return Err(SchedError::UnsupportedEnvironment(format!(
                    "{} is not an initialized job store ({} is missing)",
                    root.display(),
                    dir.display()
                )));
            }
        }
        let lock = StoreLock::new(&layout.lock_file(), lock_timeout);
        Ok(Self { layout, lock })
    }

    /// Creates the directory layout with `gpu_count` slots. Existing entries are kept.
    pub fn init(root: &Path, gpu_count: u32, lock_timeout: Duration) -> crate::Result<Self> {
        let layout = StoreLayout::new(root);
        let mut dirs = vec![
            layout.inbox_root(),
            layout.location_dir(&Location::Pending),
            layout.gpu_root(),
            layout.lock_dir(),
        ];
        dirs.extend((0..gpu_count).map(|gpu| layout.location_dir(&Location::Slot(gpu))));
        for dir in dirs {
            if !dir.is_dir() {
                log::info!("Creating {}", dir.display());
                std::fs::create_dir_all(&dir)?;
            }
        }
        let lock_file = layout.lock_file();
        if !lock_file.exists() {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_file)?;
            file.set_permissions(Permissions::from_mode(JOB_FILE_MODE))?;
        }
        Self::open(root, lock_timeout)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Blocks until the store lock is acquired or the lock timeout expires.
    pub fn lock(&self) -> crate::Result<StoreGuard<'_>> {
        let guard = self.lock.acquire()?;
        Ok(StoreGuard {
            layout: &self.layout,
            _guard: guard,
        })
    }

    /// Runs `f` while holding the store lock.
    pub fn with_lock<T, F: FnOnce(&StoreGuard<'_>) -> crate::Result<T>>(
        &self,
        f: F,
    ) -> crate::Result<T> {
        let guard = self.lock()?;
        f(&guard)
    }
}

/// Access to the store records, valid while the store lock is held.
pub struct StoreGuard<'a> {
    layout: &'a StoreLayout,
    _guard: LockGuard,
}

impl StoreGuard<'_> {
    pub fn layout(&self) -> &StoreLayout {
        self.layout
    }

    /// Users that have an inbox.
    pub fn users(&self) -> crate::Result<Vec<String>> {
        let mut users: Vec<String> = read_subdirectories(&self.layout.inbox_root())?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .collect();
        users.sort();
        Ok(users)
    }

    /// Indices of all GPU slots, in ascending order.
    pub fn slots(&self) -> crate::Result<Vec<GpuIndex>> {
        let mut slots: Vec<GpuIndex> = read_subdirectories(&self.layout.gpu_root())?
            .into_iter()
            .filter_map(|name| name.parse::<GpuIndex>().ok())
            .collect();
        slots.sort_unstable();
        Ok(slots)
    }

    pub fn list_entries(&self, location: &Location) -> crate::Result<Vec<RecordEntry>> {
        let dir = self.layout.location_dir(location);
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            match JobId::from_file_name(file_name) {
                Some(Ok(id)) => entries.push(RecordEntry::Job(id)),
                Some(Err(error)) => entries.push(RecordEntry::Malformed {
                    stem: file_name.trim_end_matches(JOB_SUFFIX).to_string(),
                    reason: error.to_string(),
                }),
                None => {}
            }
        }
        entries.sort_by(|a, b| entry_name(a).cmp(entry_name(b)));
        Ok(entries)
    }

    /// Valid job ids stored in `location`, ordered by name.
    pub fn list(&self, location: &Location) -> crate::Result<Vec<JobId>> {
        Ok(self
            .list_entries(location)?
            .into_iter()
            .filter_map(|entry| match entry {
                RecordEntry::Job(id) => Some(id),
                RecordEntry::Malformed { .. } => None,
            })
            .collect())
    }

    pub fn contains(&self, location: &Location, id: &JobId) -> bool {
        std::fs::symlink_metadata(self.job_path(location, id)).is_ok_and(|meta| meta.is_file())
    }

    /// Reads a job record.
    ///
    /// Returns [`SchedError::NotFound`] if there is no such record and
    /// [`SchedError::MalformedRecord`] if it cannot be decoded or is not a regular file.
    pub fn read(&self, location: &Location, id: &JobId) -> crate::Result<JobRecord> {
        match read_regular_file(&self.job_path(location, id), id.name())? {
            Some(data) => JobRecord::from_json(id, &data),
            None => Err(SchedError::NotFound(id.to_string())),
        }
    }

    /// Reads the environment snapshot paired with a job. A missing snapshot makes the
    /// job malformed.
    pub fn read_env(&self, location: &Location, id: &JobId) -> crate::Result<EnvSnapshot> {
        match read_regular_file(&self.env_path(location, id), id.name())? {
            Some(data) => EnvSnapshot::from_json(id, &data),
            None => Err(SchedError::malformed(
                id.name(),
                "missing environment snapshot",
            )),
        }
    }

    /// Stores a new job together with its environment. Fails if the job already exists.
    pub fn create(
        &self,
        location: &Location,
        record: &JobRecord,
        env: &EnvSnapshot,
    ) -> crate::Result<()> {
        let dir = self.layout.location_dir(location);
        if !dir.is_dir() {
            return Err(SchedError::UnsupportedEnvironment(format!(
                "{location} does not exist, contact the administrator"
            )));
        }
        if self.contains(location, record.id()) {
            return Err(format!("Job {} already exists in {location}", record.id()).into());
        }
        self.write_env(location, record.id(), env)?;
        self.write(location, record)
    }

    /// Atomically replaces (or creates) a job record.
    pub fn write(&self, location: &Location, record: &JobRecord) -> crate::Result<()> {
        write_atomic(
            &self.job_path(location, record.id()),
            &record.to_json()?,
            JOB_FILE_MODE,
        )
    }

    pub fn write_env(
        &self,
        location: &Location,
        id: &JobId,
        env: &EnvSnapshot,
    ) -> crate::Result<()> {
        write_atomic(&self.env_path(location, id), &env.to_json()?, ENV_FILE_MODE)
    }

    /// Copies `record` and the environment of its job from `from` into `to`.
    /// The source is left untouched.
    pub fn copy_to(
        &self,
        from: &Location,
        to: &Location,
        record: &JobRecord,
    ) -> crate::Result<()> {
        let env = self.read_env(from, record.id())?;
        self.write_env(to, record.id(), &env)?;
        self.write(to, record)
    }

    /// Moves a job from `from` to `to`, storing `record` as the new content.
    /// The destination is written before the source is deleted, so a crash in between
    /// leaves a duplicate and never loses the job.
    pub fn relocate(
        &self,
        from: &Location,
        to: &Location,
        record: &JobRecord,
    ) -> crate::Result<()> {
        self.copy_to(from, to, record)?;
        self.delete(from, record.id())
    }

    /// Deletes a job and its environment. Deleting a missing job is not an error.
    pub fn delete(&self, location: &Location, id: &JobId) -> crate::Result<()> {
        self.delete_stem(location, id.name())
    }

    /// Deletes the files of a record by their common stem, for records whose name is
    /// not a valid job identity.
    pub fn delete_stem(&self, location: &Location, stem: &str) -> crate::Result<()> {
        let dir = self.layout.location_dir(location);
        remove_if_exists(&dir.join(format!("{stem}{JOB_SUFFIX}")))?;
        remove_if_exists(&dir.join(format!("{stem}{}", record::ENV_SUFFIX)))
    }

    /// GPU quota of `user`. `None` if the user has no quota file.
    pub fn read_quota(&self, user: &str) -> crate::Result<Option<f64>> {
        let path = self.layout.quota_file(user);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        content
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|quota| quota.is_finite() && *quota >= 0.0)
            .map(Some)
            .ok_or_else(|| {
                format!("Invalid quota `{}` in {}", content.trim(), path.display()).into()
            })
    }

    /// Reads all records of all slots. Records that cannot be read are returned
    /// separately with the reason.
    pub fn read_slots(&self) -> crate::Result<SlotContents> {
        let mut contents = SlotContents::default();
        for gpu in self.slots()? {
            let location = Location::Slot(gpu);
            let mut records = Vec::new();
            for entry in self.list_entries(&location)? {
                match entry {
                    RecordEntry::Job(id) => match self.read(&location, &id) {
                        Ok(record) => records.push(record),
                        Err(SchedError::NotFound(_)) => {}
                        Err(error) => contents.broken.push((
                            location.clone(),
                            id.to_string(),
                            error.to_string(),
                        )),
                    },
                    RecordEntry::Malformed { stem, reason } => {
                        contents.broken.push((location.clone(), stem, reason))
                    }
                }
            }
            contents.slots.insert(gpu, records);
        }
        Ok(contents)
    }

    fn job_path(&self, location: &Location, id: &JobId) -> PathBuf {
        self.layout.location_dir(location).join(id.job_file_name())
    }

    fn env_path(&self, location: &Location, id: &JobId) -> PathBuf {
        self.layout.location_dir(location).join(id.env_file_name())
    }
}

/// Snapshot of every GPU slot.
#[derive(Debug, Default)]
pub struct SlotContents {
    /// Readable records of each slot, including empty slots.
    pub slots: Map<GpuIndex, Vec<JobRecord>>,
    /// `(location, stem, reason)` of records that could not be decoded.
    pub broken: Vec<(Location, String, String)>,
}

impl SlotContents {
    /// Slots without any record. A slot that contains only unreadable records is not free.
    pub fn free_gpus(&self) -> Vec<GpuIndex> {
        self.slots
            .iter()
            .filter(|(gpu, records)| {
                records.is_empty()
                    && !self
                        .broken
                        .iter()
                        .any(|(location, _, _)| *location == Location::Slot(**gpu))
            })
            .map(|(gpu, _)| *gpu)
            .collect()
    }

    /// Slots holding records of more than one job.
    pub fn shared_slots(&self) -> Vec<(GpuIndex, Vec<&JobId>)> {
        self.slots
            .iter()
            .filter(|(_, records)| records.len() > 1)
            .map(|(gpu, records)| (*gpu, records.iter().map(|r| r.id()).collect()))
            .collect()
    }

    pub fn total_gpus(&self) -> usize {
        self.slots.len()
    }

    /// Groups slot records by job; a multi-GPU job is stored once per claimed slot.
    pub fn jobs(&self) -> Map<JobId, (JobRecord, Vec<GpuIndex>)> {
        let mut jobs: Map<JobId, (JobRecord, Vec<GpuIndex>)> = Map::new();
        for (gpu, records) in &self.slots {
            for record in records {
                jobs.entry(record.id().clone())
                    .or_insert_with(|| (record.clone(), Vec::new()))
                    .1
                    .push(*gpu);
            }
        }
        jobs
    }
}

fn entry_name(entry: &RecordEntry) -> &str {
    match entry {
        RecordEntry::Job(id) => id.name(),
        RecordEntry::Malformed { stem, .. } => stem,
    }
}

fn read_subdirectories(dir: &Path) -> crate::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Writes into a temporary file in the target directory and renames it over `path`,
/// so that readers observe either the old or the new content.
fn write_atomic(path: &Path, data: &[u8], mode: u32) -> crate::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| format!("Invalid record path {}", path.display()))?;
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .permissions(Permissions::from_mode(mode))
        .tempfile_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Reads a record file without following symbolic links. `None` if the file does not exist.
fn read_regular_file(path: &Path, name: &str) -> crate::Result<Option<Vec<u8>>> {
    let opened = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path);
    let mut file = match opened {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) if error.raw_os_error() == Some(Errno::ELOOP as i32) => {
            return Err(SchedError::malformed(
                name,
                format!("{} is a symbolic link", path.display()),
            ));
        }
        Err(error) => return Err(error.into()),
    };
    if !file.metadata()?.is_file() {
        return Err(SchedError::malformed(
            name,
            format!("{} is not a regular file", path.display()),
        ));
    }
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(Some(data))
}

fn remove_if_exists(path: &Path) -> crate::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::common::error::SchedError;
    use crate::store::layout::Location;
    use crate::store::record::{EnvSnapshot, JobKind, JobRecord};
    use crate::store::{JobStore, RecordEntry};
    use crate::tests::utils::{TestStore, env_with, interactive_job};

    #[test]
    fn open_requires_initialized_store() {
        let dir = TempDir::with_prefix("gpusched").unwrap();
        assert!(matches!(
            JobStore::open(dir.path(), Duration::from_secs(1)),
            Err(SchedError::UnsupportedEnvironment(_))
        ));
        JobStore::init(dir.path(), 2, Duration::from_secs(1)).unwrap();
        let store = JobStore::open(dir.path(), Duration::from_secs(1)).unwrap();
        assert_eq!(store.lock().unwrap().slots().unwrap(), vec![0, 1]);
    }

    #[test]
    fn init_keeps_existing_records() {
        let ctx = TestStore::new(2);
        ctx.add_user("alice", 1.0);
        let job = interactive_job("alice", 10, 1);
        ctx.put(&Location::Slot(1), &job);
        JobStore::init(ctx.root(), 4, Duration::from_secs(1)).unwrap();
        let guard = ctx.store.lock().unwrap();
        assert_eq!(guard.slots().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(guard.read(&Location::Slot(1), job.id()).unwrap(), job);
    }

    #[test]
    fn create_and_read() {
        let ctx = TestStore::new(1);
        ctx.add_user("alice", 1.0);
        let job = interactive_job("alice", 10, 1);
        let env = env_with(&[("HOME", "/home/alice")]);
        let inbox = Location::Inbox("alice".into());
        ctx.store
            .with_lock(|guard| guard.create(&inbox, &job, &env))
            .unwrap();

        let guard = ctx.store.lock().unwrap();
        assert_eq!(guard.list(&inbox).unwrap(), vec![job.id().clone()]);
        assert_eq!(guard.read(&inbox, job.id()).unwrap(), job);
        assert_eq!(guard.read_env(&inbox, job.id()).unwrap(), env);
        assert!(guard.create(&inbox, &job, &env).is_err());
    }

    #[test]
    fn create_in_missing_inbox() {
        let ctx = TestStore::new(1);
        let job = interactive_job("bob", 10, 1);
        let result = ctx.store.with_lock(|guard| {
            guard.create(&Location::Inbox("bob".into()), &job, &EnvSnapshot::default())
        });
        assert!(matches!(result, Err(SchedError::UnsupportedEnvironment(_))));
    }

    #[test]
    fn read_missing_record() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        let guard = ctx.store.lock().unwrap();
        assert!(matches!(
            guard.read(&Location::Pending, job.id()),
            Err(SchedError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_record_is_malformed() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        let path = ctx
            .root()
            .join("queue")
            .join(job.id().job_file_name());
        std::fs::write(&path, b"{\"time\": \"1").unwrap();
        let guard = ctx.store.lock().unwrap();
        assert!(matches!(
            guard.read(&Location::Pending, job.id()),
            Err(SchedError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn missing_env_is_malformed() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        let guard = ctx.store.lock().unwrap();
        guard.write(&Location::Pending, &job).unwrap();
        assert!(matches!(
            guard.read_env(&Location::Pending, job.id()),
            Err(SchedError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn symlinked_files_are_not_followed() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        let secret = ctx.root().join("secret");
        std::fs::write(&secret, b"{\"TOKEN\": \"hunter2\"}").unwrap();
        let dir = ctx.root().join("queue");
        {
            let guard = ctx.store.lock().unwrap();
            guard.write(&Location::Pending, &job).unwrap();
        }
        std::os::unix::fs::symlink(&secret, dir.join(job.id().env_file_name())).unwrap();

        let guard = ctx.store.lock().unwrap();
        assert!(matches!(
            guard.read_env(&Location::Pending, job.id()),
            Err(SchedError::MalformedRecord { .. })
        ));

        let other = interactive_job("alice", 11, 1);
        std::os::unix::fs::symlink(
            dir.join(job.id().job_file_name()),
            dir.join(other.id().job_file_name()),
        )
        .unwrap();
        assert!(!guard.contains(&Location::Pending, other.id()));
        assert!(matches!(
            guard.read(&Location::Pending, other.id()),
            Err(SchedError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn fifo_env_is_malformed() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        let guard = ctx.store.lock().unwrap();
        guard.write(&Location::Pending, &job).unwrap();
        let path = ctx.root().join("queue").join(job.id().env_file_name());
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRWXU).unwrap();
        assert!(matches!(
            guard.read_env(&Location::Pending, job.id()),
            Err(SchedError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn list_ignores_other_files_and_reports_bad_names() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        ctx.put(&Location::Pending, &job);
        let dir = ctx.root().join("queue");
        std::fs::write(dir.join("notes.txt"), b"hello").unwrap();
        std::fs::write(dir.join(".tmpXYZ"), b"partial").unwrap();
        std::fs::write(dir.join("garbage.job"), b"{}").unwrap();
        std::fs::create_dir(dir.join("subdir.job")).unwrap();

        let guard = ctx.store.lock().unwrap();
        let entries = guard.list_entries(&Location::Pending).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&RecordEntry::Job(job.id().clone())));
        assert!(entries.iter().any(
            |e| matches!(e, RecordEntry::Malformed { stem, .. } if stem == "garbage")
        ));
        assert_eq!(guard.list(&Location::Pending).unwrap(), vec![job.id().clone()]);

        guard.delete_stem(&Location::Pending, "garbage").unwrap();
        assert_eq!(guard.list_entries(&Location::Pending).unwrap().len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        ctx.put(&Location::Pending, &job);
        let guard = ctx.store.lock().unwrap();
        guard.delete(&Location::Pending, job.id()).unwrap();
        assert!(!guard.contains(&Location::Pending, job.id()));
        assert!(guard.read_env(&Location::Pending, job.id()).is_err());
        guard.delete(&Location::Pending, job.id()).unwrap();
    }

    #[test]
    fn relocate_moves_job_and_env() {
        let ctx = TestStore::new(2);
        let mut job = interactive_job("alice", 10, 1);
        ctx.put(&Location::Pending, &job);
        job.assign(100.0).unwrap();

        let guard = ctx.store.lock().unwrap();
        guard
            .relocate(&Location::Pending, &Location::Slot(1), &job)
            .unwrap();
        assert!(guard.list(&Location::Pending).unwrap().is_empty());
        assert_eq!(guard.read(&Location::Slot(1), job.id()).unwrap(), job);
        assert!(guard.read_env(&Location::Slot(1), job.id()).is_ok());
    }

    #[test]
    fn rewriting_destination_is_idempotent() {
        let ctx = TestStore::new(1);
        let job = interactive_job("alice", 10, 1);
        ctx.put(&Location::Pending, &job);
        let guard = ctx.store.lock().unwrap();
        guard
            .copy_to(&Location::Pending, &Location::Slot(0), &job)
            .unwrap();
        guard
            .relocate(&Location::Pending, &Location::Slot(0), &job)
            .unwrap();
        assert_eq!(guard.list(&Location::Slot(0)).unwrap(), vec![job.id().clone()]);
    }

    #[test]
    fn quota_files() {
        let ctx = TestStore::new(1);
        ctx.add_user("alice", 2.0);
        std::fs::write(ctx.root().join("addqueue").join("bob.quota"), "1.5\n").unwrap();
        std::fs::write(ctx.root().join("addqueue").join("eve.quota"), "lots").unwrap();
        let guard = ctx.store.lock().unwrap();
        assert_eq!(guard.users().unwrap(), vec!["alice".to_string()]);
        assert_eq!(guard.read_quota("alice").unwrap(), Some(2.0));
        assert_eq!(guard.read_quota("bob").unwrap(), Some(1.5));
        assert_eq!(guard.read_quota("carol").unwrap(), None);
        assert!(guard.read_quota("eve").is_err());
    }

    #[test]
    fn slot_contents() {
        let ctx = TestStore::new(3);
        let mut job = JobRecord::new(
            10.0,
            "alice",
            5,
            JobKind::Batch {
                command: "sleep 1".into(),
            },
            1.0,
            2,
        )
        .unwrap();
        job.assign(20.0).unwrap();
        ctx.put(&Location::Slot(0), &job);
        ctx.put(&Location::Slot(2), &job);
        std::fs::write(ctx.root().join("gpu/1/broken-name.job"), b"{}").unwrap();

        let contents = ctx.store.lock().unwrap().read_slots().unwrap();
        assert_eq!(contents.total_gpus(), 3);
        assert!(contents.free_gpus().is_empty());
        assert!(contents.shared_slots().is_empty());
        assert_eq!(contents.broken.len(), 1);
        let jobs = contents.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[job.id()].1, vec![0, 2]);
    }

    #[test]
    fn concurrent_writers_never_expose_partial_records() {
        let ctx = TestStore::new(1);
        let base = interactive_job("alice", 10, 1);
        ctx.put(&Location::Pending, &base);
        let root = ctx.root().to_path_buf();

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let root = root.clone();
                let mut record = base.clone();
                std::thread::spawn(move || {
                    let store = JobStore::open(&root, Duration::from_secs(10)).unwrap();
                    for n in 0..25 {
                        record.set_run_pid(i * 1000 + n);
                        store
                            .with_lock(|guard| guard.write(&Location::Pending, &record))
                            .unwrap();
                    }
                })
            })
            .collect();

        let reader_store = JobStore::open(&root, Duration::from_secs(10)).unwrap();
        for _ in 0..50 {
            let record = reader_store
                .with_lock(|guard| guard.read(&Location::Pending, base.id()))
                .unwrap();
            assert_eq!(record.id(), base.id());
        }
        for writer in writers {
            writer.join().unwrap();
        }
    }
}
