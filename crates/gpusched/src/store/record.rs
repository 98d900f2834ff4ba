use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::error::SchedError;
use crate::common::utils::time::hours_to_secs;
use crate::{Map, Pid};

pub const JOB_SUFFIX: &str = ".job";
pub const ENV_SUFFIX: &str = ".env";

/// Job type as it appears in record names and bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobType {
    Interactive,
    Batch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Interactive => "salloc",
            JobType::Batch => "sbatch",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "salloc" => Ok(JobType::Interactive),
            "sbatch" => Ok(JobType::Batch),
            _ => Err(format!("Unknown job type `{s}`").into()),
        }
    }
}

/// Identity of a job, encoded as `{time}-{user}-{type}-{pid}`.
///
/// The original name is kept as-is, so a record can always be addressed by the
/// file name it was found under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId {
    name: String,
    user: String,
    job_type: JobType,
    pid: Pid,
}

impl JobId {
    pub fn new(submit_time: f64, user: &str, job_type: JobType, pid: Pid) -> crate::Result<Self> {
        if user.is_empty() || user.contains('/') {
            return Err(format!("Invalid user name `{user}`").into());
        }
        Ok(Self {
            name: format!("{submit_time}-{user}-{job_type}-{pid}"),
            user: user.to_string(),
            job_type,
            pid,
        })
    }

    /// Parses a record stem (the file name without its suffix).
    pub fn parse(stem: &str) -> crate::Result<Self> {
        let malformed = |reason: &str| SchedError::malformed(stem, reason);
        let (time, rest) = stem
            .split_once('-')
            .ok_or_else(|| malformed("missing submission time"))?;
        let (rest, pid) = rest
            .rsplit_once('-')
            .ok_or_else(|| malformed("missing pid"))?;
        let (user, job_type) = rest
            .rsplit_once('-')
            .ok_or_else(|| malformed("missing job type"))?;
        time.parse::<f64>()
            .map_err(|_| malformed("invalid submission time"))?;
        let pid = pid.parse::<Pid>().map_err(|_| malformed("invalid pid"))?;
        let job_type = job_type
            .parse::<JobType>()
            .map_err(|_| malformed("invalid job type"))?;
        if user.is_empty() {
            return Err(malformed("empty user"));
        }
        Ok(Self {
            name: stem.to_string(),
            user: user.to_string(),
            job_type,
            pid,
        })
    }

    /// Parses a `.job` file name. Returns `None` for names of other files.
    pub fn from_file_name(file_name: &str) -> Option<crate::Result<Self>> {
        file_name.strip_suffix(JOB_SUFFIX).map(Self::parse)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Submission time, always valid because it was checked when the id was created.
    pub fn submit_time(&self) -> f64 {
        self.name
            .split_once('-')
            .and_then(|(time, _)| time.parse().ok())
            .unwrap_or_default()
    }

    pub fn job_file_name(&self) -> String {
        format!("{}{JOB_SUFFIX}", self.name)
    }

    pub fn env_file_name(&self) -> String {
        format!("{}{ENV_SUFFIX}", self.name)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Attached shell session, tracked but never launched by the daemon.
    Interactive,
    /// Command launched by the daemon on behalf of the user.
    Batch { command: String },
}

impl JobKind {
    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::Interactive => JobType::Interactive,
            JobKind::Batch { .. } => JobType::Batch,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    id: JobId,
    kind: JobKind,
    lifetime_hours: f64,
    num_gpu: u32,
    start: Option<f64>,
    end: Option<f64>,
    run_pid: Option<Pid>,
}

impl JobRecord {
    pub fn new(
        submit_time: f64,
        user: &str,
        pid: Pid,
        kind: JobKind,
        lifetime_hours: f64,
        num_gpu: u32,
    ) -> crate::Result<Self> {
        if num_gpu == 0 {
            return Err("A job has to request at least one GPU".into());
        }
        if !lifetime_hours.is_finite() || lifetime_hours <= 0.0 {
            return Err(format!("Invalid job lifetime {lifetime_hours}").into());
        }
        let id = JobId::new(submit_time, user, kind.job_type(), pid)?;
        Ok(Self {
            id,
            kind,
            lifetime_hours,
            num_gpu,
            start: None,
            end: None,
            run_pid: None,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn user(&self) -> &str {
        self.id.user()
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self.kind, JobKind::Interactive)
    }

    pub fn lifetime_hours(&self) -> f64 {
        self.lifetime_hours
    }

    pub fn num_gpu(&self) -> u32 {
        self.num_gpu
    }

    pub fn start(&self) -> Option<f64> {
        self.start
    }

    pub fn end(&self) -> Option<f64> {
        self.end
    }

    pub fn run_pid(&self) -> Option<Pid> {
        self.run_pid
    }

    pub fn is_assigned(&self) -> bool {
        self.end.is_some()
    }

    /// Marks the job as assigned at `now`. The end time can be set only once.
    pub fn assign(&mut self, now: f64) -> crate::Result<()> {
        if self.is_assigned() {
            return Err(SchedError::malformed(
                self.id.name(),
                "job has already been assigned",
            ));
        }
        self.start = Some(now);
        self.end = Some(now + hours_to_secs(self.lifetime_hours));
        Ok(())
    }

    pub fn set_run_pid(&mut self, pid: Pid) {
        self.run_pid = Some(pid);
    }

    /// Process whose lifetime defines the lifetime of the job.
    ///
    /// For interactive jobs it is the submitting client; for batch jobs it is the
    /// launched command, which is unknown until the daemon starts it.
    pub fn owner_pid(&self) -> Option<Pid> {
        match self.kind {
            JobKind::Interactive => Some(self.id.pid()),
            JobKind::Batch { .. } => self.run_pid,
        }
    }

    /// Assigned batch job whose command has not been started yet.
    pub fn is_awaiting_launch(&self) -> bool {
        matches!(self.kind, JobKind::Batch { .. }) && self.is_assigned() && self.run_pid.is_none()
    }

    pub fn is_expired(&self, now: f64) -> bool {
        self.end.map(|end| end < now).unwrap_or(false)
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&JobRecordFile::from(self))?)
    }

    /// Decodes a record body stored under `id`.
    /// The body has to agree with the identity encoded in the name.
    pub fn from_json(id: &JobId, data: &[u8]) -> crate::Result<Self> {
        let file: JobRecordFile = serde_json::from_slice(data)
            .map_err(|e| SchedError::malformed(id.name(), e.to_string()))?;
        file.into_record(id)
    }
}

/// On-disk representation of a job record. All values are strings, unset times are empty.
#[derive(Serialize, Deserialize)]
struct JobRecordFile {
    time: String,
    user: String,
    #[serde(rename = "type")]
    job_type: String,
    pid: String,
    cmd: String,
    life: String,
    num_gpu: String,
    start: String,
    end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_pid: Option<String>,
}

impl From<&JobRecord> for JobRecordFile {
    fn from(record: &JobRecord) -> Self {
        let time_opt = |t: Option<f64>| t.map(|t| t.to_string()).unwrap_or_default();
        let id = record.id();
        Self {
            time: id.submit_time().to_string(),
            user: id.user().to_string(),
            job_type: id.job_type().to_string(),
            pid: id.pid().to_string(),
            cmd: match &record.kind {
                JobKind::Interactive => String::new(),
                JobKind::Batch { command } => command.clone(),
            },
            life: record.lifetime_hours.to_string(),
            num_gpu: record.num_gpu.to_string(),
            start: time_opt(record.start),
            end: time_opt(record.end),
            run_pid: record.run_pid.map(|pid| pid.to_string()),
        }
    }
}

impl JobRecordFile {
    fn into_record(self, id: &JobId) -> crate::Result<JobRecord> {
        let malformed = |reason: String| SchedError::malformed(id.name(), reason);
        let parse_f64 = |field: &str, value: &str| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| malformed(format!("invalid `{field}` value `{value}`")))
        };
        let parse_opt = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Ok(None)
            } else {
                parse_f64(field, value).map(Some)
            }
        };

        if self.user != id.user() {
            return Err(malformed(format!("user `{}` does not match name", self.user)));
        }
        if self.job_type != id.job_type().as_str() {
            return Err(malformed(format!(
                "type `{}` does not match name",
                self.job_type
            )));
        }
        if self.pid.trim().parse::<Pid>().ok() != Some(id.pid()) {
            return Err(malformed(format!("pid `{}` does not match name", self.pid)));
        }
        if parse_f64("time", &self.time)? != id.submit_time() {
            return Err(malformed(format!("time `{}` does not match name", self.time)));
        }

        let kind = match id.job_type() {
            JobType::Interactive => JobKind::Interactive,
            JobType::Batch => {
                if self.cmd.trim().is_empty() {
                    return Err(malformed("batch job without a command".to_string()));
                }
                JobKind::Batch { command: self.cmd }
            }
        };
        let lifetime_hours = parse_f64("life", &self.life)?;
        if !lifetime_hours.is_finite() || lifetime_hours <= 0.0 {
            return Err(malformed(format!("invalid lifetime `{}`", self.life)));
        }
        let num_gpu = self
            .num_gpu
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| malformed(format!("invalid `num_gpu` value `{}`", self.num_gpu)))?;
        let start = parse_opt("start", &self.start)?;
        let end = parse_opt("end", &self.end)?;
        if start.is_some() != end.is_some() {
            return Err(malformed("only one of `start` and `end` is set".to_string()));
        }
        let run_pid = match self.run_pid {
            Some(pid) => Some(
                pid.trim()
                    .parse::<Pid>()
                    .map_err(|_| malformed(format!("invalid `run_pid` value `{pid}`")))?,
            ),
            None => None,
        };

        Ok(JobRecord {
            id: id.clone(),
            kind,
            lifetime_hours,
            num_gpu,
            start,
            end,
            run_pid,
        })
    }
}

/// Environment of the submitting process, captured at submission time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvSnapshot(Map<String, String>);

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(id: &JobId, data: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            SchedError::malformed(id.env_file_name(), format!("invalid environment: {e}"))
        })
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
