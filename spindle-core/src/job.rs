//! Jobs and their persisted records.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_repr::*;

use crate::error::{Error, RemoteError, Result};
use crate::util;
use crate::value::Value;

/// Number of hash bytes making up a job id.
const JOB_ID_BYTES: usize = 16;

/// Unique job identifier, 32 lowercase hex characters.
///
/// Ids are validated on deserialization too, since they end up in file
/// names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if s.len() != JOB_ID_BYTES * 2 || !util::is_hex(s) {
            return Err(Error::InvalidJobId(s.to_string()));
        }
        Ok(JobId(s.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates job ids out of job content mixed with randomness.
///
/// Each generator carries its own random salt and counter, so two
/// generators submitting identical jobs still produce distinct ids.
#[derive(Debug)]
pub struct JobIdGenerator {
    salt: [u8; 32],
    counter: u64,
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIdGenerator {
    pub fn new() -> Self {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { salt, counter: 0 }
    }

    pub fn next(&mut self, function: &str, args: &[Value]) -> JobId {
        self.counter += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.salt);
        hasher.update(&self.counter.to_le_bytes());
        hasher.update(function.as_bytes());
        // fall back to the debug form if the arguments can't be encoded
        match bincode::serialize(args) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(format!("{:?}", args).as_bytes()),
        };
        hasher.update(&rand::random::<u64>().to_le_bytes());
        let hash = hasher.finalize();
        JobId(util::to_hex(&hash.as_bytes()[..JOB_ID_BYTES]))
    }
}

/// Lifecycle of a job. Only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum JobStatus {
    Queued = 0,
    Processing = 1,
    Finished = 2,
    Crashed = 3,
}

impl JobStatus {
    pub fn to_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Crashed => "crashed",
        }
    }

    /// Final statuses are never left.
    pub fn is_final(&self) -> bool {
        match self {
            JobStatus::Finished | JobStatus::Crashed => true,
            _ => false,
        }
    }

    /// Checks whether moving to `next` keeps the lifecycle monotonic.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (*self, next) {
            (Queued, Processing) | (Queued, Crashed) => true,
            (Processing, Finished) | (Processing, Crashed) => true,
            _ => false,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Job as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    /// Name of the job function in the worker registry
    pub function: String,
    pub args: Vec<Value>,
    pub kwds: BTreeMap<String, Value>,
}

/// Durable state of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub function: String,
    pub status: JobStatus,
    pub result: Option<std::result::Result<Value, RemoteError>>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn queued(spec: &JobSpec) -> Self {
        Self {
            id: spec.id.clone(),
            function: spec.function.clone(),
            status: JobStatus::Queued,
            result: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Moves the record forward, refusing transitions that would go back.
    pub fn advance(&mut self, status: JobStatus) -> Result<()> {
        if !self.status.can_advance_to(status) {
            return Err(Error::Other(format!(
                "job {}: invalid status transition {} -> {}",
                self.id, self.status, status
            )));
        }
        self.status = status;
        if status.is_final() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Stores the outcome, marking the job finished or crashed.
    pub fn complete(&mut self, outcome: std::result::Result<Value, RemoteError>) -> Result<()> {
        let status = match outcome {
            Ok(_) => JobStatus::Finished,
            Err(_) => JobStatus::Crashed,
        };
        if self.status == JobStatus::Queued && status == JobStatus::Finished {
            self.advance(JobStatus::Processing)?;
        }
        self.advance(status)?;
        self.result = Some(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_unique_for_same_content() {
        let mut gen = JobIdGenerator::new();
        let a = gen.next("square", &[Value::Int(2)]);
        let b = gen.next("square", &[Value::Int(2)]);
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.as_str().parse::<JobId>().unwrap(), a);
        assert!("../etc/passwd".parse::<JobId>().is_err());
    }

    #[test]
    fn status_is_monotonic() {
        use JobStatus::*;
        assert!(Queued.can_advance_to(Processing));
        assert!(Queued.can_advance_to(Crashed));
        assert!(Processing.can_advance_to(Finished));
        assert!(Processing.can_advance_to(Crashed));
        assert!(!Processing.can_advance_to(Queued));
        assert!(!Finished.can_advance_to(Crashed));
        assert!(!Crashed.can_advance_to(Finished));
        assert!(!Queued.can_advance_to(Queued));
    }

    #[test]
    fn record_completion() {
        let mut gen = JobIdGenerator::new();
        let spec = JobSpec {
            id: gen.next("square", &[]),
            function: "square".to_string(),
            args: vec![],
            kwds: BTreeMap::new(),
        };
        let mut record = JobRecord::queued(&spec);
        record.complete(Ok(Value::Int(4))).unwrap();
        assert_eq!(record.status, JobStatus::Finished);
        assert!(record.finished_at.is_some());
        assert!(record.complete(Ok(Value::Int(5))).is_err());
    }
}
