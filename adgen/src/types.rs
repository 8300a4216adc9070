//! Common type definitions shared across the ledger, queue and API layers.
//!
//! # ID Types
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`UserId`]: owner of a credit account and of generation jobs
//! - [`JobId`]: a generation job
//! - [`TransactionId`]: an immutable credit transaction
//! - [`ReservationId`]: the `reserve` transaction that acts as a job's settlement handle
//! - [`WorkerId`]: the worker pool instance holding a claim
//! - [`ClaimId`]: a single exclusive claim of a job by a worker

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type UserId = Uuid;
pub type JobId = Uuid;
pub type TransactionId = Uuid;
pub type ReservationId = TransactionId;
pub type WorkerId = Uuid;
pub type ClaimId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Kind of creative being generated. Each task type has its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Text,
    Image,
    Video,
    Speech,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [TaskType::Text, TaskType::Image, TaskType::Video, TaskType::Speech];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Text => "text",
            TaskType::Image => "image",
            TaskType::Video => "video",
            TaskType::Speech => "speech",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(TaskType::Text),
            "image" => Ok(TaskType::Image),
            "video" => Ok(TaskType::Video),
            "speech" => Ok(TaskType::Speech),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// A billable operation key from the credit cost table, e.g. `image` or `text-variations`.
///
/// The prefix before the first `-` names the task type the operation runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Operation {
    key: String,
    task: TaskType,
}

impl Operation {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn task(&self) -> TaskType {
        self.task
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let prefix = s.split('-').next().unwrap_or_default();
        let task = prefix.parse::<TaskType>()?;
        Ok(Self { key: s.to_string(), task })
    }
}

impl TryFrom<String> for Operation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.key
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Credit account tier. Unlimited accounts skip the balance check on reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Standard,
    Unlimited,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Unlimited => "unlimited",
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Tier::Standard),
            "unlimited" => Ok(Tier::Unlimited),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}
