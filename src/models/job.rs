//! # Job
//!
//! Audit record of an asynchronous operation handed to the task executor. Written once
//! at submission and never mutated; live status comes from the executor itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: i64,
    /// Task identifier issued by the executor
    pub job_id: String,
    pub name: String,
    pub resource_id: Option<i64>,
    pub container_id: Option<i64>,
    /// Serialized invocation parameters
    pub params: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_id: String,
    pub name: String,
    pub resource_id: Option<i64>,
    pub container_id: Option<i64>,
    pub params: Value,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub resource_id: Option<i64>,
    pub container_id: Option<i64>,
    pub name: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.resource_id.map_or(true, |id| Some(id) == job.resource_id)
            && self
                .container_id
                .map_or(true, |id| Some(id) == job.container_id)
            && self.name.as_ref().map_or(true, |n| *n == job.name)
    }
}
