//! Timeline records, live log feeds and uploaded log files.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::TIME_FORMAT;
use crate::protocol::job::VariableValue;

/// Terminal result of a job or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskResult {
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimelineRecordState {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskLogReference {
    pub id: i64,
    pub location: Option<String>,
}

/// Log file created before its content is uploaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskLog {
    pub id: i64,
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_count: Option<i64>,
    pub created_on: String,
    pub last_changed_on: String,
}

impl TaskLog {
    pub fn new_file() -> Self {
        let now = now();
        Self {
            path: Some(format!("logs/{}", uuid::Uuid::new_v4())),
            created_on: now.clone(),
            last_changed_on: now,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineRecord {
    pub id: String,
    pub timeline_id: String,
    pub parent_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub start_time: String,
    pub finish_time: Option<String>,
    pub current_operation: Option<String>,
    pub percent_complete: i32,
    pub state: TimelineRecordState,
    pub result: Option<TaskResult>,
    pub result_code: Option<String>,
    pub change_id: i32,
    pub last_modified: String,
    pub worker_name: String,
    pub order: i32,
    pub ref_name: String,
    pub log: Option<TaskLogReference>,
    pub error_count: i32,
    pub warning_count: i32,
    pub location: String,
    pub attempt: i32,
    pub identifier: Option<String>,
    pub agent_platform: String,
    pub variables: HashMap<String, VariableValue>,
}

impl Default for TimelineRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            timeline_id: String::new(),
            parent_id: String::new(),
            kind: "Task".to_string(),
            name: String::new(),
            start_time: String::new(),
            finish_time: None,
            current_operation: None,
            percent_complete: 0,
            state: TimelineRecordState::Pending,
            result: None,
            result_code: None,
            change_id: 0,
            last_modified: String::new(),
            worker_name: String::new(),
            order: 1,
            ref_name: String::new(),
            log: None,
            error_count: 0,
            warning_count: 0,
            location: String::new(),
            attempt: 1,
            identifier: None,
            agent_platform: String::new(),
            variables: HashMap::new(),
        }
    }
}

impl TimelineRecord {
    /// A pending `Task` record with a fresh id.
    pub fn new(parent_id: impl Into<String>, ref_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: parent_id.into(),
            ref_name: ref_name.into(),
            name: name.into(),
            worker_name: crate::protocol::agent::os_description(),
            last_modified: now(),
            ..Default::default()
        }
    }

    pub fn start(&mut self) {
        let now = now();
        self.percent_complete = 0;
        self.state = TimelineRecordState::InProgress;
        self.start_time = now.clone();
        self.finish_time = None;
        self.last_modified = now;
    }

    pub fn complete(&mut self, result: TaskResult) {
        let now = now();
        self.percent_complete = 100;
        self.state = TimelineRecordState::Completed;
        self.finish_time = Some(now.clone());
        self.last_modified = now;
        self.result = Some(result);
    }

    pub fn is_completed(&self) -> bool {
        self.state == TimelineRecordState::Completed
    }
}

/// Full set of records sent on every timeline update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineRecordWrapper {
    pub count: i64,
    pub value: Vec<TimelineRecord>,
}

impl TimelineRecordWrapper {
    pub fn new(value: Vec<TimelineRecord>) -> Self {
        Self {
            count: value.len() as i64,
            value,
        }
    }
}

/// Chunk of live console lines for one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineRecordFeedLinesWrapper {
    pub count: i64,
    pub value: Vec<String>,
    pub step_id: String,
    pub start_line: Option<i64>,
}

impl TimelineRecordFeedLinesWrapper {
    pub fn new(step_id: impl Into<String>, start_line: i64, lines: Vec<String>) -> Self {
        Self {
            count: lines.len() as i64,
            value: lines,
            step_id: step_id.into(),
            start_line: Some(start_line),
        }
    }

    /// Append a later chunk of the same step.
    pub fn extend(&mut self, other: TimelineRecordFeedLinesWrapper) {
        self.count += other.count;
        self.value.extend(other.value);
    }
}

fn now() -> String {
    chrono::Utc::now().format(TIME_FORMAT).to_string()
}
