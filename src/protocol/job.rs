//! Job request payload and the messages sent back about a job.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};

use crate::protocol::timeline::TaskResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOrchestrationPlanReference {
    pub scope_identifier: String,
    pub plan_type: String,
    pub version: i32,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineReference {
    pub id: String,
    pub change_id: i64,
    pub location: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableValue {
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_secret: bool,
}

impl VariableValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_secret: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointAuthorization {
    pub parameters: HashMap<String, String>,
    pub scheme: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobEndpoint {
    pub name: String,
    pub url: String,
    pub authorization: EndpointAuthorization,
    pub data: HashMap<String, String>,
    pub is_shared: bool,
    pub is_ready: bool,
}

impl JobEndpoint {
    /// Name of the endpoint that carries the job-scoped service connection.
    pub const SYSTEM_CONNECTION: &'static str = "SystemVssConnection";

    pub fn access_token(&self) -> Option<&str> {
        self.authorization
            .parameters
            .get("AccessToken")
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobResources {
    pub endpoints: Option<Vec<JobEndpoint>>,
}

/// Server-provided redaction rule.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaskHint {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionStepDefinitionReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub image: String,
    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository_type: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionStep {
    #[serde(rename = "type")]
    pub kind: String,
    pub reference: ActionStepDefinitionReference,
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub display_name_token: Option<TemplateToken>,
    pub context_name: String,
    pub condition: String,
    pub inputs: Option<TemplateToken>,
    pub environment: Option<TemplateToken>,
    pub continue_on_error: Option<TemplateToken>,
    pub timeout_in_minutes: Option<TemplateToken>,
}

/// Decrypted `PipelineAgentJobRequest` body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentJobRequestMessage {
    pub message_type: String,
    pub plan: Option<TaskOrchestrationPlanReference>,
    pub timeline: Option<TimelineReference>,
    pub job_id: String,
    pub job_display_name: String,
    pub job_name: String,
    pub job_container: Option<TemplateToken>,
    pub job_service_containers: Option<TemplateToken>,
    pub job_outputs: Option<TemplateToken>,
    pub request_id: i64,
    pub locked_until: String,
    pub resources: Option<JobResources>,
    pub context_data: HashMap<String, PipelineContextData>,
    #[serde(alias = "maskHints")]
    pub mask: Vec<MaskHint>,
    pub environment_variables: Vec<TemplateToken>,
    pub defaults: Vec<TemplateToken>,
    pub steps: Vec<ActionStep>,
    pub variables: HashMap<String, VariableValue>,
    pub file_table: Vec<String>,
}

impl AgentJobRequestMessage {
    pub fn plan(&self) -> TaskOrchestrationPlanReference {
        self.plan.clone().unwrap_or_default()
    }

    pub fn timeline_id(&self) -> &str {
        self.timeline.as_ref().map(|t| t.id.as_str()).unwrap_or("")
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|v| v.value.as_str())
    }

    /// Context entry converted to plain JSON.
    pub fn context(&self, name: &str) -> Option<Value> {
        self.context_data.get(name).map(PipelineContextData::to_json)
    }

    /// The `SystemVssConnection` endpoint, if it carries an access token.
    pub fn system_connection(&self) -> Option<&JobEndpoint> {
        self.resources
            .as_ref()?
            .endpoints
            .as_ref()?
            .iter()
            .find(|e| {
                e.name.eq_ignore_ascii_case(JobEndpoint::SYSTEM_CONNECTION) && e.access_token().is_some()
            })
    }
}

/// Compact expression-context value (`t`ype, `s`tring, `b`ool, `n`umber,
/// `a`rray, `d`ictionary). Bare JSON scalars are accepted as well.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineContextData {
    Null,
    String(String),
    Array(Vec<PipelineContextData>),
    Dictionary(Vec<(String, PipelineContextData)>),
    Bool(bool),
    Number(f64),
}

impl PipelineContextData {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Dictionary(pairs) => Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => number(*n),
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => Ok(Self::Number(n.as_f64().unwrap_or_default())),
            Value::String(s) => Ok(Self::String(s)),
            Value::Array(_) => Err("context data cannot be a bare array".to_string()),
            Value::Object(mut obj) => {
                let kind = obj.get("t").and_then(Value::as_i64).unwrap_or(0);
                match kind {
                    0 => Ok(Self::String(
                        obj.remove("s")
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default(),
                    )),
                    1 => {
                        let items = match obj.remove("a") {
                            Some(Value::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        items
                            .into_iter()
                            .map(Self::from_value)
                            .collect::<Result<_, _>>()
                            .map(Self::Array)
                    }
                    2 => {
                        let pairs = match obj.remove("d") {
                            Some(Value::Array(pairs)) => pairs,
                            _ => Vec::new(),
                        };
                        let mut out = Vec::with_capacity(pairs.len());
                        for pair in pairs {
                            let Value::Object(mut pair) = pair else {
                                return Err("dictionary entry is not an object".to_string());
                            };
                            let key = pair
                                .remove("k")
                                .and_then(|k| k.as_str().map(str::to_string))
                                .ok_or("dictionary entry without key")?;
                            let value = Self::from_value(pair.remove("v").unwrap_or(Value::Null))?;
                            out.push((key, value));
                        }
                        Ok(Self::Dictionary(out))
                    }
                    3 => Ok(Self::Bool(
                        obj.get("b").and_then(Value::as_bool).unwrap_or_default(),
                    )),
                    4 => Ok(Self::Number(
                        obj.get("n").and_then(Value::as_f64).unwrap_or_default(),
                    )),
                    other => Err(format!("unknown context data type {}", other)),
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for PipelineContextData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// Workflow template token. Literal tokens appear either bare or as
/// `{type, lit|bool|num}` objects, collections as `seq`/`map`, and
/// unevaluated expressions as `expr`/`directive`.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateToken {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Sequence(Vec<TemplateToken>),
    Mapping(Vec<(TemplateToken, TemplateToken)>),
    Expression(String),
    Insert,
}

impl TemplateToken {
    /// Plain JSON view. Expressions become `${{ expr }}` strings and mapping
    /// keys are stringified.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => number(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Sequence(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Mapping(pairs) => Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.key_string(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            Self::Expression(expr) => Value::String(format!("${{{{ {} }}}}", expr)),
            Self::Insert => Value::String("${{ insert }}".to_string()),
        }
    }

    fn key_string(&self) -> String {
        match self.to_json() {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }

    /// String literal content, if this token is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => Ok(Self::Number(n.as_f64().unwrap_or_default())),
            Value::String(s) => Ok(Self::String(s)),
            Value::Array(items) => items
                .into_iter()
                .map(Self::from_value)
                .collect::<Result<_, _>>()
                .map(Self::Sequence),
            Value::Object(mut obj) => {
                let kind = obj.get("type").and_then(Value::as_i64).unwrap_or(0);
                match kind {
                    0 => Ok(Self::String(
                        obj.remove("lit")
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default(),
                    )),
                    1 => {
                        let items = match obj.remove("seq") {
                            Some(Value::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        items
                            .into_iter()
                            .map(Self::from_value)
                            .collect::<Result<_, _>>()
                            .map(Self::Sequence)
                    }
                    2 => {
                        let pairs = match obj.remove("map") {
                            Some(Value::Array(pairs)) => pairs,
                            _ => Vec::new(),
                        };
                        let mut out = Vec::with_capacity(pairs.len());
                        for pair in pairs {
                            let Value::Object(mut pair) = pair else {
                                return Err("mapping entry is not an object".to_string());
                            };
                            let key = pair
                                .remove("Key")
                                .or_else(|| pair.remove("key"))
                                .unwrap_or(Value::Null);
                            let value = pair
                                .remove("Value")
                                .or_else(|| pair.remove("value"))
                                .unwrap_or(Value::Null);
                            out.push((Self::from_value(key)?, Self::from_value(value)?));
                        }
                        Ok(Self::Mapping(out))
                    }
                    3 => Ok(Self::Expression(
                        obj.remove("expr")
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default(),
                    )),
                    4 => Ok(Self::Insert),
                    5 => Ok(Self::Bool(
                        obj.get("bool").and_then(Value::as_bool).unwrap_or_default(),
                    )),
                    6 => Ok(Self::Number(
                        obj.get("num").and_then(Value::as_f64).unwrap_or_default(),
                    )),
                    7 => Ok(Self::Null),
                    other => Err(format!("unknown template token type {}", other)),
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for TemplateToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// Integral floats render as JSON integers so `1` stays `1`, not `1.0`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Completion report for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub name: String,
    pub job_id: String,
    pub request_id: i64,
    pub result: TaskResult,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outputs: Option<HashMap<String, VariableValue>>,
}

impl JobEvent {
    pub fn completed(job_id: impl Into<String>, request_id: i64, result: TaskResult) -> Self {
        Self {
            name: "JobCompleted".to_string(),
            job_id: job_id.into(),
            request_id,
            result,
            outputs: None,
        }
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, VariableValue>) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

/// Lock renewal body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewAgent {
    pub request_id: i64,
}
