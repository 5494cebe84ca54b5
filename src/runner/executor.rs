//! The boundary between the protocol engine and whatever runs job steps.
//!
//! [`ExecutionRequest::from_job`] turns a decoded job request into the
//! plain inputs an executor needs. [`run_guarded`] invokes the executor and
//! converts a panic into an error so a faulty executor never takes the
//! worker down.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, ExecutorError};
use crate::protocol::job::{ActionStep, AgentJobRequestMessage, TemplateToken};
use crate::protocol::timeline::TaskResult;
use crate::runner::timeline::{JobLog, StepRecord};

const GITHUB_TOKEN_VARIABLE: &str = "system.github.token";
const STEP_DEBUG_VARIABLE: &str = "ACTIONS_STEP_DEBUG";

/// Runs the steps of one job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute `request`. Progress goes through `ctx.log`; the executor
    /// stops as soon as `ctx.cancel` fires.
    async fn execute(&self, request: ExecutionRequest, ctx: ExecutionContext) -> Result<JobOutcome, ExecutorError>;
}

/// Cancellation and log sink for one job.
#[derive(Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub log: JobLog,
}

/// Terminal status reported by an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub result: TaskResult,
    pub outputs: HashMap<String, String>,
}

impl JobOutcome {
    pub fn new(result: TaskResult) -> Self {
        Self {
            result,
            outputs: HashMap::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, String>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// One step ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub id: String,
    pub ref_name: String,
    pub display_name: String,
    /// Reference type, `script` for inline scripts.
    pub kind: String,
    /// Action name or image for non-script steps.
    pub uses: String,
    pub condition: String,
    pub inputs: Map<String, Value>,
    pub env: HashMap<String, String>,
    pub continue_on_error: bool,
    pub timeout: Option<Duration>,
}

impl StepRequest {
    fn from_step(step: &ActionStep) -> Self {
        let display_name = [
            step.display_name.as_str(),
            step.display_name_token
                .as_ref()
                .and_then(TemplateToken::as_str)
                .unwrap_or(""),
            step.name.as_str(),
            step.context_name.as_str(),
            step.id.as_str(),
        ]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("step")
        .to_string();

        let ref_name = if step.context_name.is_empty() {
            step.id.clone()
        } else {
            step.context_name.clone()
        };

        let inputs = match step.inputs.as_ref().map(TemplateToken::to_json) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let env = match step.environment.as_ref().map(TemplateToken::to_json) {
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| (k, value_string(v)))
                .collect(),
            _ => HashMap::new(),
        };

        let continue_on_error = match step.continue_on_error.as_ref() {
            Some(TemplateToken::Bool(b)) => *b,
            Some(TemplateToken::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };

        let timeout = match step.timeout_in_minutes.as_ref() {
            Some(TemplateToken::Number(n)) if *n > 0.0 => Some(Duration::from_secs_f64(n * 60.0)),
            Some(TemplateToken::String(s)) => s
                .parse::<f64>()
                .ok()
                .filter(|n| *n > 0.0)
                .map(|n| Duration::from_secs_f64(n * 60.0)),
            _ => None,
        };

        let uses = if step.reference.image.is_empty() {
            step.reference.name.clone()
        } else {
            step.reference.image.clone()
        };

        Self {
            id: step.id.clone(),
            ref_name,
            display_name,
            kind: step.reference.kind.clone(),
            uses,
            condition: step.condition.clone(),
            inputs,
            env,
            continue_on_error,
            timeout,
        }
    }

    pub fn is_script(&self) -> bool {
        self.kind.eq_ignore_ascii_case("script")
    }

    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_str)
    }
}

/// Everything an executor gets from a job request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub request_id: i64,
    pub display_name: String,
    pub steps: Vec<StepRequest>,
    /// Job environment, including the runtime endpoints.
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub github: Value,
    pub matrix: Map<String, Value>,
    pub needs: Value,
    pub inputs: Value,
    /// Declared job outputs, name to unevaluated value.
    pub outputs: HashMap<String, String>,
    pub debug: bool,
}

impl ExecutionRequest {
    pub fn from_job(job: &AgentJobRequestMessage) -> Result<Self, DispatchError> {
        let invalid = |reason: &str| DispatchError::InvalidJob(reason.to_string());

        let resources = job.resources.as_ref().ok_or_else(|| invalid("Missing Job Resources"))?;
        if resources.endpoints.is_none() {
            return Err(invalid("Missing Job Resources Endpoints"));
        }

        let github = job
            .context("github")
            .filter(Value::is_object)
            .ok_or_else(|| invalid("missing github context in ContextData"))?;

        let matrix = match job.context("matrix") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(invalid("matrix: not a map")),
        };

        let mut env = HashMap::new();
        for token in &job.environment_variables {
            match token.to_json() {
                Value::Object(map) => {
                    for (k, v) in map {
                        match v {
                            Value::String(s) => {
                                env.insert(k, s);
                            }
                            _ => {
                                return Err(DispatchError::InvalidJob(format!(
                                    "env: value of {} is not a string",
                                    k
                                )));
                            }
                        }
                    }
                }
                Value::Null => {}
                _ => return Err(invalid("env: not a map")),
            }
        }
        env.extend(runtime_env(job));

        let mut secrets = HashMap::new();
        for (name, variable) in &job.variables {
            if name == GITHUB_TOKEN_VARIABLE {
                secrets.insert("GITHUB_TOKEN".to_string(), variable.value.clone());
            } else if variable.is_secret {
                secrets.insert(name.clone(), variable.value.clone());
            }
        }

        let outputs = match job.job_outputs.as_ref().map(TemplateToken::to_json) {
            Some(Value::Object(map)) => map.into_iter().map(|(k, v)| (k, value_string(v))).collect(),
            _ => HashMap::new(),
        };

        Ok(Self {
            job_id: job.job_id.clone(),
            request_id: job.request_id,
            display_name: job.job_display_name.clone(),
            steps: job.steps.iter().map(StepRequest::from_step).collect(),
            env,
            secrets,
            github,
            matrix,
            needs: job.context("needs").unwrap_or(Value::Null),
            inputs: job.context("inputs").unwrap_or(Value::Null),
            outputs,
            debug: step_debug(job),
        })
    }

    /// Timeline entries for the steps.
    pub fn step_records(&self) -> Vec<StepRecord> {
        self.steps
            .iter()
            .map(|s| StepRecord {
                ref_name: s.ref_name.clone(),
                display_name: s.display_name.clone(),
            })
            .collect()
    }
}

/// Whether the job asked for debug output (`ACTIONS_STEP_DEBUG`).
pub fn step_debug(job: &AgentJobRequestMessage) -> bool {
    job.variable(STEP_DEBUG_VARIABLE)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// `ACTIONS_*` variables derived from the system connection endpoint.
fn runtime_env(job: &AgentJobRequestMessage) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let Some(endpoint) = job.system_connection() else {
        return env;
    };
    let token = endpoint.access_token().unwrap_or_default().to_string();
    env.insert("ACTIONS_RUNTIME_URL".to_string(), endpoint.url.clone());
    env.insert("ACTIONS_RUNTIME_TOKEN".to_string(), token.clone());
    if let Some(cache) = endpoint.data.get("CacheServerUrl").filter(|u| !u.is_empty()) {
        env.insert("ACTIONS_CACHE_URL".to_string(), cache.clone());
    }
    if let Some(id_token) = endpoint.data.get("GenerateIdTokenUrl").filter(|u| !u.is_empty()) {
        env.insert("ACTIONS_ID_TOKEN_REQUEST_URL".to_string(), id_token.clone());
        env.insert("ACTIONS_ID_TOKEN_REQUEST_TOKEN".to_string(), token);
    }
    env
}

fn value_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Run the executor, turning a panic into [`ExecutorError::Panicked`].
pub async fn run_guarded(
    executor: &dyn JobExecutor,
    request: ExecutionRequest,
    ctx: ExecutionContext,
) -> Result<JobOutcome, ExecutorError> {
    match AssertUnwindSafe(executor.execute(request, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(ExecutorError::Panicked {
                message,
                backtrace: std::backtrace::Backtrace::force_capture().to_string(),
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ProtocolTimings;
    use crate::runner::masking::SecretMasker;
    use crate::runner::testing::FakeService;
    use crate::runner::timeline::TimelineReporter;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    pub(crate) fn job_json() -> Value {
        json!({
            "jobId": "job-1",
            "requestId": 42,
            "jobDisplayName": "Build",
            "jobName": "build",
            "plan": {"scopeIdentifier": "scope", "planType": "actions", "planId": "plan"},
            "timeline": {"id": "tl"},
            "resources": {"endpoints": [{
                "name": "SystemVssConnection",
                "url": "https://pipelines.example.com/job/",
                "authorization": {"scheme": "OAuth", "parameters": {"AccessToken": "job-token"}},
                "data": {"CacheServerUrl": "https://cache.example.com/", "GenerateIdTokenUrl": "https://oidc.example.com/"}
            }]},
            "contextData": {
                "github": {"t": 2, "d": [{"k": "repository", "v": "octo/hello"}]},
                "matrix": {"t": 2, "d": [{"k": "os", "v": "linux"}]}
            },
            "environmentVariables": [{"type": 2, "map": [{"Key": "CI", "Value": "true"}]}],
            "variables": {
                "system.github.token": {"value": "ghs_token", "isSecret": true},
                "deploy_key": {"value": "k3y", "isSecret": true},
                "plain": {"value": "p"},
                "ACTIONS_STEP_DEBUG": {"value": "True"}
            },
            "jobOutputs": {"type": 2, "map": [{"Key": "version", "Value": {"type": 3, "expr": "steps.v.outputs.v"}}]},
            "steps": [
                {
                    "id": "s1",
                    "contextName": "greet",
                    "displayNameToken": "Say hello",
                    "reference": {"type": "script"},
                    "inputs": {"type": 2, "map": [{"Key": "script", "Value": "echo hi"}]},
                    "environment": {"type": 2, "map": [{"Key": "N", "Value": {"type": 6, "num": 2}}]},
                    "continueOnError": {"type": 5, "bool": true},
                    "timeoutInMinutes": {"type": 6, "num": 5}
                },
                {"id": "s2", "reference": {"type": "repository", "name": "actions/checkout"}}
            ]
        })
    }

    pub(crate) fn job() -> AgentJobRequestMessage {
        serde_json::from_value(job_json()).unwrap()
    }

    #[test]
    fn test_from_job() {
        let request = ExecutionRequest::from_job(&job()).unwrap();

        assert_eq!(request.request_id, 42);
        assert_eq!(request.env["CI"], "true");
        assert_eq!(request.env["ACTIONS_RUNTIME_URL"], "https://pipelines.example.com/job/");
        assert_eq!(request.env["ACTIONS_RUNTIME_TOKEN"], "job-token");
        assert_eq!(request.env["ACTIONS_CACHE_URL"], "https://cache.example.com/");
        assert_eq!(request.env["ACTIONS_ID_TOKEN_REQUEST_URL"], "https://oidc.example.com/");
        assert_eq!(request.env["ACTIONS_ID_TOKEN_REQUEST_TOKEN"], "job-token");

        assert_eq!(request.secrets.len(), 2);
        assert_eq!(request.secrets["GITHUB_TOKEN"], "ghs_token");
        assert_eq!(request.secrets["deploy_key"], "k3y");
        assert!(request.debug);

        assert_eq!(request.github["repository"], "octo/hello");
        assert_eq!(request.matrix["os"], "linux");
        assert_eq!(request.outputs["version"], "${{ steps.v.outputs.v }}");

        let first = &request.steps[0];
        assert_eq!(first.ref_name, "greet");
        assert_eq!(first.display_name, "Say hello");
        assert!(first.is_script());
        assert_eq!(first.input("script"), Some("echo hi"));
        assert_eq!(first.env["N"], "2");
        assert!(first.continue_on_error);
        assert_eq!(first.timeout, Some(Duration::from_secs(300)));

        let second = &request.steps[1];
        assert_eq!(second.ref_name, "s2");
        assert_eq!(second.uses, "actions/checkout");
        assert!(!second.is_script());
    }

    #[test]
    fn test_invalid_jobs() {
        let reject = |patch: fn(&mut Value)| {
            let mut value = job_json();
            patch(&mut value);
            let job: AgentJobRequestMessage = serde_json::from_value(value).unwrap();
            ExecutionRequest::from_job(&job).unwrap_err().to_string()
        };

        assert!(reject(|v| {
            v.as_object_mut().unwrap().remove("resources");
        })
        .contains("Missing Job Resources"));
        assert!(reject(|v| v["resources"] = json!({})).contains("Endpoints"));
        assert!(reject(|v| {
            v["contextData"].as_object_mut().unwrap().remove("github");
        })
        .contains("github context"));
        assert!(reject(|v| v["contextData"]["matrix"] = json!("linux")).contains("matrix"));
        assert!(
            reject(|v| v["environmentVariables"] = json!([{"type": 2, "map": [{"Key": "N", "Value": 1}]}]))
                .contains("not a string")
        );
    }

    struct Panicking;

    #[async_trait]
    impl JobExecutor for Panicking {
        async fn execute(&self, _request: ExecutionRequest, _ctx: ExecutionContext) -> Result<JobOutcome, ExecutorError> {
            panic!("boom");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained() {
        let service = FakeService::new();
        let job = job();
        let (reporter, batcher) = TimelineReporter::start(
            Arc::new(service),
            &job,
            SecretMasker::new(Vec::new(), Vec::new()),
            false,
            &ProtocolTimings::default(),
        )
        .await;
        let ctx = ExecutionContext {
            cancel: CancellationToken::new(),
            log: reporter.job_log(),
        };

        let err = run_guarded(&Panicking, ExecutionRequest::from_job(&job).unwrap(), ctx)
            .await
            .unwrap_err();
        batcher.shutdown().await;

        match err {
            ExecutorError::Panicked { message, .. } => assert_eq!(message, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
