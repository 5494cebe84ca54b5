//! Default [`JobExecutor`]: runs `script` steps with a shell on the host.
//!
//! Each script is written to `<work_dir>/_temp/<uuid>.sh` and run through
//! the step's `shell` input (`bash`, `sh`, `python` or a template with
//! `{0}`), defaulting to `bash -eo pipefail` or `sh -e`. Output lines are
//! streamed to the job log. Values written to `$GITHUB_OUTPUT` become step
//! outputs and resolve declared job outputs of the form
//! `${{ steps.<id>.outputs.<name> }}`.
//!
//! Scripts and step env values may reference `github`, `matrix`, `needs`,
//! `inputs`, `secrets` and `env` by dotted path, e.g. `${{ matrix.os }}`.
//! Other expressions are passed through untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::ExecutorError;
use crate::protocol::timeline::TaskResult;
use crate::runner::executor::{ExecutionContext, ExecutionRequest, JobExecutor, JobOutcome, StepRequest};
use crate::runner::timeline::JobLog;

/// GitHub's default job timeout.
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(360 * 60);

/// How long output readers may run after the step process is gone.
/// Background processes that escaped the kill can hold the pipes open.
const OUTPUT_DRAIN: Duration = Duration::from_secs(5);

/// Context fields exported as `GITHUB_<NAME>`.
const GITHUB_ENV_FIELDS: &[&str] = &[
    "repository",
    "repository_owner",
    "sha",
    "ref",
    "ref_name",
    "run_id",
    "run_number",
    "run_attempt",
    "actor",
    "event_name",
    "workflow",
    "job",
    "server_url",
    "api_url",
];

fn job_output_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\$\{\{\s*steps\.([\w-]+)\.outputs\.([\w-]+)\s*\}\}$").expect("valid job output regex")
    })
}

fn context_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{\{\s*(github|matrix|needs|inputs|secrets|env)((?:\.[\w-]+)+)\s*\}\}")
            .expect("valid context regex")
    })
}

/// How a step process ended.
enum Exit {
    Code(i32),
    Cancelled,
}

pub struct HostExecutor {
    work_dir: PathBuf,
    timeout: Duration,
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self {
            work_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join("_work"),
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl HostExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workspace for jobs; scripts run here unless a step says otherwise.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Timeout for steps that do not declare one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_step(
        &self,
        request: &ExecutionRequest,
        step: &StepRequest,
        outputs: &mut HashMap<String, HashMap<String, String>>,
        ctx: &ExecutionContext,
    ) -> TaskResult {
        if !step.is_script() {
            ctx.log
                .error(&format!(
                    "{} steps are not supported by this runner ({})",
                    step.kind, step.uses
                ))
                .await;
            return TaskResult::Failed;
        }
        let Some(script) = step.input("script") else {
            ctx.log.error("The step has no script").await;
            return TaskResult::Failed;
        };

        let temp = self.work_dir.join("_temp");
        let output_file = temp.join(format!("output-{}", uuid::Uuid::new_v4()));
        match self.run_script(request, step, script, &output_file, ctx).await {
            Ok(Exit::Code(0)) => {
                let values = read_outputs(&output_file).await;
                if !values.is_empty() {
                    outputs.insert(step.ref_name.clone(), values);
                }
                TaskResult::Succeeded
            }
            Ok(Exit::Code(code)) => {
                ctx.log
                    .error(&format!("Process completed with exit code {}.", code))
                    .await;
                TaskResult::Failed
            }
            Ok(Exit::Cancelled) => {
                ctx.log.error("The operation was canceled.").await;
                TaskResult::Canceled
            }
            Err(ExecutorError::Timeout(after)) => {
                ctx.log
                    .error(&format!("The action has timed out after {:?}.", after))
                    .await;
                TaskResult::Failed
            }
            Err(e) => {
                ctx.log.error(&e.to_string()).await;
                TaskResult::Failed
            }
        }
    }

    async fn run_script(
        &self,
        request: &ExecutionRequest,
        step: &StepRequest,
        script: &str,
        output_file: &Path,
        ctx: &ExecutionContext,
    ) -> Result<Exit, ExecutorError> {
        let temp = self.work_dir.join("_temp");
        tokio::fs::create_dir_all(&temp).await?;
        let script_path = temp.join(format!("{}.sh", uuid::Uuid::new_v4()));
        tokio::fs::write(&script_path, expand_contexts(script, request)).await?;

        let cwd = match step.input("workingDirectory").filter(|d| !d.is_empty()) {
            Some(dir) => self.work_dir.join(dir),
            None => self.work_dir.clone(),
        };
        tokio::fs::create_dir_all(&cwd).await?;

        let (program, args) = shell_command(step.input("shell"), &script_path)?;
        ctx.log.debug(&format!("{} {}", program, args.join(" "))).await;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&cwd)
            .envs(self.step_env(request, step, output_file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the step and everything it started can be
        // signalled together.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ExecutorError::Failed {
            reason: format!("Failed to start {}: {}", program, e),
        })?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out, ctx.log.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err, ctx.log.clone())));

        let timeout = step.timeout.unwrap_or(self.timeout);
        let result = tokio::select! {
            status = child.wait() => status
                .map(|s| Exit::Code(s.code().unwrap_or(-1)))
                .map_err(ExecutorError::from),
            _ = ctx.cancel.cancelled() => Ok(Exit::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(ExecutorError::Timeout(timeout)),
        };
        if !matches!(result, Ok(Exit::Code(_))) {
            terminate(&mut child, &step.display_name).await;
        }

        for reader in [stdout, stderr].into_iter().flatten() {
            drain_output(reader, &step.display_name).await;
        }
        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            tracing::debug!("Failed to remove {}: {}", script_path.display(), e);
        }
        result
    }

    fn step_env(&self, request: &ExecutionRequest, step: &StepRequest, output_file: &Path) -> HashMap<String, String> {
        let mut env = HashMap::from([
            ("CI".to_string(), "true".to_string()),
            ("GITHUB_ACTIONS".to_string(), "true".to_string()),
            ("GITHUB_WORKSPACE".to_string(), self.work_dir.display().to_string()),
            ("GITHUB_OUTPUT".to_string(), output_file.display().to_string()),
        ]);
        for field in GITHUB_ENV_FIELDS {
            if let Some(value) = request.github.get(*field).and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }) {
                env.insert(format!("GITHUB_{}", field.to_ascii_uppercase()), value);
            }
        }
        if request.debug {
            env.insert("RUNNER_DEBUG".to_string(), "1".to_string());
        }
        if let Some(token) = request.secrets.get("GITHUB_TOKEN") {
            env.insert("GITHUB_TOKEN".to_string(), token.clone());
        }
        env.extend(request.env.clone());
        env.extend(
            step.env
                .iter()
                .map(|(name, value)| (name.clone(), expand_contexts(value, request))),
        );
        env
    }
}

#[async_trait]
impl JobExecutor for HostExecutor {
    async fn execute(&self, request: ExecutionRequest, ctx: ExecutionContext) -> Result<JobOutcome, ExecutorError> {
        let mut failed = false;
        let mut step_outputs = HashMap::new();

        for (index, step) in request.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if !should_run(&step.condition, failed) {
                ctx.log.info(&format!("Skipping {}", step.display_name)).await;
                ctx.log.complete_step(index, TaskResult::Skipped).await;
                continue;
            }

            ctx.log.start_step(index).await;
            let result = self.run_step(&request, step, &mut step_outputs, &ctx).await;
            let reported = if result == TaskResult::Failed && step.continue_on_error {
                ctx.log.warning("The step failed, continuing because of continue-on-error").await;
                TaskResult::Succeeded
            } else {
                result
            };
            ctx.log.complete_step(index, reported).await;
            if reported == TaskResult::Failed {
                failed = true;
            }
        }

        let result = if ctx.cancel.is_cancelled() {
            TaskResult::Canceled
        } else if failed {
            TaskResult::Failed
        } else {
            TaskResult::Succeeded
        };
        let outputs = resolve_job_outputs(&request.outputs, &step_outputs);
        Ok(JobOutcome::new(result).with_outputs(outputs))
    }
}

/// Replace `${{ <context>.<path> }}` references with their values. Missing
/// values become empty strings; objects and arrays are rendered as JSON.
fn expand_contexts(text: &str, request: &ExecutionRequest) -> String {
    context_regex()
        .replace_all(text, |captures: &regex::Captures| {
            let root = match &captures[1] {
                "github" => Some(request.github.clone()),
                "matrix" => Some(serde_json::Value::Object(request.matrix.clone())),
                "needs" => Some(request.needs.clone()),
                "inputs" => Some(request.inputs.clone()),
                "secrets" => serde_json::to_value(&request.secrets).ok(),
                "env" => serde_json::to_value(&request.env).ok(),
                _ => None,
            };
            let value = root.and_then(|root| {
                captures[2]
                    .split('.')
                    .filter(|segment| !segment.is_empty())
                    .try_fold(root, |value, segment| value.get(segment).cloned())
            });
            match value {
                Some(serde_json::Value::String(s)) => s,
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// Status-function part of a step condition. Anything else is treated like
/// `success()`.
fn should_run(condition: &str, failed: bool) -> bool {
    let condition = condition.trim();
    if condition.contains("always()") {
        true
    } else if condition.contains("failure()") {
        failed
    } else {
        !failed
    }
}

/// Program and arguments for a `shell` input.
fn shell_command(shell: Option<&str>, script: &Path) -> Result<(String, Vec<String>), ExecutorError> {
    let script = script.display().to_string();
    let shell = shell.map(str::trim).filter(|s| !s.is_empty());
    let template = match shell {
        Some("bash") => "bash --noprofile --norc -eo pipefail {0}".to_string(),
        Some("sh") => "sh -e {0}".to_string(),
        Some("python") => "python {0}".to_string(),
        Some(custom) if custom.contains("{0}") => custom.to_string(),
        Some(other) => {
            return Err(ExecutorError::Failed {
                reason: format!("Unsupported shell: {}", other),
            });
        }
        None if find_in_path("bash").is_some() => "bash -e {0}".to_string(),
        None => "sh -e {0}".to_string(),
    };

    let mut parts = template
        .split_whitespace()
        .map(|part| part.replace("{0}", &script));
    let program = parts.next().ok_or_else(|| ExecutorError::Failed {
        reason: "empty shell template".to_string(),
    })?;
    Ok((program, parts.collect()))
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Kill the step's process group, then the step process itself.
async fn terminate(child: &mut Child, step: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::warn!("Failed to kill process group of step {}: {}", step, e);
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill step {}: {}", step, e);
    }
}

/// Wait for an output reader, abandoning it after [`OUTPUT_DRAIN`].
async fn drain_output(reader: JoinHandle<()>, step: &str) {
    let abort = reader.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN, reader).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Output reader of step {} failed: {}", step, e),
        Err(_) => {
            abort.abort();
            tracing::warn!("Output of step {} still open {:?} after it ended", step, OUTPUT_DRAIN);
        }
    }
}

async fn forward_lines<R>(reader: R, log: JobLog)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log.info(&line).await,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading step output: {}", e);
                break;
            }
        }
    }
}

/// Parse a `$GITHUB_OUTPUT` file: `name=value` lines and
/// `name<<DELIMITER` blocks.
async fn read_outputs(path: &Path) -> HashMap<String, String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return HashMap::new(),
    };
    let _ = tokio::fs::remove_file(path).await;
    parse_outputs(&content)
}

fn parse_outputs(content: &str) -> HashMap<String, String> {
    let mut outputs = HashMap::new();
    let mut lines = content.lines();
    while let Some(line) = lines.next() {
        if let Some((name, delimiter)) = line.split_once("<<") {
            let mut value = Vec::new();
            for next in lines.by_ref() {
                if next == delimiter {
                    break;
                }
                value.push(next);
            }
            outputs.insert(name.to_string(), value.join("\n"));
        } else if let Some((name, value)) = line.split_once('=') {
            outputs.insert(name.to_string(), value.to_string());
        }
    }
    outputs
}

fn resolve_job_outputs(
    declared: &HashMap<String, String>,
    steps: &HashMap<String, HashMap<String, String>>,
) -> HashMap<String, String> {
    declared
        .iter()
        .filter_map(|(name, expression)| {
            let captures = job_output_regex().captures(expression.trim())?;
            let value = steps.get(&captures[1])?.get(&captures[2])?;
            Some((name.clone(), value.clone()))
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ProtocolTimings;
    use crate::runner::executor::tests::job;
    use crate::runner::masking::SecretMasker;
    use crate::runner::testing::{Call, FakeService};
    use crate::runner::timeline::TimelineReporter;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn script_step(id: &str, script: &str) -> StepRequest {
        let mut inputs = Map::new();
        inputs.insert("script".to_string(), json!(script));
        StepRequest {
            id: id.to_string(),
            ref_name: id.to_string(),
            display_name: id.to_string(),
            kind: "script".to_string(),
            uses: String::new(),
            condition: String::new(),
            inputs,
            env: HashMap::new(),
            continue_on_error: false,
            timeout: None,
        }
    }

    fn request(steps: Vec<StepRequest>) -> ExecutionRequest {
        ExecutionRequest {
            job_id: "job-1".to_string(),
            request_id: 1,
            display_name: "Build".to_string(),
            steps,
            env: HashMap::from([("JOB_VAR".to_string(), "from-job".to_string())]),
            secrets: HashMap::new(),
            github: json!({"repository": "octo/hello", "run_number": 7}),
            matrix: Map::new(),
            needs: serde_json::Value::Null,
            inputs: serde_json::Value::Null,
            outputs: HashMap::new(),
            debug: false,
        }
    }

    /// Run `request` against a fake service; returns the outcome and every
    /// uploaded log file.
    async fn run(
        executor: &HostExecutor,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> (JobOutcome, Vec<String>) {
        let service = FakeService::new();
        let (reporter, batcher) = TimelineReporter::start(
            Arc::new(service.clone()),
            &job(),
            SecretMasker::new(Vec::new(), Vec::new()),
            false,
            &ProtocolTimings::default(),
        )
        .await;
        reporter
            .add_steps(&request.step_records())
            .await;
        let ctx = ExecutionContext {
            cancel,
            log: reporter.job_log(),
        };
        let outcome = executor.execute(request, ctx).await.unwrap();
        batcher.shutdown().await;
        let logs = service
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UploadLog(content) => Some(content),
                _ => None,
            })
            .collect();
        (outcome, logs)
    }

    fn executor(dir: &tempfile::TempDir) -> HostExecutor {
        HostExecutor::new().with_work_dir(dir.path())
    }

    #[tokio::test]
    async fn test_runs_scripts_and_collects_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = script_step("greet", "echo \"hello $GITHUB_REPOSITORY $JOB_VAR $STEP_VAR\"\necho version=1.2.3 >> \"$GITHUB_OUTPUT\"");
        first.env.insert("STEP_VAR".to_string(), "from-step".to_string());
        let mut request = request(vec![first, script_step("second", "echo run $GITHUB_RUN_NUMBER")]);
        request
            .outputs
            .insert("version".to_string(), "${{ steps.greet.outputs.version }}".to_string());

        let (outcome, logs) = run(&executor(&dir), request, CancellationToken::new()).await;

        assert_eq!(outcome.result, TaskResult::Succeeded);
        assert_eq!(outcome.outputs["version"], "1.2.3");
        assert!(logs.iter().any(|l| l.contains("hello octo/hello from-job from-step")));
        assert!(logs.iter().any(|l| l.contains("run 7")));
    }

    #[tokio::test]
    async fn test_failed_step_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let mut cleanup = script_step("cleanup", "echo cleanup");
        cleanup.condition = "always()".to_string();
        let request = request(vec![
            script_step("fail", "exit 3"),
            script_step("after", &format!("touch {}", marker.display())),
            cleanup,
        ]);

        let (outcome, logs) = run(&executor(&dir), request, CancellationToken::new()).await;

        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(!marker.exists());
        assert!(logs.iter().any(|l| l.contains("##[error]Process completed with exit code 3.")));
        assert!(logs.iter().any(|l| l.contains("cleanup")));
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut flaky = script_step("flaky", "exit 1");
        flaky.continue_on_error = true;

        let (outcome, _) = run(&executor(&dir), request(vec![flaky]), CancellationToken::new()).await;
        assert_eq!(outcome.result, TaskResult::Succeeded);
    }

    #[tokio::test]
    async fn test_non_script_step_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = script_step("checkout", "");
        step.kind = "repository".to_string();
        step.uses = "actions/checkout".to_string();

        let (outcome, logs) = run(&executor(&dir), request(vec![step]), CancellationToken::new()).await;
        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(logs.iter().any(|l| l.contains("not supported by this runner (actions/checkout)")));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut slow = script_step("slow", "sleep 5");
        slow.timeout = Some(Duration::from_millis(200));

        let (outcome, logs) = run(&executor(&dir), request(vec![slow]), CancellationToken::new()).await;
        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(logs.iter().any(|l| l.contains("timed out")));
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let (outcome, _) = run(&executor(&dir), request(vec![script_step("slow", "sleep 5")]), cancel).await;
        assert_eq!(outcome.result, TaskResult::Canceled);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancellation_kills_background_processes() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let step = script_step("detached", "sleep 20 &\nwait");
        let finished = tokio::time::timeout(
            Duration::from_secs(8),
            run(&executor(&dir), request(vec![step]), cancel),
        )
        .await;

        let (outcome, _) = finished.expect("job did not return after cancellation");
        assert_eq!(outcome.result, TaskResult::Canceled);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_processes() {
        let dir = tempfile::tempdir().unwrap();
        let step = script_step("detached", "sleep 20 &\nwait");
        let executor = executor(&dir).with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let finished = tokio::time::timeout(
            Duration::from_secs(8),
            run(&executor, request(vec![step]), CancellationToken::new()),
        )
        .await;

        let (outcome, logs) = finished.expect("job did not return after the step timed out");
        assert_eq!(outcome.result, TaskResult::Failed);
        assert!(logs.iter().any(|l| l.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_contexts_and_token_reach_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let step = script_step(
            "ctx",
            "echo \"os=${{ matrix.os }} token=$GITHUB_TOKEN level=${{ inputs.level }} missing=[${{ matrix.arch }}]\"",
        );
        let mut request = request(vec![step]);
        request.matrix.insert("os".to_string(), json!("linux"));
        request.inputs = json!({"level": 3});
        request
            .secrets
            .insert("GITHUB_TOKEN".to_string(), "ghs_abc".to_string());

        let (outcome, logs) = run(&executor(&dir), request, CancellationToken::new()).await;

        assert_eq!(outcome.result, TaskResult::Succeeded);
        assert!(logs.iter().any(|l| l.contains("os=linux token=ghs_abc level=3 missing=[]")));
    }

    #[test]
    fn test_expand_contexts() {
        let mut request = request(Vec::new());
        request.needs = json!({"build": {"outputs": {"version": "1.0"}}});

        assert_eq!(
            expand_contexts(
                "v${{ needs.build.outputs.version }} ${{ github.repository }} ${{ steps.a.outputs.b }}",
                &request
            ),
            "v1.0 octo/hello ${{ steps.a.outputs.b }}"
        );
        assert_eq!(
            expand_contexts("${{ github.run_number }} ${{env.JOB_VAR}}", &request),
            "7 from-job"
        );
    }

    #[test]
    fn test_parse_outputs() {
        let parsed = parse_outputs("a=1\nmulti<<EOF\nline 1\nline 2\nEOF\nb=x=y\n");
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["multi"], "line 1\nline 2");
        assert_eq!(parsed["b"], "x=y");
    }

    #[test]
    fn test_shell_command() {
        let script = Path::new("/tmp/s.sh");
        assert_eq!(
            shell_command(Some("sh"), script).unwrap(),
            ("sh".to_string(), vec!["-e".to_string(), "/tmp/s.sh".to_string()])
        );
        assert_eq!(
            shell_command(Some("perl {0}"), script).unwrap(),
            ("perl".to_string(), vec!["/tmp/s.sh".to_string()])
        );
        assert!(shell_command(Some("cmd"), script).is_err());
    }

    #[test]
    fn test_should_run() {
        assert!(should_run("", false));
        assert!(!should_run("success()", true));
        assert!(should_run("always()", true));
        assert!(should_run("failure()", true));
        assert!(!should_run("failure()", false));
    }
}
