//! HTTP connection to the orchestration service.
//!
//! Every call names a service GUID and an api version. The GUID is resolved
//! through the [`ConnectionData`] document into a relative path template,
//! placeholders are filled in and the request is sent with the bearer token.
//! A 401/400 answer on a connection that holds agent credentials triggers
//! exactly one re-authorization followed by one retry.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method};
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectionError;
use crate::protocol::agent::{self, TaskAgent};
use crate::protocol::connection_data::{ConnectionData, ServiceDefinition, services};
use crate::protocol::job::{JobEvent, RenewAgent, TaskOrchestrationPlanReference};
use crate::protocol::service::RunnerService;
use crate::protocol::session::{TaskAgentMessage, TaskAgentSession};
use crate::protocol::timeline::{TaskLog, TimelineRecordFeedLinesWrapper, TimelineRecordWrapper};

const LOCK_TOKEN: &str = "00000000-0000-0000-0000-000000000000";

/// Agent identity used to obtain fresh bearer tokens.
pub struct AgentCredentials {
    pub agent: TaskAgent,
    pub key: RsaPrivateKey,
}

/// Body of an outgoing request, kept so it can be replayed on retry.
enum RequestBody {
    None,
    Json(String),
    Raw(String),
}

impl RequestBody {
    fn json<T: Serialize>(value: &T) -> Result<Self, ConnectionError> {
        Ok(Self::Json(serde_json::to_string(value)?))
    }

    fn text(&self) -> &str {
        match self {
            Self::None => "",
            Self::Json(s) | Self::Raw(s) => s,
        }
    }
}

/// Connection to one tenant.
pub struct VssConnection {
    client: Client,
    tenant_url: String,
    token: RwLock<Option<SecretString>>,
    /// Serializes re-authorization when several requests hit 401 at once.
    renewal_lock: Mutex<()>,
    credentials: Option<Arc<AgentCredentials>>,
    pool_id: i64,
    trace: bool,
    connection_data: RwLock<Option<Arc<ConnectionData>>>,
}

impl VssConnection {
    pub fn new(tenant_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client, tenant_url)
    }

    /// Share an existing HTTP client.
    pub fn with_client(client: Client, tenant_url: impl Into<String>) -> Self {
        Self {
            client,
            tenant_url: tenant_url.into(),
            token: RwLock::new(None),
            renewal_lock: Mutex::new(()),
            credentials: None,
            pool_id: 0,
            trace: false,
            connection_data: RwLock::new(None),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token: String = token.into();
        self.token = RwLock::new((!token.is_empty()).then(|| SecretString::from(token)));
        self
    }

    pub fn with_credentials(mut self, agent: TaskAgent, key: RsaPrivateKey) -> Self {
        self.credentials = Some(Arc::new(AgentCredentials { agent, key }));
        self
    }

    pub fn with_pool(mut self, pool_id: i64) -> Self {
        self.pool_id = pool_id;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_connection_data(mut self, data: ConnectionData) -> Self {
        self.connection_data = RwLock::new(Some(Arc::new(data)));
        self
    }

    pub fn tenant_url(&self) -> &str {
        &self.tenant_url
    }

    pub fn pool_id(&self) -> i64 {
        self.pool_id
    }

    /// Current bearer token, if any.
    pub async fn token(&self) -> Option<SecretString> {
        self.token.read().await.clone()
    }

    /// Fetch and cache the service discovery document.
    pub async fn fetch_connection_data(&self) -> Result<Arc<ConnectionData>, ConnectionError> {
        let url = build_url(
            &self.tenant_url,
            "_apis/connectionData",
            &BTreeMap::new(),
            &BTreeMap::from([
                ("connectOptions".to_string(), "1".to_string()),
                ("lastChangeId".to_string(), "-1".to_string()),
                ("lastChangeId64".to_string(), "-1".to_string()),
            ]),
        )?;

        let response = self.client.get(&url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(ConnectionError::Status {
                method: "GET".to_string(),
                url,
                status,
                request_body: String::new(),
                response_body: body,
            });
        }

        let data: ConnectionData = serde_json::from_str(&body).map_err(|e| ConnectionError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let data = Arc::new(data);
        *self.connection_data.write().await = Some(Arc::clone(&data));
        Ok(data)
    }

    async fn service(&self, id: &str) -> Result<ServiceDefinition, ConnectionError> {
        let guard = self.connection_data.read().await;
        let data = guard.as_ref().ok_or(ConnectionError::MissingConnectionData)?;
        data.service_definition(id)
            .cloned()
            .ok_or_else(|| ConnectionError::UnknownService(id.to_string()))
    }

    /// Resolve a relative path template against the tenant url.
    pub fn build_url(
        &self,
        relative_path: &str,
        path_params: &BTreeMap<String, String>,
        query_params: &BTreeMap<String, String>,
    ) -> Result<String, ConnectionError> {
        build_url(&self.tenant_url, relative_path, path_params, query_params)
    }

    async fn reauthorize(&self) -> Result<(), ConnectionError> {
        let Some(credentials) = self.credentials.as_ref() else {
            return Err(ConnectionError::Authorization {
                reason: "connection has no agent credentials".to_string(),
            });
        };
        let _guard = self.renewal_lock.lock().await;

        tracing::debug!("Re-authorizing agent {}", credentials.agent.name);
        let response = agent::authorize(&self.client, &credentials.agent, &credentials.key).await?;
        *self.token.write().await = Some(SecretString::from(response.access_token));
        Ok(())
    }

    /// Send a request and return the status and body of a 2xx answer.
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        service_id: &str,
        api_version: &str,
        method: Method,
        path_params: &[(&str, &str)],
        query_params: &[(&str, &str)],
        body: RequestBody,
        cancel: Option<&CancellationToken>,
    ) -> Result<(u16, String), ConnectionError> {
        let service = self.service(service_id).await?;
        let mut params: BTreeMap<String, String> = path_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        params.insert("area".to_string(), service.service_type.clone());
        params.insert("resource".to_string(), service.display_name.clone());
        let query: BTreeMap<String, String> = query_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let url = self.build_url(&service.relative_path, &params, &query)?;

        for attempt in 0..2 {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("X-VSS-E2EID", uuid::Uuid::new_v4().to_string())
                .header("X-TFS-FedAuthRedirect", "Suppress")
                .header("X-TFS-Session", uuid::Uuid::new_v4().to_string());
            if !api_version.is_empty() {
                request = request
                    .header(
                        "Content-Type",
                        format!("application/json; charset=utf-8; api-version={}", api_version),
                    )
                    .header("Accept", format!("application/json; api-version={}", api_version));
            }
            if let Some(token) = self.token.read().await.as_ref() {
                request = request.header("Authorization", format!("bearer {}", token.expose_secret()));
            }
            if !matches!(body, RequestBody::None) {
                request = request.body(body.text().to_string());
            }

            if self.trace {
                tracing::debug!("Http {} Request started {} Body: `{}`", method, url, body.text());
            }

            let send = request.send();
            let response = match cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                    response = send => response?,
                },
                None => send.await?,
            };

            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_else(|e| format!("no response: {}", e));

            if !(200..300).contains(&status) {
                let err = ConnectionError::Status {
                    method: method.to_string(),
                    url: url.clone(),
                    status,
                    request_body: body.text().to_string(),
                    response_body: text,
                };
                if attempt == 0 && err.is_auth_failure() && self.credentials.is_some() {
                    self.reauthorize().await?;
                    continue;
                }
                if self.trace {
                    tracing::debug!("{}", err);
                }
                return Err(err);
            }

            if self.trace {
                tracing::debug!("Http {} Request succeeded {} Body: `{}`", method, url, text);
            }
            return Ok((status, text));
        }

        Err(ConnectionError::Authorization {
            reason: "unable to authenticate".to_string(),
        })
    }

    /// Request that expects a JSON answer. A 2xx other than 200 yields
    /// [`ConnectionError::NoContent`].
    #[allow(clippy::too_many_arguments)]
    async fn request_json<R: DeserializeOwned>(
        &self,
        service_id: &str,
        api_version: &str,
        method: Method,
        path_params: &[(&str, &str)],
        query_params: &[(&str, &str)],
        body: RequestBody,
        cancel: Option<&CancellationToken>,
    ) -> Result<R, ConnectionError> {
        let (status, text) = self
            .send(service_id, api_version, method, path_params, query_params, body, cancel)
            .await?;
        if status != 200 {
            return Err(ConnectionError::NoContent);
        }
        serde_json::from_str(&text).map_err(|e| ConnectionError::Decode {
            url: service_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn request_empty(
        &self,
        service_id: &str,
        api_version: &str,
        method: Method,
        path_params: &[(&str, &str)],
        query_params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<(), ConnectionError> {
        self.send(service_id, api_version, method, path_params, query_params, body, None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RunnerService for VssConnection {
    async fn create_session(&self, session: &TaskAgentSession) -> Result<TaskAgentSession, ConnectionError> {
        let pool_id = self.pool_id.to_string();
        self.request_json(
            services::SESSIONS,
            services::API_5_1,
            Method::POST,
            &[("poolId", pool_id.as_str())],
            &[],
            RequestBody::json(session)?,
            None,
        )
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ConnectionError> {
        let pool_id = self.pool_id.to_string();
        self.request_empty(
            services::SESSIONS,
            services::API_5_1,
            Method::DELETE,
            &[("poolId", pool_id.as_str()), ("sessionId", session_id)],
            &[],
            RequestBody::None,
        )
        .await
    }

    async fn get_message(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskAgentMessage>, ConnectionError> {
        let pool_id = self.pool_id.to_string();
        let result = self
            .request_json(
                services::MESSAGES,
                services::API_5_1,
                Method::GET,
                &[("poolId", pool_id.as_str())],
                &[("sessionId", session_id)],
                RequestBody::None,
                Some(cancel),
            )
            .await;
        match result {
            Ok(message) => Ok(Some(message)),
            Err(ConnectionError::NoContent) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, session_id: &str, message_id: i64) -> Result<(), ConnectionError> {
        let pool_id = self.pool_id.to_string();
        let message_id = message_id.to_string();
        self.request_empty(
            services::MESSAGES,
            services::API_5_1,
            Method::DELETE,
            &[("poolId", pool_id.as_str()), ("messageId", message_id.as_str())],
            &[("sessionId", session_id)],
            RequestBody::None,
        )
        .await
    }

    async fn renew_job(&self, request_id: i64) -> Result<(), ConnectionError> {
        let pool_id = self.pool_id.to_string();
        let request = request_id.to_string();
        self.request_empty(
            services::RENEW_JOB,
            services::API_5_1,
            Method::PATCH,
            &[("poolId", pool_id.as_str()), ("requestId", request.as_str())],
            &[("lockToken", LOCK_TOKEN)],
            RequestBody::json(&RenewAgent { request_id })?,
        )
        .await
    }

    async fn finish_job(
        &self,
        plan: &TaskOrchestrationPlanReference,
        event: &JobEvent,
    ) -> Result<(), ConnectionError> {
        self.request_empty(
            services::FINISH_JOB,
            services::API_FINISH_JOB,
            Method::POST,
            &[
                ("scopeIdentifier", plan.scope_identifier.as_str()),
                ("planId", plan.plan_id.as_str()),
                ("hubName", plan.plan_type.as_str()),
            ],
            &[],
            RequestBody::json(event)?,
        )
        .await
    }

    async fn update_timeline(
        &self,
        plan: &TaskOrchestrationPlanReference,
        timeline_id: &str,
        records: &TimelineRecordWrapper,
    ) -> Result<(), ConnectionError> {
        self.request_empty(
            services::TIMELINE,
            services::API_5_1,
            Method::PATCH,
            &[
                ("scopeIdentifier", plan.scope_identifier.as_str()),
                ("planId", plan.plan_id.as_str()),
                ("hubName", plan.plan_type.as_str()),
                ("timelineId", timeline_id),
            ],
            &[],
            RequestBody::json(records)?,
        )
        .await
    }

    async fn upload_log_file(
        &self,
        plan: &TaskOrchestrationPlanReference,
        timeline_id: &str,
        content: &str,
    ) -> Result<i64, ConnectionError> {
        let params = [
            ("scopeIdentifier", plan.scope_identifier.as_str()),
            ("planId", plan.plan_id.as_str()),
            ("hubName", plan.plan_type.as_str()),
            ("timelineId", timeline_id),
        ];
        let log: TaskLog = self
            .request_json(
                services::LOGS,
                services::API_5_1,
                Method::POST,
                &params,
                &[],
                RequestBody::json(&TaskLog::new_file())?,
                None,
            )
            .await?;

        let log_id = log.id.to_string();
        let mut with_id = params.to_vec();
        with_id.push(("logId", log_id.as_str()));
        self.request_empty(
            services::LOGS,
            services::API_5_1,
            Method::POST,
            &with_id,
            &[],
            RequestBody::Raw(content.to_string()),
        )
        .await?;
        Ok(log.id)
    }

    async fn append_timeline_lines(
        &self,
        plan: &TaskOrchestrationPlanReference,
        timeline_id: &str,
        lines: &TimelineRecordFeedLinesWrapper,
    ) -> Result<(), ConnectionError> {
        self.request_empty(
            services::FEED_LINES,
            services::API_5_1,
            Method::POST,
            &[
                ("scopeIdentifier", plan.scope_identifier.as_str()),
                ("planId", plan.plan_id.as_str()),
                ("hubName", plan.plan_type.as_str()),
                ("timelineId", timeline_id),
                ("recordId", lines.step_id.as_str()),
            ],
            &[],
            RequestBody::json(lines)?,
        )
        .await
    }

    async fn job_service(&self, url: &str, token: &str) -> Result<Arc<dyn RunnerService>, ConnectionError> {
        let connection = VssConnection::with_client(self.client.clone(), url)
            .with_token(token)
            .with_trace(self.trace);
        connection.fetch_connection_data().await?;
        Ok(Arc::new(connection))
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/*\{[^}]+\}").expect("placeholder regex"))
}

/// Fill `{name}` placeholders of `relative_path`, drop the ones left
/// unresolved, join onto the tenant url and append the sorted query.
pub fn build_url(
    tenant_url: &str,
    relative_path: &str,
    path_params: &BTreeMap<String, String>,
    query_params: &BTreeMap<String, String>,
) -> Result<String, ConnectionError> {
    let mut url = reqwest::Url::parse(tenant_url).map_err(|e| ConnectionError::InvalidUrl {
        url: tenant_url.to_string(),
        reason: e.to_string(),
    })?;

    let mut relative = relative_path.to_string();
    for (name, value) in path_params {
        relative = relative.replace(&format!("{{{}}}", name), &urlencoding::encode(value));
    }
    let relative = placeholder_regex().replace_all(&relative, "");

    let joined = format!("{}/{}", url.path(), relative);
    let segments: Vec<&str> = joined.split('/').filter(|s| !s.is_empty()).collect();
    url.set_path(&format!("/{}", segments.join("/")));

    url.set_query(None);
    if !query_params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query_params {
            pairs.append_pair(name, value);
        }
    }
    Ok(url.to_string())
}
