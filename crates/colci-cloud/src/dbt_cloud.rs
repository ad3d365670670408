//! dbt Cloud client
//!
//! Talks to two APIs:
//! - the Admin API (v2) to read the CI job, trigger it and poll the run
//! - the Discovery API (GraphQL) for the deferring environment's compiled code,
//!   catalog columns and column-level lineage
//!
//! Building requests and reading responses are plain functions so they can be
//! tested without a network.

use crate::adapter::{CollaboratorError, LineageSource, PreviousState, RunTrigger};
use colci_core::{CiSelection, Config, DbtCloudConfig, DialectConfig, GithubConfig, NodeId, RunStatus};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Discovery API page size
const PAGE_SIZE: usize = 500;

/// Cause recorded on triggered runs
const RUN_CAUSE: &str = "Column-aware CI";

const COLUMN_LINEAGE_QUERY: &str = r#"
query Column($environmentId: BigInt!, $nodeUniqueId: String!, $filters: ColumnLineageFilter) {
    column(environmentId: $environmentId) {
        lineage(nodeUniqueId: $nodeUniqueId, filters: $filters) {
            nodeUniqueId
            relationship
        }
    }
}
"#;

const COMPILED_CODE_QUERY: &str = r#"
query Environment($environmentId: BigInt!, $filter: ModelAppliedFilter, $first: Int, $after: String) {
    environment(id: $environmentId) {
        applied {
            models(filter: $filter, first: $first, after: $after) {
                edges {
                    node {
                        uniqueId
                        compiledCode
                        catalog {
                            columns {
                                name
                            }
                        }
                    }
                }
                pageInfo {
                    endCursor
                    hasNextPage
                }
            }
        }
    }
}
"#;

/// The parts of a job definition a CI run needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub execute_steps: Vec<String>,
    pub deferring_environment_id: Option<String>,
}

/// One page of the compiled code query
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPage {
    pub nodes: BTreeMap<NodeId, PreviousState>,
    pub next_cursor: Option<String>,
}

/// dbt Cloud Admin + Discovery API client
#[derive(Clone)]
pub struct DbtCloudClient {
    client: reqwest::Client,
    config: DbtCloudConfig,
    github: GithubConfig,
    dialect: DialectConfig,
    token: String,
    account_id: String,
    job_id: String,
    environment_id: String,
}

// Leaves out the API token
impl std::fmt::Debug for DbtCloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbtCloudClient")
            .field("host", &self.config.host)
            .field("account_id", &self.account_id)
            .field("job_id", &self.job_id)
            .field("environment_id", &self.environment_id)
            .finish_non_exhaustive()
    }
}

impl DbtCloudClient {
    /// Build a client, reading the deferring environment from the CI job when
    /// none is configured
    pub async fn connect(config: &Config) -> Result<Self, CollaboratorError> {
        config
            .validate_for_trigger()
            .map_err(|e| CollaboratorError::Config(e.to_string()))?;

        let cloud = &config.dbt_cloud;
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| CollaboratorError::Config(format!("missing {name}")))
        };

        let mut client = Self {
            client: reqwest::Client::new(),
            config: cloud.clone(),
            github: config.github.clone(),
            dialect: config.dialect,
            token: required(&cloud.service_token, "service token")?,
            account_id: required(&cloud.account_id, "account id")?,
            job_id: required(&cloud.job_id, "job id")?,
            environment_id: cloud.environment_id.clone().unwrap_or_default(),
        };

        if client.environment_id.is_empty() {
            let job = client.job_definition().await?;
            client.environment_id = job.deferring_environment_id.ok_or_else(|| {
                CollaboratorError::Config(format!(
                    "job {} has no deferring environment; set INPUT_DBT_CLOUD_ENVIRONMENT_ID",
                    client.job_id
                ))
            })?;
            info!(environment_id = %client.environment_id, "Using the job's deferring environment");
        }

        Ok(client)
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "https://{}/api/v2/accounts/{}/{}",
            self.config.host.trim_end_matches('/'),
            self.account_id,
            path.trim_start_matches('/')
        )
    }

    fn discovery_endpoint(&self) -> String {
        format!("https://{}/graphql", self.config.discovery_host().trim_end_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, CollaboratorError> {
        let response = request
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| CollaboratorError::Network(format!("http request failed: {err}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| CollaboratorError::Network(format!("http read body failed: {err}")))?;
        if !status.is_success() {
            return Err(map_http_status(status, text));
        }

        serde_json::from_str(&text)
            .map_err(|err| CollaboratorError::InvalidResponse(format!("json decode failed: {err}")))
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, CollaboratorError> {
        let body = json!({ "query": query, "variables": variables });
        let payload = self
            .send(self.client.post(self.discovery_endpoint()).json(&body))
            .await?;
        graphql_data(payload)
    }

    /// Execute steps and deferring environment of the CI job
    pub async fn job_definition(&self) -> Result<JobDefinition, CollaboratorError> {
        let url = self.endpoint(&format!("jobs/{}/", self.job_id));
        let payload = self.send(self.client.get(url)).await?;
        parse_job_definition(&payload)
    }

    async fn trigger(&self, payload: &Value) -> Result<u64, CollaboratorError> {
        let url = self.endpoint(&format!("jobs/{}/run/", self.job_id));
        let response = self.send(self.client.post(url).json(payload)).await?;
        response
            .pointer("/data/id")
            .and_then(Value::as_u64)
            .ok_or_else(|| CollaboratorError::InvalidResponse("missing run id".to_string()))
    }

    async fn run_status_code(&self, run_id: u64) -> Result<i64, CollaboratorError> {
        let url = self.endpoint(&format!("runs/{run_id}/"));
        let response = self.send(self.client.get(url)).await?;
        response
            .pointer("/data/status")
            .and_then(Value::as_i64)
            .ok_or_else(|| CollaboratorError::InvalidResponse("missing run status".to_string()))
    }
}

#[async_trait::async_trait]
impl LineageSource for DbtCloudClient {
    fn name(&self) -> &'static str {
        "dbt Cloud Discovery API"
    }

    async fn previous_state(
        &self,
        unique_ids: &[NodeId],
    ) -> Result<BTreeMap<NodeId, PreviousState>, CollaboratorError> {
        let mut state = BTreeMap::new();
        if unique_ids.is_empty() {
            return Ok(state);
        }

        let mut after: Option<String> = None;
        loop {
            let variables = json!({
                "environmentId": self.environment_id,
                "filter": { "uniqueIds": unique_ids },
                "first": PAGE_SIZE,
                "after": after,
            });
            let data = self.graphql(COMPILED_CODE_QUERY, variables).await?;
            let page = parse_compiled_page(&data)?;
            state.extend(page.nodes);

            match page.next_cursor {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        info!(
            requested = unique_ids.len(),
            retrieved = state.len(),
            "Retrieved previous compiled code"
        );
        Ok(state)
    }

    async fn column_consumers(
        &self,
        unique_id: &str,
        column: &str,
    ) -> Result<BTreeSet<NodeId>, CollaboratorError> {
        let variables = json!({
            "environmentId": self.environment_id,
            "nodeUniqueId": unique_id,
            "filters": { "columnName": lineage_column_name(self.dialect, column) },
        });
        let data = self.graphql(COLUMN_LINEAGE_QUERY, variables).await?;
        let consumers = parse_column_consumers(&data)?;

        debug!(node = %unique_id, column = %column, consumers = consumers.len(), "Column lineage");
        Ok(consumers)
    }
}

#[async_trait::async_trait]
impl RunTrigger for DbtCloudClient {
    fn name(&self) -> &'static str {
        "dbt Cloud Admin API"
    }

    async fn trigger_and_wait(&self, selection: &CiSelection) -> Result<RunStatus, CollaboratorError> {
        let job = self.job_definition().await?;
        let pull_request = self.github.pull_request_number();
        if pull_request.is_none() {
            warn!("No pull request number in GITHUB_REF; triggering without a schema override");
        }

        let payload = trigger_payload(
            &self.job_id,
            &job.execute_steps,
            selection,
            self.github.head_ref.as_deref(),
            pull_request,
        );
        let run_id = self.trigger(&payload).await?;
        info!(run_id, job_id = %self.job_id, excluded = selection.excluded.len(), "Triggered CI job");

        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);

        loop {
            let code = self.run_status_code(run_id).await?;
            if let Some(status) = run_status_from_code(code) {
                info!(run_id, status = %status, "Run finished");
                return Ok(status);
            }

            debug!(run_id, code, "Run in progress");
            if Instant::now() + interval > deadline {
                warn!(run_id, timeout_secs = self.config.timeout_secs, "Gave up waiting for the run");
                return Ok(RunStatus::Error);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Terminal status for a dbt Cloud run status code
///
/// Queued (1), starting (2) and running (3) are not terminal and map to `None`.
pub fn run_status_from_code(code: i64) -> Option<RunStatus> {
    match code {
        10 => Some(RunStatus::Success),
        20 => Some(RunStatus::Failure),
        30 => Some(RunStatus::Cancelled),
        1 | 2 | 3 => None,
        _ => Some(RunStatus::Error),
    }
}

/// Schema the CI run builds into
pub fn schema_override(job_id: &str, pull_request: u64) -> String {
    format!("dbt_cloud_pr_{job_id}_{pull_request}")
}

/// Body of the trigger request
pub fn trigger_payload(
    job_id: &str,
    execute_steps: &[String],
    selection: &CiSelection,
    git_branch: Option<&str>,
    pull_request: Option<u64>,
) -> Value {
    let mut payload = json!({
        "cause": RUN_CAUSE,
        "steps_override": selection.apply_to_steps(execute_steps),
    });

    if let Some(branch) = git_branch {
        payload["git_branch"] = json!(branch);
    }
    if let Some(pr) = pull_request {
        payload["schema_override"] = json!(schema_override(job_id, pr));
        payload["github_pull_request_id"] = json!(pr);
    }

    payload
}

/// Column name as the lineage API expects it
pub fn lineage_column_name(dialect: DialectConfig, column: &str) -> String {
    match dialect {
        DialectConfig::Snowflake => column.to_uppercase(),
        _ => column.to_string(),
    }
}

pub fn parse_job_definition(payload: &Value) -> Result<JobDefinition, CollaboratorError> {
    let data = payload
        .get("data")
        .ok_or_else(|| CollaboratorError::InvalidResponse("missing job data".to_string()))?;

    let execute_steps = data
        .get("execute_steps")
        .and_then(Value::as_array)
        .ok_or_else(|| CollaboratorError::InvalidResponse("missing execute_steps".to_string()))?
        .iter()
        .filter_map(|step| step.as_str().map(str::to_string))
        .collect();

    let deferring_environment_id = match data.get("deferring_environment_id") {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };

    Ok(JobDefinition {
        execute_steps,
        deferring_environment_id,
    })
}

pub fn parse_compiled_page(data: &Value) -> Result<CompiledPage, CollaboratorError> {
    let models = data
        .pointer("/environment/applied/models")
        .ok_or_else(|| CollaboratorError::InvalidResponse("missing applied models".to_string()))?;

    let mut nodes = BTreeMap::new();
    for edge in models.get("edges").and_then(Value::as_array).into_iter().flatten() {
        let Some(node) = edge.get("node") else { continue };
        let Some(unique_id) = node.get("uniqueId").and_then(Value::as_str) else { continue };

        let compiled_code = node
            .get("compiledCode")
            .and_then(Value::as_str)
            .map(str::to_string);
        let columns = node
            .pointer("/catalog/columns")
            .and_then(Value::as_array)
            .map(|columns| {
                columns
                    .iter()
                    .filter_map(|c| c.get("name")?.as_str().map(str::to_string))
                    .collect()
            });

        nodes.insert(unique_id.to_string(), PreviousState { compiled_code, columns });
    }

    let has_next = models
        .pointer("/pageInfo/hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = if has_next {
        models
            .pointer("/pageInfo/endCursor")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };

    Ok(CompiledPage { nodes, next_cursor })
}

/// Direct consumers from a column lineage response
pub fn parse_column_consumers(data: &Value) -> Result<BTreeSet<NodeId>, CollaboratorError> {
    let lineage = data
        .pointer("/column/lineage")
        .and_then(Value::as_array)
        .ok_or_else(|| CollaboratorError::InvalidResponse("missing column lineage".to_string()))?;

    Ok(lineage
        .iter()
        .filter(|entry| entry.get("relationship").and_then(Value::as_str) == Some("child"))
        .filter_map(|entry| entry.get("nodeUniqueId")?.as_str().map(str::to_string))
        .collect())
}

fn graphql_data(payload: Value) -> Result<Value, CollaboratorError> {
    if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            return Err(CollaboratorError::InvalidResponse(format!(
                "graphql errors: {}",
                messages.join("; ")
            )));
        }
    }

    match payload {
        Value::Object(mut map) => map
            .remove("data")
            .filter(|data| !data.is_null())
            .ok_or_else(|| CollaboratorError::InvalidResponse("missing data".to_string())),
        _ => Err(CollaboratorError::InvalidResponse("expected a json object".to_string())),
    }
}

pub(crate) fn map_http_status(status: reqwest::StatusCode, body: String) -> CollaboratorError {
    match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            CollaboratorError::Config(format!("credentials rejected ({status}): {body}"))
        }
        _ => CollaboratorError::Api {
            status: status.as_u16(),
            body,
        },
    }
}
