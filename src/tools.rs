//! Request dispatcher.
//!
//! Maps the named operations onto the session, the executor and the optional
//! natural-language bridge, and shapes every outcome into a [`ToolResponse`].
//! Nothing below this boundary is allowed to escape it as a raw error.

mod inputs;

pub use inputs::*;

use crate::bridge::{schema_summary, NlBridge};
use crate::constants::{SUMMARY_SAMPLED_TABLES, SUMMARY_SAMPLE_ROWS};
use crate::error::{ErrorKind, ServerError};
use crate::executor::{ExecuteOptions, QueryExecutor, QueryResult};
use crate::session::SessionManager;
use crate::telemetry::{RequestContext, SharedMetrics};
use crate::xmla::catalog::sample_statement;
use crate::xmla::{EntityDescriptor, EntityKind};
use rmcp::model::Tool;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A named operation of the dispatch surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Disconnect,
    ListEntities,
    DescribeEntity,
    ExecuteQuery,
    AskQuestion,
    SuggestQuestions,
}

impl Operation {
    /// Operations that need no language model.
    pub const CORE: [Operation; 5] = [
        Operation::Connect,
        Operation::Disconnect,
        Operation::ListEntities,
        Operation::DescribeEntity,
        Operation::ExecuteQuery,
    ];

    /// Operations backed by the natural-language bridge.
    pub const NATURAL_LANGUAGE: [Operation; 2] =
        [Operation::AskQuestion, Operation::SuggestQuestions];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::ListEntities => "list-entities",
            Operation::DescribeEntity => "describe-entity",
            Operation::ExecuteQuery => "execute-query",
            Operation::AskQuestion => "ask-question",
            Operation::SuggestQuestions => "suggest-questions",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Operation::Connect => {
                "Connect to a Power BI dataset over XMLA with a service principal. Replaces any existing session; schema discovery starts in the background."
            }
            Operation::Disconnect => "Close the current session and clear the schema cache.",
            Operation::ListEntities => "List the tables of the connected dataset with their kind and row count hint.",
            Operation::DescribeEntity => {
                "Describe one table: columns, measures, relationships and optionally sample rows."
            }
            Operation::ExecuteQuery => {
                "Execute a DAX query (EVALUATE ...) against the connected dataset and return the rows."
            }
            Operation::AskQuestion => {
                "Answer a natural-language question: generates DAX, runs it and summarizes the result."
            }
            Operation::SuggestQuestions => "Suggest questions worth asking about the connected dataset.",
        }
    }

    /// JSON Schema of this operation's parameters.
    pub fn input_schema(&self) -> Map<String, Value> {
        match self {
            Operation::Connect => input_schema::<ConnectInput>(),
            Operation::Disconnect => input_schema::<DisconnectInput>(),
            Operation::ListEntities => input_schema::<ListEntitiesInput>(),
            Operation::DescribeEntity => input_schema::<DescribeEntityInput>(),
            Operation::ExecuteQuery => input_schema::<ExecuteQueryInput>(),
            Operation::AskQuestion => input_schema::<AskQuestionInput>(),
            Operation::SuggestQuestions => input_schema::<SuggestQuestionsInput>(),
        }
    }

    /// MCP tool definition for this operation.
    pub fn tool(&self) -> Tool {
        Tool::new(self.as_str(), self.description(), Arc::new(self.input_schema()))
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::CORE
            .iter()
            .chain(Operation::NATURAL_LANGUAGE.iter())
            .find(|op| op.as_str() == s)
            .copied()
            .ok_or_else(|| ServerError::UnknownOperation(s.to_string()))
    }
}

/// Error part of a failed response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&ServerError> for ErrorBody {
    fn from(err: &ServerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            suggestion: err.suggestion().map(str::to_string),
        }
    }
}

/// The uniform envelope every operation answers with.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ToolResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(err: &ServerError) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(err.into()),
        }
    }

    /// Attach a payload to a failed response.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The error kind, when this is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Render as pretty-printed JSON text.
    pub fn to_json_text(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(
                "{{\"success\":false,\"error\":{{\"kind\":\"InternalError\",\"message\":\"Failed to render response: {}\"}}}}",
                e
            )
        })
    }
}

/// Routes named operations to their components.
///
/// The operation table is fixed at construction: the natural-language
/// operations are present exactly when a bridge was supplied.
pub struct Dispatcher {
    session: Arc<SessionManager>,
    executor: QueryExecutor,
    bridge: Option<NlBridge>,
    operations: Vec<Operation>,
    metrics: SharedMetrics,
}

impl Dispatcher {
    pub fn new(
        session: Arc<SessionManager>,
        executor: QueryExecutor,
        bridge: Option<NlBridge>,
        metrics: SharedMetrics,
    ) -> Self {
        let mut operations = Operation::CORE.to_vec();
        if bridge.is_some() {
            operations.extend(Operation::NATURAL_LANGUAGE);
        }
        Self {
            session,
            executor,
            bridge,
            operations,
            metrics,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// The operations this dispatcher serves.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn nl_enabled(&self) -> bool {
        self.bridge.is_some()
    }

    /// MCP tool definitions for the operation table.
    pub fn tools(&self) -> Vec<Tool> {
        self.operations.iter().map(Operation::tool).collect()
    }

    fn lookup(&self, name: &str) -> Result<Operation, ServerError> {
        let op = Operation::from_str(name)?;
        if self.operations.contains(&op) {
            Ok(op)
        } else {
            Err(ServerError::UnknownOperation(name.to_string()))
        }
    }

    /// Run one named operation and shape its outcome.
    pub async fn dispatch(&self, name: &str, arguments: Option<Map<String, Value>>) -> ToolResponse {
        let ctx = RequestContext::new().with_operation(name);
        debug!("{} Dispatching", ctx.log_prefix());

        let response = match self.lookup(name) {
            Ok(Operation::Connect) => self.connect(arguments).await,
            Ok(op) => match self.route(op, arguments).await {
                Ok(payload) => ToolResponse::ok(payload),
                Err(e) => ToolResponse::failure(&e),
            },
            Err(e) => ToolResponse::failure(&e),
        };

        let elapsed = ctx.elapsed().as_millis();
        match &response.error {
            None => info!("{} Completed in {}ms", ctx.log_prefix(), elapsed),
            Some(err) => {
                if err.kind == ErrorKind::ConnectionLost {
                    self.metrics.record_session_lost();
                }
                warn!(
                    "{} Failed in {}ms: {} ({})",
                    ctx.log_prefix(),
                    elapsed,
                    err.message,
                    err.kind
                );
            }
        }
        self.metrics.record_request(response.success);
        response
    }

    async fn route(&self, op: Operation, arguments: Option<Map<String, Value>>) -> Result<Value, ServerError> {
        match op {
            Operation::Connect => Err(ServerError::internal("connect is dispatched directly")),
            Operation::Disconnect => {
                parse_input::<DisconnectInput>(arguments)?;
                self.disconnect().await
            }
            Operation::ListEntities => {
                parse_input::<ListEntitiesInput>(arguments)?;
                self.list_entities().await
            }
            Operation::DescribeEntity => self.describe_entity(parse_input(arguments)?).await,
            Operation::ExecuteQuery => self.execute_query(parse_input(arguments)?).await,
            Operation::AskQuestion => self.ask_question(parse_input(arguments)?).await,
            Operation::SuggestQuestions => {
                parse_input::<SuggestQuestionsInput>(arguments)?;
                self.suggest_questions().await
            }
        }
    }

    /// `connect` reports `{connected: false}` alongside the error on failure.
    async fn connect(&self, arguments: Option<Map<String, Value>>) -> ToolResponse {
        let input: ConnectInput = match parse_input(arguments) {
            Ok(input) => input,
            Err(e) => return ToolResponse::failure(&e),
        };

        match self.session.connect(input.into()).await {
            Ok(state) => {
                self.metrics.record_connect(true);
                let status = self.session.status();
                let catalog = status.catalog.unwrap_or_default();
                ToolResponse::ok(json!({
                    "connected": true,
                    "state": state.to_string(),
                    "catalog": catalog,
                    "endpoint": status.endpoint,
                    "message": format!(
                        "Connected to dataset '{}'. Schema discovery is running in the background.",
                        catalog
                    ),
                }))
            }
            Err(e) => {
                self.metrics.record_connect(false);
                ToolResponse::failure(&e).with_payload(json!({
                    "connected": false,
                    "message": e.to_string(),
                }))
            }
        }
    }

    async fn disconnect(&self) -> Result<Value, ServerError> {
        let was_connected = self.session.is_connected();
        self.session.disconnect().await;
        Ok(json!({
            "connected": false,
            "message": if was_connected { "Disconnected" } else { "No active session" },
        }))
    }

    async fn list_entities(&self) -> Result<Value, ServerError> {
        let entities = self.session.list_entities().await?;
        let listed: Vec<Value> = entities
            .iter()
            .map(|e| {
                let mut entry = json!({"name": e.name, "kind": e.kind});
                if let Some(rows) = e.row_count_hint {
                    entry["rowCountHint"] = json!(rows);
                }
                entry
            })
            .collect();
        Ok(json!({"count": listed.len(), "entities": listed}))
    }

    async fn describe_entity(&self, input: DescribeEntityInput) -> Result<Value, ServerError> {
        let entity = self.session.describe_entity(&input.name).await?;
        let mut payload = serde_json::to_value(&entity)
            .map_err(|e| ServerError::internal(format!("Failed to serialize descriptor: {}", e)))?;
        // Absent optionals are reported as explicit nulls.
        payload["description"] = json!(entity.description);
        payload["rowCountHint"] = json!(entity.row_count_hint);
        payload["relationships"] = json!(entity.relationships);

        if let Some(n) = input.sample_rows {
            if entity.kind == EntityKind::Table {
                let sample = self
                    .run_query(
                        &sample_statement(&entity.name, n),
                        ExecuteOptions {
                            max_rows: Some(n),
                            coerce_numbers: false,
                        },
                    )
                    .await?;
                payload["sample"] = json!({"columns": sample.columns, "rows": sample.rows});
            }
        }
        Ok(payload)
    }

    async fn execute_query(&self, input: ExecuteQueryInput) -> Result<Value, ServerError> {
        let result = self
            .run_query(
                &input.query,
                ExecuteOptions {
                    max_rows: input.max_rows,
                    coerce_numbers: input.coerce_numbers,
                },
            )
            .await?;
        serde_json::to_value(&result)
            .map_err(|e| ServerError::internal(format!("Failed to serialize result: {}", e)))
    }

    async fn ask_question(&self, input: AskQuestionInput) -> Result<Value, ServerError> {
        let bridge = self.bridge()?;
        let summary = self.summarize_schema(true).await?;

        let query = self.generated(bridge.generate_query(&input.question, &summary).await)?;
        info!("Generated query for question: {}", query);

        let result = self.run_query(&query, ExecuteOptions::default()).await?;
        let text = self.generated(bridge.summarize(&input.question, &result).await)?;

        Ok(json!({
            "question": input.question,
            "generatedQuery": result.query,
            "columns": result.columns,
            "rows": result.rows,
            "rowCount": result.row_count,
            "truncated": result.truncated,
            "summary": text,
        }))
    }

    async fn suggest_questions(&self) -> Result<Value, ServerError> {
        let bridge = self.bridge()?;
        let summary = self.summarize_schema(false).await?;
        let questions = self.generated(bridge.suggest_questions(&summary).await)?;
        Ok(json!({"questions": questions}))
    }

    fn bridge(&self) -> Result<&NlBridge, ServerError> {
        self.bridge
            .as_ref()
            .ok_or_else(|| ServerError::internal("natural-language bridge is not configured"))
    }

    fn generated<T>(&self, result: Result<T, ServerError>) -> Result<T, ServerError> {
        self.metrics.record_generation(result.is_ok());
        result
    }

    async fn run_query(&self, raw: &str, options: ExecuteOptions) -> Result<QueryResult, ServerError> {
        let start = Instant::now();
        let result = self.executor.execute(raw, options).await;
        self.metrics.record_query(result.is_ok(), start.elapsed());
        result
    }

    /// Schema summary for prompts, optionally with sample rows of the
    /// first few tables.
    ///
    /// Samples are best effort; only a lost session aborts the summary.
    async fn summarize_schema(&self, with_samples: bool) -> Result<String, ServerError> {
        let entities = self.session.list_entities().await?;
        let mut samples = Vec::new();

        if with_samples {
            for entity in tables(&entities).take(SUMMARY_SAMPLED_TABLES) {
                let options = ExecuteOptions {
                    max_rows: Some(SUMMARY_SAMPLE_ROWS),
                    coerce_numbers: false,
                };
                match self
                    .run_query(&sample_statement(&entity.name, SUMMARY_SAMPLE_ROWS), options)
                    .await
                {
                    Ok(sample) => samples.push((entity.name.clone(), sample)),
                    Err(e) if e.kind() == ErrorKind::ConnectionLost => return Err(e),
                    Err(e) => debug!("Skipping sample rows for '{}': {}", entity.name, e),
                }
            }
        }

        Ok(schema_summary(&entities, &samples))
    }
}

fn tables(entities: &[EntityDescriptor]) -> impl Iterator<Item = &EntityDescriptor> {
    entities.iter().filter(|e| e.kind == EntityKind::Table)
}
