//! Integration tests for the Power BI MCP Server.
//!
//! These drive the public dispatcher end to end against an in-memory XMLA
//! connector that serves a small fixture model and counts remote round trips:
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

use async_trait::async_trait;
use chrono::NaiveDate;
use powerbi_mcp_server::bridge::{LanguageModel, NlBridge};
use powerbi_mcp_server::config::{Config, CredentialDefaults};
use powerbi_mcp_server::session::ConnectionState;
use powerbi_mcp_server::tools::ToolResponse;
use powerbi_mcp_server::xmla::{
    CellValue, ColumnDescriptor, ConnectParams, EntityDescriptor, MeasureDescriptor, Rowset,
    RowsetColumn, XmlaConnection, XmlaConnector,
};
use powerbi_mcp_server::{ErrorKind, PowerBiMcpServer, ServerError};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const ENDPOINT: &str = "powerbi://api.powerbi.com/v1.0/myorg/Contoso";

/// Round trips observed by the fake remote server.
#[derive(Default)]
struct RemoteCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    executes: AtomicUsize,
    lists: AtomicUsize,
    describes: AtomicUsize,
    /// Every statement sent, in order.
    statements: Mutex<Vec<String>>,
    /// Makes the next round trip fail at the transport level.
    break_transport: AtomicBool,
    /// While set, `execute` parks until `execute_gate` is notified.
    hold_execute: AtomicBool,
    execute_gate: Notify,
    /// While set, `list_entities` parks until `list_gate` is notified.
    hold_list: AtomicBool,
    list_gate: Notify,
}

impl RemoteCounters {
    fn round_trips(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
            + self.lists.load(Ordering::SeqCst)
            + self.describes.load(Ordering::SeqCst)
    }
}

struct FixtureConnector {
    remote: Arc<RemoteCounters>,
    secret: &'static str,
}

#[async_trait]
impl XmlaConnector for FixtureConnector {
    async fn open(&self, params: &ConnectParams) -> Result<Box<dyn XmlaConnection>, ServerError> {
        self.remote.opens.fetch_add(1, Ordering::SeqCst);
        if params.client_secret != self.secret {
            return Err(ServerError::auth(
                "AADSTS7000215: Invalid client secret provided",
            ));
        }
        if params.catalog != "Contoso Sales" {
            return Err(ServerError::connection(format!(
                "Dataset '{}' is not reachable",
                params.catalog
            )));
        }
        Ok(Box::new(FixtureConnection {
            remote: Arc::clone(&self.remote),
        }))
    }
}

struct FixtureConnection {
    remote: Arc<RemoteCounters>,
}

fn sales() -> EntityDescriptor {
    let mut sales = EntityDescriptor::table(
        "Sales",
        vec![
            ColumnDescriptor::new("Date", "DateTime"),
            ColumnDescriptor::new("Amount", "Decimal"),
        ],
    );
    sales.measures = vec![MeasureDescriptor::new(
        "Total Sales",
        Some("SUM(Sales[Amount])".into()),
    )];
    sales.row_count_hint = Some(3);
    sales
}

fn product() -> EntityDescriptor {
    EntityDescriptor::table("Product", vec![ColumnDescriptor::new("Name", "String")])
}

/// Added to the model after discovery ran.
fn calendar() -> EntityDescriptor {
    EntityDescriptor::table("Calendar", vec![ColumnDescriptor::new("Year", "Int64")])
}

fn sales_rows() -> Vec<Vec<CellValue>> {
    let day = |d| {
        CellValue::DateTime(
            NaiveDate::from_ymd_opt(2024, 1, d)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .unwrap(),
        )
    };
    let amount = |a: &str| CellValue::Decimal(Decimal::from_str(a).unwrap());
    vec![
        vec![day(1), amount("100.50")],
        vec![day(2), amount("250.00")],
        vec![day(3), CellValue::Null],
    ]
}

/// `n` from a leading `EVALUATE TOPN(n, ...)`.
fn topn(statement: &str) -> Option<usize> {
    let rest = statement.trim().strip_prefix("EVALUATE TOPN(")?;
    rest.split(',').next()?.trim().parse().ok()
}

#[async_trait]
impl XmlaConnection for FixtureConnection {
    async fn execute(&mut self, statement: &str) -> Result<Rowset, ServerError> {
        self.remote.executes.fetch_add(1, Ordering::SeqCst);
        self.remote.statements.lock().unwrap().push(statement.to_string());
        if self.remote.hold_execute.load(Ordering::SeqCst) {
            self.remote.execute_gate.notified().await;
        }
        if self.remote.break_transport.load(Ordering::SeqCst) {
            return Err(ServerError::connection("connection reset by peer"));
        }

        let (columns, mut rows) = if statement.contains("Sales") {
            (vec!["Sales[Date]", "Sales[Amount]"], sales_rows())
        } else if statement.contains("Product") {
            (
                vec!["Product[Name]"],
                vec![
                    vec![CellValue::Text("Bike".into())],
                    vec![CellValue::Text("Helmet".into())],
                ],
            )
        } else {
            return Err(ServerError::query_error_with_code(
                "Query (1, 10) Failed to resolve name 'Salez'.",
                "3238002695",
            ));
        };

        if let Some(n) = topn(statement) {
            rows.truncate(n);
        }
        Ok(Rowset::new(
            columns.into_iter().map(RowsetColumn::new).collect(),
            rows,
        ))
    }

    async fn list_entities(&mut self) -> Result<Vec<EntityDescriptor>, ServerError> {
        self.remote.lists.fetch_add(1, Ordering::SeqCst);
        if self.remote.hold_list.load(Ordering::SeqCst) {
            self.remote.list_gate.notified().await;
        }
        if self.remote.break_transport.load(Ordering::SeqCst) {
            return Err(ServerError::connection("connection reset by peer"));
        }
        Ok(vec![sales(), product()])
    }

    async fn describe_entity(&mut self, name: &str) -> Result<Option<EntityDescriptor>, ServerError> {
        self.remote.describes.fetch_add(1, Ordering::SeqCst);
        Ok([sales(), product(), calendar()]
            .into_iter()
            .find(|e| e.name == name))
    }

    async fn close(&mut self) {
        self.remote.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Replays canned model replies in order.
struct ScriptedModel {
    replies: Mutex<Vec<Result<String, ServerError>>>,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _system: &str, _user: &str, _temperature: f32) -> Result<String, ServerError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(ServerError::generation("no scripted reply left"));
        }
        replies.remove(0)
    }
}

fn config() -> Config {
    Config {
        credentials: CredentialDefaults {
            tenant_id: Some("contoso.onmicrosoft.com".into()),
            client_id: Some("00000000-0000-0000-0000-000000000001".into()),
            client_secret: Some("right-secret".into()),
        },
        ..Config::default()
    }
}

fn server_with(replies: Option<Vec<&str>>) -> (PowerBiMcpServer, Arc<RemoteCounters>) {
    let remote = Arc::new(RemoteCounters::default());
    let connector = Arc::new(FixtureConnector {
        remote: Arc::clone(&remote),
        secret: "right-secret",
    });
    let bridge = replies.map(|replies| {
        NlBridge::new(Arc::new(ScriptedModel {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
        }))
    });
    (PowerBiMcpServer::with_parts(config(), connector, bridge), remote)
}

fn server() -> (PowerBiMcpServer, Arc<RemoteCounters>) {
    server_with(None)
}

fn args(value: Value) -> Option<Map<String, Value>> {
    value.as_object().cloned()
}

async fn call(server: &PowerBiMcpServer, name: &str, arguments: Value) -> ToolResponse {
    server.dispatcher().dispatch(name, args(arguments)).await
}

async fn connect(server: &PowerBiMcpServer) -> ToolResponse {
    call(server, "connect", json!({"endpoint": ENDPOINT, "catalog": "Contoso Sales"})).await
}

fn payload(response: ToolResponse) -> Value {
    assert!(response.success, "expected success, got {:?}", response.error);
    response.payload.unwrap()
}

mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_list_describe_execute() {
        let (server, _) = server();

        let connected = payload(connect(&server).await);
        assert_eq!(connected["connected"], true);
        assert_eq!(connected["catalog"], "Contoso Sales");

        let listed = payload(call(&server, "list-entities", json!({})).await);
        let names: Vec<&str> = listed["entities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Sales", "Product"]);
        assert_eq!(listed["count"], 2);
        assert_eq!(listed["entities"][0]["rowCountHint"], 3);

        let described = payload(call(&server, "describe-entity", json!({"name": "Sales"})).await);
        let columns: Vec<&str> = described["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(columns, vec!["Date", "Amount"]);
        assert_eq!(described["measures"][0]["name"], "Total Sales");

        let result = payload(
            call(&server, "execute-query", json!({"query": "EVALUATE TOPN(1, Sales)"})).await,
        );
        assert_eq!(result["columns"], json!(["Sales[Date]", "Sales[Amount]"]));
        assert_eq!(result["rows"], json!([["2024-01-01T00:00:00", "100.50"]]));
        assert_eq!(result["rowCount"], 1);
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let (server, remote) = server();

        let response = call(
            &server,
            "connect",
            json!({"endpoint": ENDPOINT, "catalog": "Contoso Sales", "clientSecret": "wrong"}),
        )
        .await;
        assert!(!response.success);
        assert_eq!(response.error_kind(), Some(ErrorKind::AuthenticationFailed));
        assert_eq!(response.payload.as_ref().unwrap()["connected"], false);
        assert_eq!(server.session().state(), ConnectionState::Failed);

        let response = call(&server, "execute-query", json!({"query": "EVALUATE Sales"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::NotConnected));
        assert_eq!(remote.executes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_catalog() {
        let (server, _) = server();
        let response = call(
            &server,
            "connect",
            json!({"endpoint": ENDPOINT, "catalog": "Nope"}),
        )
        .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::ConnectionFailed));
        assert!(!server.session().is_connected());
    }

    #[tokio::test]
    async fn test_connected_only_operations_before_connect() {
        let (server, remote) = server();

        for (name, arguments) in [
            ("list-entities", json!({})),
            ("describe-entity", json!({"name": "Sales"})),
            ("execute-query", json!({"query": "EVALUATE Sales"})),
        ] {
            let response = call(&server, name, arguments).await;
            assert_eq!(response.error_kind(), Some(ErrorKind::NotConnected), "{}", name);
        }
        assert_eq!(remote.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_fails_session() {
        let (server, remote) = server();
        connect(&server).await;
        payload(call(&server, "list-entities", json!({})).await);

        remote.break_transport.store(true, Ordering::SeqCst);
        let response = call(&server, "execute-query", json!({"query": "EVALUATE Sales"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::ConnectionLost));
        assert_eq!(server.session().state(), ConnectionState::Failed);
        assert_eq!(server.session().cache().stats().entry_count, 0);
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);

        let response = call(&server, "list-entities", json!({})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::NotConnected));
        assert_eq!(server.metrics().snapshot().sessions_lost, 1);
    }

    #[tokio::test]
    async fn test_rejected_query_keeps_session() {
        let (server, _) = server();
        connect(&server).await;

        let response = call(&server, "execute-query", json!({"query": "EVALUATE Salez"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::QuerySyntaxError));
        assert!(server.session().is_connected());

        payload(call(&server, "execute-query", json!({"query": "EVALUATE Sales"})).await);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let (server, remote) = server();
        connect(&server).await;
        connect(&server).await;
        assert_eq!(remote.opens.load(Ordering::SeqCst), 2);
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);

        let listed = payload(call(&server, "list-entities", json!({})).await);
        assert_eq!(listed["count"], 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (server, remote) = server();
        payload(call(&server, "disconnect", json!({})).await);

        connect(&server).await;
        payload(call(&server, "disconnect", json!({})).await);
        payload(call(&server, "disconnect", json!({})).await);
        assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
        assert_eq!(server.session().state(), ConnectionState::Disconnected);

        let response = call(&server, "list-entities", json!({})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::NotConnected));
    }
}

mod schema_tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_waits_for_discovery() {
        let (server, remote) = server();
        connect(&server).await;

        let (a, b) = tokio::join!(
            call(&server, "list-entities", json!({})),
            call(&server, "list-entities", json!({}))
        );
        assert_eq!(payload(a)["count"], 2);
        assert_eq!(payload(b)["count"], 2);
        assert_eq!(remote.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listing_pending_until_discovery_finishes() {
        let (server, remote) = server();
        remote.hold_list.store(true, Ordering::SeqCst);
        connect(&server).await;

        let listing = tokio::spawn({
            let server = server.clone();
            async move { call(&server, "list-entities", json!({})).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!listing.is_finished());
        assert_eq!(remote.lists.load(Ordering::SeqCst), 1);

        remote.list_gate.notify_one();
        let listed = payload(listing.await.unwrap());
        assert_eq!(listed["count"], 2);
        assert_eq!(remote.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listing_racing_connect_runs_discovery_once() {
        let (server, remote) = server();
        remote.hold_list.store(true, Ordering::SeqCst);

        let racer = tokio::spawn({
            let server = server.clone();
            async move {
                loop {
                    let response = call(&server, "list-entities", json!({})).await;
                    if response.error_kind() != Some(ErrorKind::NotConnected) {
                        return response;
                    }
                    tokio::task::yield_now().await;
                }
            }
        });
        payload(connect(&server).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.list_gate.notify_one();
        assert_eq!(payload(racer.await.unwrap())["count"], 2);
        assert_eq!(remote.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_describe_does_not_wait_for_running_query() {
        let (server, remote) = server();
        connect(&server).await;
        payload(call(&server, "list-entities", json!({})).await);

        remote.hold_execute.store(true, Ordering::SeqCst);
        let query = tokio::spawn({
            let server = server.clone();
            async move { call(&server, "execute-query", json!({"query": "EVALUATE 'Sales'"})).await }
        });
        while remote.executes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let described = tokio::time::timeout(
            Duration::from_secs(2),
            call(&server, "describe-entity", json!({"name": "Sales"})),
        )
        .await
        .expect("cached describe-entity waited for the transport");
        assert_eq!(payload(described)["name"], "Sales");
        assert!(!query.is_finished());

        remote.execute_gate.notify_one();
        payload(query.await.unwrap());
    }

    #[tokio::test]
    async fn test_describe_hit_needs_no_round_trip() {
        let (server, remote) = server();
        connect(&server).await;
        payload(call(&server, "list-entities", json!({})).await);

        let before = remote.round_trips();
        payload(call(&server, "describe-entity", json!({"name": "Product"})).await);
        assert_eq!(remote.round_trips(), before);
    }

    #[tokio::test]
    async fn test_describe_miss_is_one_round_trip_then_cached() {
        let (server, remote) = server();
        connect(&server).await;
        payload(call(&server, "list-entities", json!({})).await);

        let before = remote.round_trips();
        let described = payload(call(&server, "describe-entity", json!({"name": "Calendar"})).await);
        assert_eq!(described["columns"][0]["name"], "Year");
        assert_eq!(remote.round_trips(), before + 1);

        payload(call(&server, "describe-entity", json!({"name": "Calendar"})).await);
        assert_eq!(remote.round_trips(), before + 1);
    }

    #[tokio::test]
    async fn test_describe_unknown_entity() {
        let (server, _) = server();
        connect(&server).await;

        let response = call(&server, "describe-entity", json!({"name": "sales"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::EntityNotFound));
        assert!(server.session().is_connected());
    }

    #[tokio::test]
    async fn test_describe_with_sample_rows() {
        let (server, remote) = server();
        connect(&server).await;

        let described = payload(
            call(&server, "describe-entity", json!({"name": "Sales", "sampleRows": 2})).await,
        );
        assert_eq!(described["kind"], "table");
        assert!(described["description"].is_null());
        assert_eq!(described["sample"]["rows"].as_array().unwrap().len(), 2);

        let statements = remote.statements.lock().unwrap();
        assert_eq!(statements.last().unwrap(), "EVALUATE TOPN(2, 'Sales')");
    }
}

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_query_is_sanitized_before_execution() {
        let (server, remote) = server();
        connect(&server).await;

        let result = payload(
            call(
                &server,
                "execute-query",
                json!({"query": "```dax\n<b>EVALUATE</b> TOPN(1, \u{2018}Sales\u{2019})\n```"}),
            )
            .await,
        );
        assert_eq!(result["query"], "EVALUATE TOPN(1, 'Sales')");
        assert_eq!(
            remote.statements.lock().unwrap().last().unwrap(),
            "EVALUATE TOPN(1, 'Sales')"
        );
    }

    #[tokio::test]
    async fn test_nulls_truncation_and_coercion() {
        let (server, _) = server();
        connect(&server).await;

        let result = payload(
            call(
                &server,
                "execute-query",
                json!({"query": "EVALUATE Sales", "maxRows": 2, "coerceNumbers": true}),
            )
            .await,
        );
        assert_eq!(result["rows"].as_array().unwrap().len(), 2);
        assert_eq!(result["rowCount"], 3);
        assert_eq!(result["truncated"], true);
        assert_eq!(result["rows"][0][1], 100.5);

        let result = payload(call(&server, "execute-query", json!({"query": "EVALUATE Sales"})).await);
        assert!(result["rows"][2][1].is_null());
        assert_eq!(result["truncated"], false);
    }

    #[tokio::test]
    async fn test_invalid_parameters_never_reach_server() {
        let (server, remote) = server();
        connect(&server).await;
        let before = remote.round_trips();

        for arguments in [
            json!({}),
            json!({"query": 7}),
            json!({"query": "EVALUATE Sales", "format": "csv"}),
            json!({"query": "<p></p>"}),
        ] {
            let response = call(&server, "execute-query", arguments).await;
            assert_eq!(response.error_kind(), Some(ErrorKind::ValidationError));
        }
        assert_eq!(remote.round_trips(), before);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let (server, _) = server();
        let response = call(&server, "drop-table", json!({})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::UnknownOperation));
    }
}

mod natural_language_tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_absent_without_model() {
        let (server, _) = server();
        let names: Vec<String> = server
            .dispatcher()
            .tools()
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert!(!names.contains(&"ask-question".to_string()));
        assert!(!names.contains(&"suggest-questions".to_string()));

        connect(&server).await;
        let response = call(&server, "ask-question", json!({"question": "Total sales?"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::UnknownOperation));
    }

    #[tokio::test]
    async fn test_ask_question() {
        let (server, remote) = server_with(Some(vec![
            "```dax\nEVALUATE TOPN(1, Sales)\n```",
            "  Sales on January 1st were 100.50.  ",
        ]));
        assert_eq!(server.dispatcher().tools().len(), 7);
        connect(&server).await;

        let answer = payload(call(&server, "ask-question", json!({"question": "First day sales?"})).await);
        assert_eq!(answer["generatedQuery"], "EVALUATE TOPN(1, Sales)");
        assert_eq!(answer["rows"], json!([["2024-01-01T00:00:00", "100.50"]]));
        assert_eq!(answer["summary"], "Sales on January 1st were 100.50.");

        // Sample rows for both tables, then the generated query.
        let statements = remote.statements.lock().unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "EVALUATE TOPN(3, 'Sales')");
    }

    #[tokio::test]
    async fn test_ask_question_rejects_non_query_output() {
        let (server, _) = server_with(Some(vec!["I am not able to answer that."]));
        connect(&server).await;

        let response = call(&server, "ask-question", json!({"question": "Why?"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::GenerationError));
        assert_eq!(server.metrics().snapshot().generations_failed, 1);
    }

    #[tokio::test]
    async fn test_ask_question_requires_connection() {
        let (server, _) = server_with(Some(vec![]));
        let response = call(&server, "ask-question", json!({"question": "Total sales?"})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn test_suggest_questions_fallback() {
        let (server, _) = server_with(Some(vec!["Here are some ideas!"]));
        connect(&server).await;

        let suggested = payload(call(&server, "suggest-questions", json!({})).await);
        let questions = suggested["questions"].as_array().unwrap();
        assert_eq!(questions.len(), 5);
        assert_eq!(questions[0], "What are the total sales?");
    }

    #[tokio::test]
    async fn test_suggest_questions_parses_array() {
        let (server, _) = server_with(Some(vec![r#"["Which product sells best?", "How do sales trend?"]"#]));
        connect(&server).await;

        let suggested = payload(call(&server, "suggest-questions", json!({})).await);
        assert_eq!(suggested["questions"][1], "How do sales trend?");
    }
}
