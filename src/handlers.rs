//! ServerHandler implementation for the Power BI MCP Server.
//!
//! This module implements the rmcp `ServerHandler` trait which defines how
//! the server responds to MCP protocol requests. Tool calls are handed to the
//! [`Dispatcher`](crate::tools::Dispatcher) under the request timeout.

use crate::error::ServerError;
use crate::server::PowerBiMcpServer;
use crate::tools::ToolResponse;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ErrorData;
use tracing::{info, warn};

impl ServerHandler for PowerBiMcpServer {
    /// Server identification - called during initialization handshake.
    fn get_info(&self) -> ServerInfo {
        info!("MCP client requesting server info");

        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,

            capabilities: ServerCapabilities::builder().enable_tools().build(),

            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                title: Some("Power BI MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },

            instructions: Some(build_instructions(self)),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult::with_all_items(self.dispatcher.tools()))
    }

    /// Every outcome, including a timeout, is a tool result; protocol-level
    /// errors are reserved for the transport.
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let _guard = self.track_request();
        let timeout = self.config.query.request_timeout;

        let response = match tokio::time::timeout(
            timeout,
            self.dispatcher.dispatch(&request.name, request.arguments),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    "Tool '{}' timed out after {}s",
                    request.name,
                    timeout.as_secs()
                );
                self.metrics.record_request(false);
                ToolResponse::failure(&ServerError::timeout(timeout.as_secs()))
            }
        };

        Ok(to_call_result(&response))
    }
}

/// Render an envelope as a single JSON text item.
pub fn to_call_result(response: &ToolResponse) -> CallToolResult {
    let content = vec![Content::text(response.to_json_text())];
    if response.success {
        CallToolResult::success(content)
    } else {
        CallToolResult::error(content)
    }
}

/// Build server instructions based on the operation table.
fn build_instructions(server: &PowerBiMcpServer) -> String {
    let mut instructions = String::new();

    instructions.push_str("# Power BI MCP Server\n\n");
    instructions.push_str(
        "This server queries Power BI datasets and Analysis Services tabular models over XMLA.\n\n",
    );

    instructions.push_str("## Workflow\n");
    instructions.push_str("1. `connect` with the workspace XMLA endpoint and dataset name\n");
    instructions.push_str("2. `list-entities` and `describe-entity` to explore the model\n");
    instructions.push_str("3. `execute-query` with DAX, e.g. `EVALUATE TOPN(10, 'Sales')`\n");

    if server.dispatcher.nl_enabled() {
        instructions.push_str("\n## Natural language\n");
        instructions.push_str("- `ask-question` turns a question into DAX, runs it and summarizes the result\n");
        instructions.push_str("- `suggest-questions` proposes questions for the connected dataset\n");
    } else {
        instructions.push_str(
            "\nNatural-language operations are not available: no language model is configured.\n",
        );
    }

    instructions.push_str(&format!(
        "\nResults are capped at {} rows. Calls time out after {} seconds.\n",
        server.config.query.max_result_rows,
        server.config.query.request_timeout.as_secs()
    ));

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_instructions_report_missing_model() {
        let server = PowerBiMcpServer::new(Config::default()).unwrap();
        let info = server.get_info();
        let text = info.instructions.unwrap();
        assert!(text.contains("not available"));
        assert!(!text.contains("`ask-question`"));
        assert_eq!(info.server_info.name, "powerbi-mcp-server");
    }

    #[test]
    fn test_error_envelope_sets_is_error() {
        let result = to_call_result(&ToolResponse::failure(&ServerError::NotConnected));
        assert_eq!(result.is_error, Some(true));

        let result = to_call_result(&ToolResponse::ok(serde_json::json!({})));
        assert_eq!(result.is_error, Some(false));
    }
}
