//! Centralized constants for the Power BI MCP Server.
//!
//! Default values, remote protocol identifiers and the DMV statements used
//! for discovery all live here so they can be found in one place.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default bounded wait for background discovery, in seconds.
pub const DEFAULT_DISCOVERY_WAIT_SECS: u64 = 30;

/// Default bounded wait for background discovery as Duration.
pub const DEFAULT_DISCOVERY_WAIT: Duration = Duration::from_secs(DEFAULT_DISCOVERY_WAIT_SECS);

/// Default protocol-boundary timeout per tool call, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default protocol-boundary timeout as Duration.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS);

/// Refresh an access token this long before it expires.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

// =============================================================================
// Result Size Constants
// =============================================================================

/// Default maximum rows rendered per query result.
pub const DEFAULT_MAX_RESULT_ROWS: usize = 1_000;

/// Maximum sample rows a caller may request from `describe-entity`.
pub const MAX_SAMPLE_ROWS: usize = 100;

// =============================================================================
// Azure AD / XMLA Constants
// =============================================================================

/// Default Azure AD authority host.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Token scope for the Power BI XMLA endpoint.
pub const POWERBI_SCOPE: &str = "https://analysis.windows.net/powerbi/api/.default";

/// Token scope for Azure Analysis Services.
pub const ASAZURE_SCOPE: &str = "https://*.asazure.windows.net/.default";

/// XMLA namespace of the Execute method.
pub const XMLA_NAMESPACE: &str = "urn:schemas-microsoft-com:xml-analysis";

/// SOAPAction header value for Execute.
pub const XMLA_EXECUTE_ACTION: &str = "\"urn:schemas-microsoft-com:xml-analysis:Execute\"";

// =============================================================================
// Discovery Constants
// =============================================================================

/// Table prefixes excluded from discovery.
pub const EXCLUDED_TABLE_PREFIXES: &[&str] = &["$", "DateTableTemplate_"];

/// DMV listing tables.
pub const DMV_TABLES: &str =
    "SELECT [ID], [Name], [Description], [IsHidden], [IsPrivate] FROM $SYSTEM.TMSCHEMA_TABLES";

/// DMV listing columns.
pub const DMV_COLUMNS: &str = "SELECT [TableID], [ExplicitName], [InferredName], [ExplicitDataType], [Description], [IsHidden], [Type] FROM $SYSTEM.TMSCHEMA_COLUMNS";

/// DMV listing measures.
pub const DMV_MEASURES: &str =
    "SELECT [TableID], [Name], [Expression], [Description] FROM $SYSTEM.TMSCHEMA_MEASURES";

/// DMV listing relationships.
pub const DMV_RELATIONSHIPS: &str = "SELECT [FromTableID], [FromColumnID], [ToTableID], [ToColumnID], [FromCardinality], [ToCardinality], [CrossFilteringBehavior], [IsActive] FROM $SYSTEM.TMSCHEMA_RELATIONSHIPS";

/// DMV listing column ids, used to resolve relationship endpoints.
pub const DMV_COLUMN_IDS: &str =
    "SELECT [ID], [TableID], [ExplicitName], [InferredName] FROM $SYSTEM.TMSCHEMA_COLUMNS";

/// DMV with per-dimension storage row counts.
pub const DMV_STORAGE_TABLES: &str =
    "SELECT [DIMENSION_NAME], [ROWS_COUNT] FROM $SYSTEM.DISCOVER_STORAGE_TABLES";

/// Statement used to prove a catalog is reachable during connect.
pub const HANDSHAKE_PROBE: &str = "SELECT [ID] FROM $SYSTEM.TMSCHEMA_TABLES WHERE [ID] = 0";

// =============================================================================
// Language Model Constants
// =============================================================================

/// Default chat model.
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Default OpenAI-compatible API base URL.
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

/// Temperature used when generating queries.
pub const GENERATION_TEMPERATURE: f32 = 0.1;

/// Temperature used when summarizing results.
pub const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Temperature used when suggesting questions.
pub const SUGGESTION_TEMPERATURE: f32 = 0.7;

/// Maximum entities included in a schema summary.
pub const SUMMARY_MAX_ENTITIES: usize = 25;

/// Number of tables sampled for the schema summary.
pub const SUMMARY_SAMPLED_TABLES: usize = 5;

/// Sample rows per sampled table.
pub const SUMMARY_SAMPLE_ROWS: usize = 3;

/// Rows of a result handed to the summary prompt.
pub const SUMMARY_MAX_RESULT_ROWS: usize = 50;

/// Questions returned when the model output cannot be parsed.
pub const FALLBACK_QUESTIONS: [&str; 5] = [
    "What are the total sales?",
    "Show me the top 10 products",
    "What is the trend over time?",
    "Which region has the highest revenue?",
    "What are the key metrics?",
];

// =============================================================================
// Shutdown Constants
// =============================================================================

/// Default shutdown drain timeout in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Default shutdown drain timeout as Duration.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS);

/// Sleep interval during drain phase.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Transport Constants
// =============================================================================

/// Default HTTP bind host.
pub const DEFAULT_HTTP_HOST: &str = "0.0.0.0";

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

// =============================================================================
// Logging Constants
// =============================================================================

/// Default truncation length for query logging.
pub const LOG_QUERY_TRUNCATE_LENGTH: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_durations() {
        assert_eq!(DEFAULT_DISCOVERY_WAIT, Duration::from_secs(30));
        assert_eq!(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs(120));
        assert!(TOKEN_REFRESH_MARGIN < Duration::from_secs(3600));
    }

    #[test]
    fn test_shutdown_durations() {
        assert_eq!(DEFAULT_DRAIN_TIMEOUT, Duration::from_secs(30));
        assert!(DRAIN_POLL_INTERVAL < DEFAULT_DRAIN_TIMEOUT);
    }

    #[test]
    fn test_fallback_questions() {
        assert_eq!(FALLBACK_QUESTIONS.len(), 5);
        assert!(FALLBACK_QUESTIONS.iter().all(|q| q.ends_with('?')));
    }

    #[test]
    fn test_sample_bounds() {
        assert!(SUMMARY_SAMPLE_ROWS <= MAX_SAMPLE_ROWS);
        assert!(SUMMARY_SAMPLED_TABLES <= SUMMARY_MAX_ENTITIES);
    }
}
