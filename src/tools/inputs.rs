//! Tool input types with JSON Schema generation.
//!
//! Every operation has an explicit parameter struct. Unknown fields are
//! rejected at deserialization; range and emptiness checks run in
//! [`ToolInput::validate`] before any component is invoked.

use crate::constants::MAX_SAMPLE_ROWS;
use crate::error::ServerError;
use crate::session::ConnectRequest;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A deserializable, self-validating operation input.
pub trait ToolInput: DeserializeOwned + JsonSchema {
    /// Check constraints serde cannot express.
    fn validate(&self) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Parse and validate raw arguments.
///
/// Missing arguments are treated as an empty object.
pub fn parse_input<T: ToolInput>(arguments: Option<serde_json::Map<String, serde_json::Value>>) -> Result<T, ServerError> {
    let value = serde_json::Value::Object(arguments.unwrap_or_default());
    let input: T = serde_json::from_value(value).map_err(|e| ServerError::validation(e.to_string()))?;
    input.validate()?;
    Ok(input)
}

/// JSON Schema of an input type, as an object.
pub fn input_schema<T: ToolInput>() -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(schemars::schema_for!(T)) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn require_text(field: &str, value: &str) -> Result<(), ServerError> {
    if value.trim().is_empty() {
        return Err(ServerError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Input for the `connect` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectInput {
    #[schemars(description = "XMLA endpoint: powerbi://api.powerbi.com/v1.0/myorg/<workspace>, asazure://<region>.asazure.windows.net/<server>, an https URL, or a connection string with Data Source")]
    pub endpoint: String,

    #[serde(default)]
    #[schemars(description = "Azure AD tenant id (default: DEFAULT_TENANT_ID)")]
    pub tenant_id: Option<String>,

    #[serde(default)]
    #[schemars(description = "Service principal client id (default: DEFAULT_CLIENT_ID)")]
    pub client_id: Option<String>,

    #[serde(default)]
    #[schemars(description = "Service principal client secret (default: DEFAULT_CLIENT_SECRET)")]
    pub client_secret: Option<String>,

    /// Dataset name; may also come from `Initial Catalog` in a connection string.
    #[serde(default)]
    #[schemars(description = "Dataset (catalog) name")]
    pub catalog: Option<String>,
}

impl ToolInput for ConnectInput {
    fn validate(&self) -> Result<(), ServerError> {
        require_text("endpoint", &self.endpoint)
    }
}

impl From<ConnectInput> for ConnectRequest {
    fn from(input: ConnectInput) -> Self {
        ConnectRequest {
            endpoint: input.endpoint,
            tenant_id: input.tenant_id,
            client_id: input.client_id,
            client_secret: input.client_secret,
            catalog: input.catalog,
        }
    }
}

/// Input for the `disconnect` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DisconnectInput {}

impl ToolInput for DisconnectInput {}

/// Input for the `list-entities` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListEntitiesInput {}

impl ToolInput for ListEntitiesInput {}

/// Input for the `describe-entity` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeEntityInput {
    #[schemars(description = "Entity (table) name, case-sensitive")]
    pub name: String,

    #[serde(default)]
    #[schemars(description = "Include this many sample rows (1-100, tables only)")]
    pub sample_rows: Option<usize>,
}

impl ToolInput for DescribeEntityInput {
    fn validate(&self) -> Result<(), ServerError> {
        require_text("name", &self.name)?;
        match self.sample_rows {
            Some(n) if n == 0 || n > MAX_SAMPLE_ROWS => Err(ServerError::validation(format!(
                "sampleRows must be between 1 and {}",
                MAX_SAMPLE_ROWS
            ))),
            _ => Ok(()),
        }
    }
}

/// Input for the `execute-query` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteQueryInput {
    #[schemars(description = "DAX query to execute, e.g. EVALUATE TOPN(10, 'Sales')")]
    pub query: String,

    /// Maximum number of rows to return (optional, uses server default if not specified).
    #[serde(default)]
    #[schemars(description = "Maximum number of rows to return (default: server configured limit)")]
    pub max_rows: Option<usize>,

    #[serde(default)]
    #[schemars(description = "Return decimal values as JSON numbers instead of exact text (default: false)")]
    pub coerce_numbers: bool,
}

impl ToolInput for ExecuteQueryInput {
    fn validate(&self) -> Result<(), ServerError> {
        require_text("query", &self.query)?;
        if self.max_rows == Some(0) {
            return Err(ServerError::validation("maxRows must be at least 1"));
        }
        Ok(())
    }
}

/// Input for the `ask-question` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AskQuestionInput {
    #[schemars(description = "Question about the data, in natural language")]
    pub question: String,
}

impl ToolInput for AskQuestionInput {
    fn validate(&self) -> Result<(), ServerError> {
        require_text("question", &self.question)
    }
}

/// Input for the `suggest-questions` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuggestQuestionsInput {}

impl ToolInput for SuggestQuestionsInput {}
