//! Natural-language bridge.
//!
//! Turns a question plus a schema summary into a DAX query, and a result back
//! into prose. The model itself sits behind [`LanguageModel`]; this module
//! only shapes prompts and validates what comes back.

use crate::config::LlmConfig;
use crate::constants::{
    FALLBACK_QUESTIONS, GENERATION_TEMPERATURE, SUGGESTION_TEMPERATURE, SUMMARY_MAX_ENTITIES,
    SUMMARY_MAX_RESULT_ROWS, SUMMARY_TEMPERATURE,
};
use crate::error::ServerError;
use crate::executor::QueryResult;
use crate::sanitize::sanitize;
use crate::xmla::EntityDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

const GENERATION_SYSTEM_PROMPT: &str = "You are a DAX query expert. Generate only valid, clean DAX queries without any markup or formatting.";

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful data analyst providing insights from Power BI data.";

const SUGGESTION_SYSTEM_PROMPT: &str =
    "You are a data analyst suggesting interesting questions about data.";

/// A text-generation service: system and user prompt in, text out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, ServerError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiChatModel {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiChatModel {
    pub fn new(config: LlmConfig) -> Result<Self, ServerError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("powerbi-mcp-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServerError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, ServerError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServerError::generation(format!("Language model unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Language model returned HTTP {}", status.as_u16());
            return Err(ServerError::generation(format!(
                "Language model returned HTTP {}: {}",
                status.as_u16(),
                body.lines().next().unwrap_or_default()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServerError::generation(format!("Unreadable model response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ServerError::generation("Language model returned no content"))
    }
}

/// Prompt shaping and output validation around a [`LanguageModel`].
#[derive(Clone)]
pub struct NlBridge {
    model: Arc<dyn LanguageModel>,
}

impl NlBridge {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Generate a DAX query answering `question`.
    pub async fn generate_query(&self, question: &str, schema_summary: &str) -> Result<String, ServerError> {
        let prompt = format!(
            "Generate a DAX query to answer the following question.\n\n\
             Available tables and their schemas:\n{schema_summary}\n\n\
             User question: {question}\n\n\
             Rules:\n\
             1. Return only the DAX query, without explanation.\n\
             2. Do not use HTML or XML tags, or code fences.\n\
             3. Reference only tables, columns and measures listed above.\n\
             4. The query must start with EVALUATE or DEFINE.\n\n\
             Example: EVALUATE SUMMARIZE(Sales, Product[Category], \"Total\", SUM(Sales[Amount]))"
        );

        let raw = self
            .model
            .complete(GENERATION_SYSTEM_PROMPT, &prompt, GENERATION_TEMPERATURE)
            .await?;
        let query = validate_generated_query(&raw)?;
        debug!("Generated query: {}", query);
        Ok(query)
    }

    /// Explain `result` as an answer to `question`.
    pub async fn summarize(&self, question: &str, result: &QueryResult) -> Result<String, ServerError> {
        let records = result.records(SUMMARY_MAX_RESULT_ROWS);
        let rows = serde_json::to_string_pretty(&records)
            .map_err(|e| ServerError::internal(format!("Failed to render rows: {}", e)))?;

        let prompt = format!(
            "User question: {question}\n\n\
             DAX query executed: {query}\n\n\
             Query results ({shown} of {total} rows):\n{rows}\n\n\
             Provide a clear, concise answer to the question based on these results. \
             Include the relevant numbers. Do not use HTML or XML markup.",
            query = result.query,
            shown = records.len(),
            total = result.row_count,
        );

        let summary = self
            .model
            .complete(SUMMARY_SYSTEM_PROMPT, &prompt, SUMMARY_TEMPERATURE)
            .await?;
        Ok(summary.trim().to_string())
    }

    /// Five questions worth asking about the model.
    ///
    /// Output that is not a JSON array of strings yields the fixed fallback list.
    pub async fn suggest_questions(&self, schema_summary: &str) -> Result<Vec<String>, ServerError> {
        let prompt = format!(
            "Based on the following Power BI dataset structure, suggest 5 interesting questions a user might ask.\n\n\
             Tables and schemas:\n{schema_summary}\n\n\
             Generate 5 diverse questions that showcase different aspects of the data. \
             Return only the questions as a JSON array of strings."
        );

        let raw = self
            .model
            .complete(SUGGESTION_SYSTEM_PROMPT, &prompt, SUGGESTION_TEMPERATURE)
            .await?;
        Ok(parse_questions(&raw))
    }
}

/// Strip fences and formatting, then require a DAX statement keyword.
pub fn validate_generated_query(raw: &str) -> Result<String, ServerError> {
    let query = sanitize(raw);
    let head = query.trim_start().to_ascii_uppercase();
    if head.starts_with("EVALUATE") || head.starts_with("DEFINE") {
        Ok(query)
    } else if query.is_empty() {
        Err(ServerError::generation("The model returned an empty query"))
    } else {
        Err(ServerError::generation(format!(
            "The model did not return a DAX query: {}",
            crate::executor::truncate_for_log(&query, 80)
        )))
    }
}

fn parse_questions(raw: &str) -> Vec<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str::<Vec<String>>(trimmed) {
        Ok(questions) if !questions.is_empty() => questions,
        _ => {
            debug!("Unparsable suggestions; using fallback questions");
            FALLBACK_QUESTIONS.iter().map(|q| q.to_string()).collect()
        }
    }
}

/// JSON summary of the model for prompts: up to a fixed number of entities,
/// with sample rows for the tables in `samples`.
pub fn schema_summary(entities: &[EntityDescriptor], samples: &[(String, QueryResult)]) -> String {
    let schemas: Vec<_> = entities
        .iter()
        .take(SUMMARY_MAX_ENTITIES)
        .map(|e| {
            let mut entry = json!({
                "name": e.name,
                "kind": e.kind,
                "columns": e.columns.iter().map(|c| json!({"name": c.name, "type": c.type_hint})).collect::<Vec<_>>(),
                "measures": e.measures.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            });
            if let Some((_, sample)) = samples.iter().find(|(name, _)| name == &e.name) {
                entry["sampleRows"] = json!(sample.records(sample.rows.len()));
            }
            entry
        })
        .collect();

    serde_json::to_string_pretty(&schemas).unwrap_or_else(|_| "[]".to_string())
}
