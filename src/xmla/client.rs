//! SOAP-over-HTTPS implementation of the connection traits.

use crate::config::XmlaConfig;
use crate::constants::{
    DMV_COLUMNS, DMV_COLUMN_IDS, DMV_MEASURES, DMV_RELATIONSHIPS, DMV_STORAGE_TABLES, DMV_TABLES,
    HANDSHAKE_PROBE, XMLA_EXECUTE_ACTION,
};
use crate::error::ServerError;
use crate::xmla::auth::TokenProvider;
use crate::xmla::catalog;
use crate::xmla::soap;
use crate::xmla::types::{ConnectParams, EntityDescriptor, Rowset};
use crate::xmla::{XmlaConnection, XmlaConnector};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

/// Opens connections against Power BI Premium or Azure Analysis Services.
pub struct HttpConnector {
    http: reqwest::Client,
    config: XmlaConfig,
}

impl HttpConnector {
    pub fn new(config: &XmlaConfig) -> Result<Self, ServerError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("powerbi-mcp-server/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.http_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ServerError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl XmlaConnector for HttpConnector {
    async fn open(&self, params: &ConnectParams) -> Result<Box<dyn XmlaConnection>, ServerError> {
        let scope = self
            .config
            .token_scope
            .clone()
            .unwrap_or_else(|| params.endpoint.token_scope().to_string());

        let mut tokens = TokenProvider::new(
            self.http.clone(),
            &self.config.authority_host,
            &params.tenant_id,
            &params.client_id,
            &params.client_secret,
            &scope,
        );
        tokens.token().await?;

        let mut connection = HttpConnection {
            http: self.http.clone(),
            url: params.endpoint.url().clone(),
            catalog: params.catalog.clone(),
            tokens,
        };

        match connection.execute(HANDSHAKE_PROBE).await {
            Ok(_) => {
                info!(
                    "Opened XMLA connection to {} (catalog '{}')",
                    connection.url, connection.catalog
                );
                Ok(Box::new(connection))
            }
            // A rejected probe means the catalog does not exist or is not
            // visible to this principal.
            Err(ServerError::QuerySyntax { message, .. }) => Err(ServerError::connection(format!(
                "Dataset '{}' is not reachable: {}",
                params.catalog, message
            ))),
            Err(e) => Err(e),
        }
    }
}

struct HttpConnection {
    http: reqwest::Client,
    url: Url,
    catalog: String,
    tokens: TokenProvider,
}

impl HttpConnection {
    /// Run best-effort enrichment; only session-fatal failures propagate.
    async fn enrich(
        &mut self,
        entities: &mut [EntityDescriptor],
        tables: Option<&Rowset>,
    ) -> Result<(), ServerError> {
        match self.execute(DMV_STORAGE_TABLES).await {
            Ok(storage) => catalog::apply_row_counts(entities, &storage),
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => debug!("Row counts unavailable: {}", e),
        }

        let result = async {
            let all_tables = match tables {
                Some(t) => t.clone(),
                None => self.execute(DMV_TABLES).await?,
            };
            let column_ids = self.execute(DMV_COLUMN_IDS).await?;
            let relationships = self.execute(DMV_RELATIONSHIPS).await?;
            Ok::<_, ServerError>((all_tables, column_ids, relationships))
        }
        .await;

        match result {
            Ok((all_tables, column_ids, relationships)) => {
                catalog::apply_relationships(entities, &all_tables, &column_ids, &relationships)
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => debug!("Relationships unavailable: {}", e),
        }
        Ok(())
    }
}

#[async_trait]
impl XmlaConnection for HttpConnection {
    async fn execute(&mut self, statement: &str) -> Result<Rowset, ServerError> {
        let token = self.tokens.token().await?;
        let envelope = soap::build_execute_envelope(statement, &self.catalog);

        let response = self
            .http
            .post(self.url.clone())
            .bearer_auth(token)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", XMLA_EXECUTE_ACTION)
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.tokens.invalidate();
        }
        interpret_response(status, &body)
    }

    async fn list_entities(&mut self) -> Result<Vec<EntityDescriptor>, ServerError> {
        let tables = self.execute(DMV_TABLES).await?;
        let columns = self.execute(DMV_COLUMNS).await?;
        let measures = self.execute(DMV_MEASURES).await?;

        let mut entities = catalog::assemble_entities(&tables, &columns, &measures);
        self.enrich(&mut entities, Some(&tables)).await?;
        Ok(entities)
    }

    async fn describe_entity(
        &mut self,
        name: &str,
    ) -> Result<Option<EntityDescriptor>, ServerError> {
        let tables = self.execute(&catalog::table_by_name(name)).await?;
        // The server compares names case-insensitively; the catalog does not.
        let Some(table) = catalog::visible_tables(&tables)
            .into_iter()
            .find(|t| t.name == name)
        else {
            return Ok(None);
        };

        let columns = self.execute(&catalog::columns_of(table.id)).await?;
        let measures = self.execute(&catalog::measures_of(table.id)).await?;
        let mut entity = catalog::assemble_entity(&table, &columns, &measures);

        self.enrich(std::slice::from_mut(&mut entity), None).await?;
        Ok(Some(entity))
    }

    async fn close(&mut self) {
        self.tokens.invalidate();
        debug!("Closed XMLA connection to {}", self.url);
    }
}

/// Map an HTTP response to a rowset or an error.
///
/// SOAP faults are query errors whatever the status code; any other
/// failure status means the transport is unusable.
fn interpret_response(status: StatusCode, body: &str) -> Result<Rowset, ServerError> {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        warn!("XMLA endpoint rejected the bearer token (HTTP {})", status.as_u16());
        return Err(ServerError::auth(format!(
            "XMLA endpoint returned HTTP {}",
            status.as_u16()
        )));
    }

    if status.is_success() {
        return soap::parse_execute_response(body);
    }

    if soap::is_soap_envelope(body) {
        if let Err(e @ ServerError::QuerySyntax { .. }) = soap::parse_execute_response(body) {
            return Err(e);
        }
    }

    Err(ServerError::connection(format!(
        "XMLA endpoint returned HTTP {}",
        status.as_u16()
    )))
}
