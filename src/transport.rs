//! Transport layer abstraction for MCP server.
//!
//! Supports multiple transport mechanisms:
//! - stdio: Standard input/output (default, for desktop MCP clients)
//! - http: rmcp streamable HTTP at `/mcp` with a `/health` probe
//!
//! The HTTP transport is optional and requires the `http` feature flag.

use crate::constants::{DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub transport_type: TransportType,

    /// HTTP server configuration (only used for HTTP transport).
    pub http: HttpConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Stdio,
            http: HttpConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Read `MCP_TRANSPORT`, `HOST` and `PORT`.
    pub fn from_env() -> Result<Self, ParseTransportTypeError> {
        let transport_type = match std::env::var("MCP_TRANSPORT") {
            Ok(value) if !value.trim().is_empty() => value.trim().parse()?,
            _ => TransportType::Stdio,
        };
        Ok(Self {
            transport_type,
            http: HttpConfig::from_env(),
        })
    }
}

/// Available transport types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Standard input/output transport (default).
    Stdio,

    /// Streamable HTTP transport.
    #[cfg(feature = "http")]
    Http,
}

/// Error returned when parsing a transport type fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTransportTypeError(String);

impl std::fmt::Display for ParseTransportTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transport type: '{}'", self.0)
    }
}

impl std::error::Error for ParseTransportTypeError {}

impl std::str::FromStr for TransportType {
    type Err = ParseTransportTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportType::Stdio),
            #[cfg(feature = "http")]
            "http" | "streamable-http" => Ok(TransportType::Http),
            _ => Err(ParseTransportTypeError(s.to_string())),
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Stdio => write!(f, "stdio"),
            #[cfg(feature = "http")]
            TransportType::Http => write!(f, "http"),
        }
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,

    pub port: u16,

    /// Trace every HTTP request via tower-http.
    pub enable_tracing: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
            enable_tracing: true,
        }
    }
}

impl HttpConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            if !host.trim().is_empty() {
                config.host = host.trim().to_string();
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.trim().parse() {
                config.port = p;
            }
        }

        config
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Streamable HTTP server (only available with `http` feature).
#[cfg(feature = "http")]
pub mod http_server {
    use super::*;
    use crate::server::PowerBiMcpServer;
    use crate::shutdown::SharedShutdownController;
    use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpService,
    };
    use std::sync::Arc;
    use tower_http::trace::TraceLayer;
    use tracing::info;

    /// Serve MCP over HTTP until the shutdown controller fires.
    ///
    /// Endpoints:
    /// - `/mcp` - rmcp streamable HTTP service
    /// - `/health` - JSON health probe
    pub async fn start_http_server_with_shutdown(
        mcp_server: PowerBiMcpServer,
        config: HttpConfig,
        shutdown_controller: Option<SharedShutdownController>,
    ) -> Result<(), anyhow::Error> {
        let factory_server = mcp_server.clone();
        let mcp_service = StreamableHttpService::new(
            move || Ok(factory_server.clone()),
            Arc::new(LocalSessionManager::default()),
            Default::default(),
        );

        let mut app = Router::new()
            .route("/health", get(health_handler))
            .with_state(mcp_server)
            .nest_service("/mcp", mcp_service);

        if config.enable_tracing {
            app = app.layer(TraceLayer::new_for_http());
        }

        let addr = config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("HTTP server listening on http://{}", addr);
        info!("MCP endpoint: http://{}/mcp", addr);
        info!("Health endpoint: http://{}/health", addr);

        if let Some(controller) = shutdown_controller {
            let mut shutdown_signal = controller.signal();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal.recv().await;
                    info!("HTTP server received shutdown signal");
                })
                .await?;
        } else {
            axum::serve(listener, app).await?;
        }

        Ok(())
    }

    async fn health_handler(State(server): State<PowerBiMcpServer>) -> impl IntoResponse {
        let status = server.session().status();
        let metrics = server.metrics().snapshot();
        let cache = server.session().cache().stats();
        Json(serde_json::json!({
            "status": "healthy",
            "server": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "transport": "http",
            "session": {
                "state": status.state.to_string(),
                "catalog": status.catalog,
                "connectedSecs": status.connected_secs,
            },
            "schemaCache": {
                "entries": cache.entry_count,
                "hitRate": cache.hit_rate(),
                "discovery": cache.discovery,
            },
            "inFlight": server.in_flight(),
            "metrics": metrics,
            "naturalLanguage": server.dispatcher().nl_enabled(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_transport_type_parse() {
        assert_eq!("stdio".parse::<TransportType>().unwrap(), TransportType::Stdio);
        assert_eq!("STDIO".parse::<TransportType>().unwrap(), TransportType::Stdio);
        assert!("carrier-pigeon".parse::<TransportType>().is_err());
        assert_eq!(TransportType::Stdio.to_string(), "stdio");
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_transport_parse() {
        assert_eq!("http".parse::<TransportType>().unwrap(), TransportType::Http);
    }

    #[test]
    #[serial]
    fn test_http_config_from_env() {
        std::env::set_var("HOST", "127.0.0.1");
        std::env::set_var("PORT", "9100");
        let config = HttpConfig::from_env();
        assert_eq!(config.bind_address(), "127.0.0.1:9100");

        std::env::set_var("PORT", "not-a-port");
        assert_eq!(HttpConfig::from_env().port, DEFAULT_HTTP_PORT);

        std::env::remove_var("HOST");
        std::env::remove_var("PORT");
        assert_eq!(HttpConfig::from_env().host, DEFAULT_HTTP_HOST);
    }

    #[test]
    #[serial]
    fn test_transport_config_default_is_stdio() {
        std::env::remove_var("MCP_TRANSPORT");
        let config = TransportConfig::from_env().unwrap();
        assert_eq!(config.transport_type, TransportType::Stdio);

        std::env::set_var("MCP_TRANSPORT", "carrier-pigeon");
        assert!(TransportConfig::from_env().is_err());
        std::env::remove_var("MCP_TRANSPORT");
    }
}
