//! MCP server struct definition and initialization.

use crate::bridge::{NlBridge, OpenAiChatModel};
use crate::config::Config;
use crate::error::ServerError;
use crate::executor::QueryExecutor;
use crate::schema::SchemaCache;
use crate::session::SessionManager;
use crate::telemetry::{new_shared_metrics, SharedMetrics};
use crate::tools::Dispatcher;
use crate::xmla::{HttpConnector, XmlaConnector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// The Power BI MCP Server instance.
///
/// Cloned per transport session; the dispatcher, and through it the single
/// XMLA session, is shared via `Arc`.
#[derive(Clone)]
pub struct PowerBiMcpServer {
    pub(crate) dispatcher: Arc<Dispatcher>,

    pub(crate) config: Arc<Config>,

    pub(crate) metrics: SharedMetrics,

    /// Tool calls currently being served.
    pub(crate) in_flight: Arc<AtomicUsize>,
}

impl PowerBiMcpServer {
    /// Create a server talking XMLA over HTTPS.
    ///
    /// No remote call is made here; the session starts with `connect`.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let connector = Arc::new(HttpConnector::new(&config.xmla)?);
        Self::with_connector(config, connector)
    }

    /// Create a server on top of an arbitrary connector.
    pub fn with_connector(config: Config, connector: Arc<dyn XmlaConnector>) -> Result<Self, ServerError> {
        let bridge = match &config.llm {
            Some(llm) => {
                info!("Natural-language operations enabled (model {})", llm.model);
                let model = OpenAiChatModel::new(llm.clone())?;
                Some(NlBridge::new(Arc::new(model)))
            }
            None => {
                info!("OPENAI_API_KEY not set; natural-language operations disabled");
                None
            }
        };
        Ok(Self::with_parts(config, connector, bridge))
    }

    /// Assemble a server from its collaborators.
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn XmlaConnector>,
        bridge: Option<NlBridge>,
    ) -> Self {
        let cache = Arc::new(SchemaCache::new(
            config.schema.entry_ttl,
            config.schema.discovery_wait,
        ));
        let session = Arc::new(SessionManager::new(
            connector,
            config.credentials.clone(),
            cache,
        ));
        let executor = QueryExecutor::new(session.clone(), config.query.max_result_rows);
        let metrics = new_shared_metrics();
        let dispatcher = Arc::new(Dispatcher::new(session, executor, bridge, metrics.clone()));

        Self {
            dispatcher,
            config: Arc::new(config),
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a server from environment variables.
    pub fn from_env() -> Result<Self, ServerError> {
        let config = Config::from_env()?;
        Self::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn session(&self) -> &SessionManager {
        self.dispatcher.session()
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Number of tool calls currently being served.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a tool call for the duration of the returned guard.
    pub(crate) fn track_request(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: self.in_flight.clone(),
        }
    }

    /// Disconnect the session. Used during shutdown.
    pub async fn close(&self) {
        self.dispatcher.session().disconnect().await;
    }
}

/// Decrements the in-flight counter on drop.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
