//! Single-session connection management.
//!
//! The [`SessionManager`] owns at most one live connection. The transport
//! handle lives in a `tokio::sync::Mutex` slot that is held for the whole of
//! each remote round trip, so connects, queries and discovery never
//! interleave on the wire. The observable [`ConnectionState`] sits in a
//! separate non-blocking lock so `is_connected` never waits on a slow query.
//!
//! Every successful connect starts a new *generation*. Background discovery,
//! cache writes and failure transitions all carry the generation they belong
//! to and become no-ops once it is no longer current.

use crate::config::CredentialDefaults;
use crate::error::ServerError;
use crate::schema::SchemaCache;
use crate::xmla::{ConnectParams, EntityDescriptor, Rowset, XmlaConnection, XmlaConnector, XmlaEndpoint};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connect or an in-session round trip failed fatally.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Parameters of a connect call, before defaults are applied.
#[derive(Clone, Default)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub catalog: Option<String>,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("endpoint", &self.endpoint)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// The live session: its parameters and the transport handle.
struct SessionContext {
    params: ConnectParams,
    connection: Box<dyn XmlaConnection>,
}

/// What the live session is connected to, readable without the transport lock.
#[derive(Debug, Clone)]
struct SessionLabel {
    endpoint: String,
    catalog: String,
    connected_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct StateCell {
    state: ConnectionState,
    generation: u64,
}

/// Point-in-time view of the session for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    pub catalog: Option<String>,
    pub connected_secs: Option<u64>,
}

/// Exclusive access to the live connection of one generation.
struct SessionGuard<'a> {
    slot: MutexGuard<'a, Option<SessionContext>>,
    generation: u64,
}

impl SessionGuard<'_> {
    fn connection(&mut self) -> Result<&mut dyn XmlaConnection, ServerError> {
        match self.slot.as_mut() {
            Some(ctx) => Ok(ctx.connection.as_mut()),
            None => Err(ServerError::NotConnected),
        }
    }
}

/// Sets the state to `Failed` if a connect is abandoned mid-handshake.
struct ConnectingGuard<'a> {
    cell: &'a RwLock<StateCell>,
    generation: u64,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut cell = self.cell.write();
            if cell.generation == self.generation && cell.state == ConnectionState::Connecting {
                cell.state = ConnectionState::Failed;
            }
        }
    }
}

/// Owns the one session to the remote server.
pub struct SessionManager {
    /// Opens connections.
    connector: Arc<dyn XmlaConnector>,

    /// Credentials used when a connect request omits them.
    defaults: CredentialDefaults,

    /// Schema cache of the live session.
    cache: Arc<SchemaCache>,

    /// The transport handle; held for the duration of each round trip.
    slot: Mutex<Option<SessionContext>>,

    /// Observable state; never held across an await.
    cell: RwLock<StateCell>,

    /// Set while `Connected`.
    label: RwLock<Option<SessionLabel>>,

    /// Background discovery of the current generation.
    discovery: SyncMutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn XmlaConnector>,
        defaults: CredentialDefaults,
        cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            connector,
            defaults,
            cache,
            slot: Mutex::new(None),
            cell: RwLock::new(StateCell {
                state: ConnectionState::Disconnected,
                generation: 0,
            }),
            label: RwLock::new(None),
            discovery: SyncMutex::new(None),
        }
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub fn state(&self) -> ConnectionState {
        self.cell.read().state
    }

    /// Non-blocking state read.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Diagnostic snapshot. Does not wait for an in-flight round trip.
    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        let label = self
            .label
            .read()
            .clone()
            .filter(|_| state == ConnectionState::Connected);
        match label {
            Some(label) => SessionStatus {
                state,
                endpoint: Some(label.endpoint),
                catalog: Some(label.catalog),
                connected_secs: Some(label.connected_at.elapsed().as_secs()),
            },
            None => SessionStatus {
                state,
                endpoint: None,
                catalog: None,
                connected_secs: None,
            },
        }
    }

    /// Apply defaults and validate connect parameters. No I/O.
    pub fn resolve(&self, request: ConnectRequest) -> Result<ConnectParams, ServerError> {
        let endpoint = XmlaEndpoint::parse(&request.endpoint)?;

        let pick = |given: Option<String>, fallback: &Option<String>, field: &str| {
            given
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| fallback.clone())
                .ok_or_else(|| {
                    ServerError::validation(format!(
                        "{} is required (no process-wide default is configured)",
                        field
                    ))
                })
        };

        let tenant_id = pick(request.tenant_id, &self.defaults.tenant_id, "tenantId")?;
        let client_id = pick(request.client_id, &self.defaults.client_id, "clientId")?;
        let client_secret = pick(request.client_secret, &self.defaults.client_secret, "clientSecret")?;

        let catalog = request
            .catalog
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .or_else(|| endpoint.catalog_hint().map(str::to_string))
            .ok_or_else(|| ServerError::validation("catalog is required"))?;

        Ok(ConnectParams {
            endpoint,
            tenant_id,
            client_id,
            client_secret,
            catalog,
        })
    }

    /// Connect, replacing any existing session.
    ///
    /// On success discovery is started in the background and the call
    /// returns without waiting for it.
    pub async fn connect(self: &Arc<Self>, request: ConnectRequest) -> Result<ConnectionState, ServerError> {
        let params = self.resolve(request)?;

        self.abort_discovery();
        let mut slot = self.slot.lock().await;

        if let Some(mut previous) = slot.take() {
            info!(
                "Closing previous session to catalog '{}'",
                previous.params.catalog
            );
            previous.connection.close().await;
        }
        self.cache.invalidate();

        let generation = {
            let mut cell = self.cell.write();
            cell.generation += 1;
            cell.state = ConnectionState::Connecting;
            cell.generation
        };
        *self.label.write() = None;
        let mut connecting = ConnectingGuard {
            cell: &self.cell,
            generation,
            armed: true,
        };

        info!(
            "Connecting to {} (catalog '{}')",
            params.endpoint.url(),
            params.catalog
        );

        match self.connector.open(&params).await {
            Ok(connection) => {
                info!("Connected to catalog '{}'", params.catalog);
                *self.label.write() = Some(SessionLabel {
                    endpoint: params.endpoint.url().to_string(),
                    catalog: params.catalog.clone(),
                    connected_at: Instant::now(),
                });
                *slot = Some(SessionContext { params, connection });
                // Discovery is pending before any caller can observe Connected.
                self.cache.begin(generation);
                self.cell.write().state = ConnectionState::Connected;
                connecting.armed = false;

                self.spawn_discovery(generation);
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.cell.write().state = ConnectionState::Failed;
                connecting.armed = false;
                Err(e)
            }
        }
    }

    /// Release the session and clear the cache. Always succeeds.
    ///
    /// State and cache are reset before the transport lock is taken, so a
    /// hanging round trip cannot make this report stale state.
    pub async fn disconnect(&self) {
        self.abort_discovery();
        {
            let mut cell = self.cell.write();
            cell.generation += 1;
            cell.state = ConnectionState::Disconnected;
        }
        *self.label.write() = None;
        self.cache.invalidate();

        let mut slot = self.slot.lock().await;
        if let Some(mut ctx) = slot.take() {
            ctx.connection.close().await;
            info!("Disconnected from catalog '{}'", ctx.params.catalog);
        }
    }

    /// Run a statement on the live session.
    pub async fn execute_raw(&self, statement: &str) -> Result<Rowset, ServerError> {
        let generation = self.require_connected()?;
        let mut guard = self.acquire(generation).await?;
        let result = guard.connection()?.execute(statement).await;
        self.settle(guard, result).await
    }

    /// Every entity of the catalog, in server order.
    ///
    /// Waits (bounded) for background discovery; when it has not produced a
    /// listing, runs discovery synchronously instead of returning a partial one.
    pub async fn list_entities(&self) -> Result<Vec<EntityDescriptor>, ServerError> {
        let generation = self.require_connected()?;
        if self.cache.wait_for_discovery(generation).await {
            if let Some(entities) = self.cache.listing(generation) {
                return Ok(entities);
            }
        }

        let mut guard = self.acquire(generation).await?;
        // Discovery may have completed while we waited for the lock.
        if let Some(entities) = self.cache.listing(generation) {
            return Ok(entities);
        }
        debug!("Running synchronous discovery");
        let result = match guard.connection() {
            Ok(conn) => self.cache.discover_all(conn, generation).await,
            Err(e) => Err(e),
        };
        self.settle(guard, result).await
    }

    /// Describe one entity from the cache, or with one remote round trip.
    pub async fn describe_entity(&self, name: &str) -> Result<EntityDescriptor, ServerError> {
        let generation = self.require_connected()?;
        self.cache.wait_for_discovery(generation).await;

        // A hit never waits for the transport.
        if let Some(hit) = self.cache.get(generation, name) {
            return Ok(hit);
        }

        let mut guard = self.acquire(generation).await?;
        let result = match guard.connection() {
            Ok(conn) => self.cache.fetch(conn, generation, name).await,
            Err(e) => Err(e),
        };
        self.settle(guard, result).await
    }

    fn require_connected(&self) -> Result<u64, ServerError> {
        let cell = *self.cell.read();
        if cell.state == ConnectionState::Connected {
            Ok(cell.generation)
        } else {
            Err(ServerError::NotConnected)
        }
    }

    /// Lock the transport of `generation`; fails if that session is gone.
    async fn acquire(&self, generation: u64) -> Result<SessionGuard<'_>, ServerError> {
        let slot = self.slot.lock().await;
        let cell = *self.cell.read();
        if cell.state != ConnectionState::Connected || cell.generation != generation || slot.is_none() {
            return Err(ServerError::NotConnected);
        }
        Ok(SessionGuard { slot, generation })
    }

    /// Apply the outcome of a round trip to the session.
    ///
    /// A session-fatal error closes the transport, marks the session
    /// `Failed`, clears the cache and is reported as `ConnectionLost`.
    async fn settle<T>(
        &self,
        mut guard: SessionGuard<'_>,
        result: Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_session_fatal() => return Err(e),
            Err(e) => e,
        };

        let current = {
            let mut cell = self.cell.write();
            let current = cell.generation == guard.generation;
            if current {
                cell.state = ConnectionState::Failed;
            }
            current
        };

        if current {
            error!("Session lost: {}", err);
            *self.label.write() = None;
            self.cache.invalidate();
            if let Some(mut ctx) = guard.slot.take() {
                ctx.connection.close().await;
            }
        }

        Err(match err {
            lost @ ServerError::ConnectionLost { .. } => lost,
            other => ServerError::connection_lost(other.to_string()),
        })
    }

    fn spawn_discovery(self: &Arc<Self>, generation: u64) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run_discovery(generation).await;
        });
        if let Some(previous) = self.discovery.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run_discovery(&self, generation: u64) {
        debug!("Background discovery started for session {}", generation);
        let result = match self.acquire(generation).await {
            Ok(mut guard) => {
                let result = match guard.connection() {
                    Ok(conn) => self.cache.discover_all(conn, generation).await,
                    Err(e) => Err(e),
                };
                self.settle(guard, result).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Background discovery failed: {}", e);
            self.cache.mark_failed(generation, e.to_string());
        }
    }

    fn abort_discovery(&self) {
        if let Some(handle) = self.discovery.lock().take() {
            handle.abort();
        }
    }
}
