//! Schema cache populated by background discovery.
//!
//! Entries are keyed by entity name (case-sensitive) and tagged with the
//! session generation that produced them. Anything written by a session that
//! is no longer current is discarded, so a slow discovery task can never
//! repopulate the cache of a newer session.
//!
//! Callers that need the full listing wait on a `watch` channel for the
//! in-flight discovery rather than polling the map.

use crate::error::ServerError;
use crate::xmla::{EntityDescriptor, XmlaConnection};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Progress of discovery for the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStatus {
    /// No session.
    Idle,
    /// Background discovery is running.
    Pending,
    /// The full listing is cached.
    Ready,
    /// Background discovery failed; lookups fall back to the remote server.
    Failed(String),
}

impl std::fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A cached descriptor and when it was stored.
#[derive(Debug, Clone)]
struct SchemaCacheEntry {
    descriptor: EntityDescriptor,
    cached_at: Instant,
}

impl SchemaCacheEntry {
    fn new(descriptor: EntityDescriptor) -> Self {
        Self {
            descriptor,
            cached_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Option<Duration>) -> bool {
        ttl.is_none_or(|ttl| self.cached_at.elapsed() <= ttl)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    /// Generation of the session the entries belong to.
    generation: u64,
    /// Whether that session is still live.
    active: bool,
    entries: HashMap<String, SchemaCacheEntry>,
    /// Entity names in server order, set by a full discovery.
    listing: Option<Vec<String>>,
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    pub discovery: String,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Entity descriptors of the connected catalog.
pub struct SchemaCache {
    state: RwLock<CacheState>,

    /// Discovery status, tagged with the generation it refers to.
    status: watch::Sender<(u64, DiscoveryStatus)>,

    /// How long an entry stays fresh; `None` keeps it for the session lifetime.
    ttl: Option<Duration>,

    /// Bounded wait for an in-flight discovery.
    discovery_wait: Duration,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl SchemaCache {
    pub fn new(ttl: Option<Duration>, discovery_wait: Duration) -> Self {
        let (status, _) = watch::channel((0, DiscoveryStatus::Idle));
        Self {
            state: RwLock::new(CacheState::default()),
            status,
            ttl,
            discovery_wait,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Start caching for a new session; discovery is expected to follow.
    pub fn begin(&self, generation: u64) {
        {
            let mut state = self.state.write();
            state.generation = generation;
            state.active = true;
            state.entries.clear();
            state.listing = None;
        }
        self.status.send_replace((generation, DiscoveryStatus::Pending));
    }

    /// Clear every entry. Later writes from the invalidated session are ignored.
    pub fn invalidate(&self) {
        let generation = {
            let mut state = self.state.write();
            state.active = false;
            state.entries.clear();
            state.listing = None;
            state.generation
        };
        self.status.send_replace((generation, DiscoveryStatus::Idle));
        debug!("Schema cache invalidated");
    }

    /// Current discovery status.
    pub fn status(&self) -> DiscoveryStatus {
        self.status.borrow().1.clone()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.state.read().entries.len(),
            discovery: self.status().to_string(),
        }
    }

    /// Enumerate every entity and replace the cache contents.
    ///
    /// Returns the entities in server order. The result is cached only if
    /// `generation` is still the live session.
    pub async fn discover_all(
        &self,
        connection: &mut dyn XmlaConnection,
        generation: u64,
    ) -> Result<Vec<EntityDescriptor>, ServerError> {
        let entities = connection.list_entities().await?;

        let stored = {
            let mut state = self.state.write();
            if state.active && state.generation == generation {
                state.entries = entities
                    .iter()
                    .map(|e| (e.name.clone(), SchemaCacheEntry::new(e.clone())))
                    .collect();
                state.listing = Some(entities.iter().map(|e| e.name.clone()).collect());
                true
            } else {
                false
            }
        };

        if stored {
            self.status
                .send_replace((generation, DiscoveryStatus::Ready));
            info!("Discovered {} entities", entities.len());
        } else {
            debug!("Discarding discovery result of stale session {}", generation);
        }
        Ok(entities)
    }

    /// Record that background discovery failed for `generation`.
    pub fn mark_failed(&self, generation: u64, reason: impl Into<String>) {
        let current = {
            let state = self.state.read();
            state.active && state.generation == generation
        };
        if current {
            self.status
                .send_replace((generation, DiscoveryStatus::Failed(reason.into())));
        }
    }

    /// Wait, up to the configured bound, for discovery of `generation` to
    /// leave the pending state. Returns `true` when the listing is ready.
    pub async fn wait_for_discovery(&self, generation: u64) -> bool {
        let mut rx = self.status.subscribe();
        let settled = tokio::time::timeout(
            self.discovery_wait,
            rx.wait_for(|(g, s)| *g != generation || *s != DiscoveryStatus::Pending),
        )
        .await;

        match settled {
            Ok(Ok(status)) => status.0 == generation && status.1 == DiscoveryStatus::Ready,
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(
                    "Discovery still pending after {:?}; falling back to a synchronous pass",
                    self.discovery_wait
                );
                false
            }
        }
    }

    /// The full listing, if it is cached and every entry is fresh.
    pub fn listing(&self, generation: u64) -> Option<Vec<EntityDescriptor>> {
        let state = self.state.read();
        if !state.active || state.generation != generation {
            return None;
        }
        let names = state.listing.as_ref()?;
        names
            .iter()
            .map(|name| {
                state
                    .entries
                    .get(name)
                    .filter(|entry| entry.is_fresh(self.ttl))
                    .map(|entry| entry.descriptor.clone())
            })
            .collect()
    }

    /// A fresh cached descriptor. Counts a hit or a miss.
    pub fn get(&self, generation: u64, name: &str) -> Option<EntityDescriptor> {
        let found = self.lookup(generation, name);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn lookup(&self, generation: u64, name: &str) -> Option<EntityDescriptor> {
        let state = self.state.read();
        if state.active && state.generation == generation {
            state
                .entries
                .get(name)
                .filter(|entry| entry.is_fresh(self.ttl))
                .map(|entry| entry.descriptor.clone())
        } else {
            None
        }
    }

    /// Describe an entity: a fresh entry is returned without a round trip,
    /// otherwise exactly one single-entity discovery is performed and cached.
    pub async fn describe(
        &self,
        connection: &mut dyn XmlaConnection,
        generation: u64,
        name: &str,
    ) -> Result<EntityDescriptor, ServerError> {
        if let Some(hit) = self.get(generation, name) {
            return Ok(hit);
        }
        self.fetch(connection, generation, name).await
    }

    /// Resolve a name already counted as a miss.
    ///
    /// Another caller may have filled the entry while this one waited for the
    /// transport, in which case no round trip is made.
    pub async fn fetch(
        &self,
        connection: &mut dyn XmlaConnection,
        generation: u64,
        name: &str,
    ) -> Result<EntityDescriptor, ServerError> {
        if let Some(filled) = self.lookup(generation, name) {
            return Ok(filled);
        }

        debug!("Schema cache miss for '{}'", name);
        let descriptor = connection
            .describe_entity(name)
            .await?
            .ok_or_else(|| ServerError::entity_not_found(name))?;

        self.insert(generation, descriptor.clone());
        Ok(descriptor)
    }

    fn insert(&self, generation: u64, descriptor: EntityDescriptor) {
        let mut state = self.state.write();
        if state.active && state.generation == generation {
            state
                .entries
                .insert(descriptor.name.clone(), SchemaCacheEntry::new(descriptor));
        }
    }
}
