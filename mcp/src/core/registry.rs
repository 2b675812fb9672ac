//! Connection registry: one cached channel per target identity.
//!
//! Each cached channel owns a monitor task that evicts it once it has been
//! idle past its bound, or as soon as its transport faults. Removal from the
//! map always happens under the lock and before the close, so a channel is
//! closed at most once.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    client::{Connector, RmcpConnector, ToolClient},
    config::{RegistryConfig, TargetServer},
    metrics::BatchMetrics,
    transport::TransportBuilder,
};
use crate::error::{McpError, McpResult};

/// Cache key for a target identity.
///
/// A blake3 digest of the canonical JSON of `{name, serverType, transport}`;
/// transport secrets only ever reach the digest. The name is kept for logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    name: String,
    digest: blake3::Hash,
}

impl PoolKey {
    pub fn from_target(target: &TargetServer) -> McpResult<Self> {
        let identity = serde_json::json!({
            "name": target.name,
            "serverType": target.server_type,
            "transport": target.transport,
        });
        let canonical = serde_json::to_vec(&canonicalize(identity)).map_err(|e| {
            McpError::ConfigurationInvalid(format!("cannot serialize target identity: {}", e))
        })?;

        Ok(Self {
            name: target.name.clone(),
            digest: blake3::hash(&canonical),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest_hex(&self) -> String {
        self.digest.to_hex().to_string()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, &self.digest.to_hex()[..12])
    }
}

/// Recursively sort object keys so equal identities serialize identically.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Why a cached channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Batch finished without `keepAlive`, or `close(key)` was called.
    Explicit,
    Idle,
    /// The transport reported a fault.
    Fault,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Explicit => "explicit",
            CloseReason::Idle => "idle",
            CloseReason::Fault => "fault",
            CloseReason::Shutdown => "shutdown",
        })
    }
}

/// A live channel handed out by [`ConnectionRegistry::get_or_create`].
///
/// Cheap to clone. Every acquisition must be paired with
/// [`ConnectionRegistry::release`] or [`ConnectionRegistry::close`].
#[derive(Clone)]
pub struct Channel {
    key: PoolKey,
    generation: u64,
    client: Arc<dyn ToolClient>,
}

impl Channel {
    #[inline]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    #[inline]
    pub fn client(&self) -> &Arc<dyn ToolClient> {
        &self.client
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

struct CachedChannel {
    client: Arc<dyn ToolClient>,
    endpoint: String,
    process_id: Option<u32>,
    generation: u64,
    last_used: Instant,
    /// Outstanding acquisitions; idle reclamation skips leased channels.
    leases: usize,
    monitor: CancellationToken,
}

impl CachedChannel {
    fn channel(&self, key: &PoolKey) -> Channel {
        Channel {
            key: key.clone(),
            generation: self.generation,
            client: Arc::clone(&self.client),
        }
    }
}

/// Cached channel overview returned by [`ConnectionRegistry::list_entries`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryInfo {
    pub name: String,
    pub key: String,
    pub endpoint: String,
    pub process_id: Option<u32>,
    pub leases: usize,
    pub idle_ms: u64,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_channels: usize,
    pub leased_channels: usize,
}

struct RegistryInner {
    channels: Mutex<HashMap<PoolKey, CachedChannel>>,
    builder: TransportBuilder,
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    metrics: Arc<BatchMetrics>,
    next_generation: AtomicU64,
}

/// Thread-safe cache of live channels, keyed by [`PoolKey`].
///
/// Clones share the same cache.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Registry that connects through `rmcp`.
    pub fn new(config: RegistryConfig, metrics: Arc<BatchMetrics>) -> Self {
        let connector = Arc::new(RmcpConnector::new(&config));
        Self::with_connector(config, connector, metrics)
    }

    pub fn with_connector(
        config: RegistryConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<BatchMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channels: Mutex::new(HashMap::new()),
                builder: TransportBuilder::new(&config),
                connector,
                config,
                metrics,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Return the cached channel for `target`, connecting if absent.
    ///
    /// The transport is validated before anything is spawned or dialled.
    pub async fn get_or_create(&self, target: &TargetServer) -> McpResult<Channel> {
        let key = PoolKey::from_target(target)?;
        if let Some(channel) = self.acquire_cached(&key) {
            debug!("Reusing cached channel for '{}'", key);
            self.inner.metrics.record_channel_reused();
            return Ok(channel);
        }

        let handle = self.inner.builder.build(&target.transport)?;
        let endpoint = handle.endpoint();
        let connection = match self.inner.connector.connect(&target.name, handle).await {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.metrics.record_connection_error();
                return Err(e);
            }
        };

        let idle_timeout = target.idle_timeout(&self.inner.config);
        let monitor = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let raced = {
            let mut channels = self.inner.channels.lock();
            if let Some(existing) = channels.get_mut(&key) {
                existing.last_used = Instant::now();
                existing.leases += 1;
                Some(existing.channel(&key))
            } else {
                channels.insert(
                    key.clone(),
                    CachedChannel {
                        client: Arc::clone(&connection.client),
                        endpoint: endpoint.clone(),
                        process_id: connection.process_id,
                        generation,
                        last_used: Instant::now(),
                        leases: 1,
                        monitor: monitor.clone(),
                    },
                );
                None
            }
        };

        if let Some(existing) = raced {
            debug!(
                "Lost creation race for '{}', closing duplicate channel",
                key
            );
            if let Err(e) = connection.client.close().await {
                warn!("Failed to close duplicate channel for '{}': {}", key, e);
            }
            self.inner.metrics.record_channel_reused();
            return Ok(existing);
        }

        info!(
            "Opened channel '{}' to {} (pid {:?}, idle bound {:?})",
            key, endpoint, connection.process_id, idle_timeout
        );
        self.inner.metrics.record_channel_opened();
        self.spawn_monitor(
            key.clone(),
            generation,
            Arc::clone(&connection.client),
            idle_timeout,
            monitor,
        );

        Ok(Channel {
            key,
            generation,
            client: connection.client,
        })
    }

    fn acquire_cached(&self, key: &PoolKey) -> Option<Channel> {
        let mut channels = self.inner.channels.lock();
        let cached = channels.get_mut(key)?;
        cached.last_used = Instant::now();
        cached.leases += 1;
        Some(cached.channel(key))
    }

    /// Return a lease taken by `get_or_create`, keeping the channel cached.
    pub fn release(&self, channel: &Channel) {
        let mut channels = self.inner.channels.lock();
        if let Some(cached) = channels.get_mut(&channel.key) {
            if cached.generation == channel.generation {
                cached.leases = cached.leases.saturating_sub(1);
                cached.last_used = Instant::now();
            }
        }
    }

    /// Close and evict the channel for `key`.
    ///
    /// Shutdown errors are logged, never returned. Returns whether an entry
    /// was present.
    pub async fn close(&self, key: &PoolKey) -> bool {
        self.inner
            .close_with(key, None, CloseReason::Explicit)
            .await
    }

    /// Close `channel` if it is still the cached generation for its key.
    ///
    /// A channel that was already evicted and replaced leaves the
    /// replacement untouched. Returns whether anything was closed.
    pub async fn close_channel(&self, channel: &Channel) -> bool {
        let generation = Some(channel.generation);
        self.inner
            .close_with(&channel.key, generation, CloseReason::Explicit)
            .await
    }

    /// Close every cached channel.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.inner.channels.lock().drain().collect();
        if drained.is_empty() {
            return;
        }

        info!("Closing {} cached channel(s)", drained.len());
        let closing = drained
            .into_iter()
            .map(|(key, cached)| self.inner.shutdown(key, cached, CloseReason::Shutdown));
        join_all(closing).await;
    }

    fn spawn_monitor(
        &self,
        key: PoolKey,
        generation: u64,
        client: Arc<dyn ToolClient>,
        idle_timeout: Duration,
        cancelled: CancellationToken,
    ) {
        let registry = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval_for(idle_timeout);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let closed = client.closed();
            tokio::pin!(closed);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = &mut closed => {
                        if let Some(inner) = registry.upgrade() {
                            warn!("Transport fault on channel '{}'", key);
                            inner.close_with(&key, Some(generation), CloseReason::Fault).await;
                        }
                        return;
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = registry.upgrade() else {
                            return;
                        };
                        if let Some(cached) = inner.take_if_idle(&key, generation, idle_timeout) {
                            inner.shutdown(key.clone(), cached, CloseReason::Idle).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.lock().is_empty()
    }

    pub fn contains(&self, key: &PoolKey) -> bool {
        self.inner.channels.lock().contains_key(key)
    }

    pub fn list_keys(&self) -> Vec<PoolKey> {
        self.inner.channels.lock().keys().cloned().collect()
    }

    pub fn list_entries(&self) -> Vec<EntryInfo> {
        self.inner
            .channels
            .lock()
            .iter()
            .map(|(key, cached)| EntryInfo {
                name: key.name().to_string(),
                key: key.digest_hex(),
                endpoint: cached.endpoint.clone(),
                process_id: cached.process_id,
                leases: cached.leases,
                idle_ms: cached.last_used.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// When the channel for `key` was last acquired or released.
    pub fn last_used(&self, key: &PoolKey) -> Option<Instant> {
        self.inner
            .channels
            .lock()
            .get(key)
            .map(|cached| cached.last_used)
    }

    pub fn stats(&self) -> PoolStats {
        let channels = self.inner.channels.lock();
        PoolStats {
            total_channels: channels.len(),
            leased_channels: channels.values().filter(|c| c.leases > 0).count(),
        }
    }
}

impl RegistryInner {
    /// Remove the entry for `key` (optionally only a specific generation)
    /// and close it.
    async fn close_with(
        &self,
        key: &PoolKey,
        generation: Option<u64>,
        reason: CloseReason,
    ) -> bool {
        let removed = {
            let mut channels = self.channels.lock();
            match channels.get(key) {
                Some(cached) if generation.map_or(true, |g| g == cached.generation) => {
                    channels.remove(key)
                }
                _ => None,
            }
        };

        match removed {
            Some(cached) => {
                self.shutdown(key.clone(), cached, reason).await;
                true
            }
            None => false,
        }
    }

    fn take_if_idle(
        &self,
        key: &PoolKey,
        generation: u64,
        idle_timeout: Duration,
    ) -> Option<CachedChannel> {
        let mut channels = self.channels.lock();
        let cached = channels.get(key)?;
        if cached.generation != generation
            || cached.leases > 0
            || cached.last_used.elapsed() <= idle_timeout
        {
            return None;
        }
        channels.remove(key)
    }

    async fn shutdown(&self, key: PoolKey, cached: CachedChannel, reason: CloseReason) {
        cached.monitor.cancel();
        if let Err(e) = cached.client.close().await {
            warn!("Error while closing channel '{}' ({}): {}", key, reason, e);
        }
        self.metrics.record_channel_closed(reason);
        info!("Closed channel '{}' ({})", key, reason);
    }
}
