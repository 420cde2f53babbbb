// src/manager.rs
// Connection manager (distilled §4.4/§4.5) and the typed, cloneable host
// handle (§4.11/§6 "Host-facing API"). The manager is the single logical
// owner of all mutable per-server state; every mutation happens inside an
// `&self`/`&Arc<Self>` method so suspension points never span a partial
// mutation (distilled §5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::{self, Aggregation, ServerSnapshot};
use crate::cache::{MetadataCacheRecord, PersistedServerRecord};
use crate::config::RuntimeConfig;
use crate::descriptor::{ApprovalPolicy, ServerDescriptor, TransportKind};
use crate::dispatch::{self, DispatchHandlers, ElicitationHandler, SamplingHandler};
use crate::error::{McpError, McpResult};
use crate::governance::{GovernanceCategory, GovernanceEntry, GovernanceLevel, GovernanceLog};
use crate::notifications::McpNotification;
use crate::protocol::{ClientInfo, GetPromptResult, PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, RootDescriptor, ServerInfo, ToolDescriptor};
use crate::rpc::JsonRpcClient;
use crate::state::ConnectionState;
use crate::toolcall::{ManagedCall, ToolCallEngine, ToolCallOptions};
use crate::transport::oauth::{CredentialProvider, OAuthHeaderProvider};
use crate::transport::sse_split::SseSplitTransport;
use crate::transport::streamable_http::StreamableHttpTransport;
use crate::transport::{EventSink, HeaderProvider, Transport, TransportEvent};

/// Host-supplied persistence collaborator: resolves the current set of
/// configured descriptors so the config watcher can detect out-of-band
/// edits (distilled §4.4, "Configuration watcher").
#[async_trait]
pub trait DescriptorLoader: Send + Sync {
    async fn load(&self) -> McpResult<Vec<ServerDescriptor>>;
}

/// Per-server runtime status, the thing the host's UI observes (distilled
/// §6, "observe server statuses").
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub descriptor: ServerDescriptor,
    pub state: ConnectionState,
    pub server_info: Option<ServerInfo>,
    pub negotiated_protocol_version: Option<String>,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub roots: Vec<RootDescriptor>,
    pub metadata_cached_at: Option<DateTime<Utc>>,
    pub busy: u32,
    pub log_level: Option<String>,
}

impl ServerStatus {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            state: ConnectionState::Idle,
            server_info: None,
            negotiated_protocol_version: None,
            tools: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            prompts: Vec::new(),
            roots: Vec::new(),
            metadata_cached_at: None,
            busy: 0,
            log_level: None,
        }
    }

    fn from_persisted(record: PersistedServerRecord) -> Self {
        let mut status = Self::new(record.descriptor);
        if let Some(cache) = record.metadata_cache {
            status.server_info = Some(cache.server_info);
            status.tools = cache.tools.iter().map(ToolDescriptor::from).collect();
            status.resources = cache.resources;
            status.resource_templates = cache.resource_templates;
            status.prompts = cache.prompts;
            status.roots = cache.roots;
            status.metadata_cached_at = Some(cache.cached_at);
        }
        status
    }
}

/// Split an (optionally) OAuth-wrapped transport kind into its base kind
/// and the credential-provider id that should supply bearer headers.
fn resolve_transport_kind(kind: &TransportKind) -> (&TransportKind, Option<&str>) {
    match kind {
        TransportKind::OAuthWrapped { inner, credential_provider_id } => {
            (inner.as_ref(), Some(credential_provider_id.as_str()))
        }
        other => (other, None),
    }
}

fn signature_of(descriptors: &[ServerDescriptor]) -> String {
    let mut parts: Vec<String> = descriptors
        .iter()
        .map(|d| serde_json::to_string(d).unwrap_or_default())
        .collect();
    parts.sort();
    parts.concat()
}

pub struct ConnectionManager {
    config: RuntimeConfig,
    governance: Arc<GovernanceLog>,
    toolcalls: Arc<ToolCallEngine>,
    statuses: RwLock<HashMap<Uuid, ServerStatus>>,
    transports: RwLock<HashMap<Uuid, Arc<dyn Transport>>>,
    rpc_clients: RwLock<HashMap<Uuid, Arc<JsonRpcClient>>>,
    aggregation: RwLock<Aggregation>,
    connect_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    connect_epoch: RwLock<HashMap<Uuid, u64>>,
    dispatch_handlers: RwLock<DispatchHandlers>,
    credential_providers: RwLock<HashMap<String, Arc<dyn CredentialProvider>>>,
    descriptor_signature: RwLock<String>,
    internal_tx: mpsc::UnboundedSender<(Uuid, TransportEvent)>,
}

impl ConnectionManager {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let governance = Arc::new(GovernanceLog::new(config.governance_log_capacity));
        let toolcalls = Arc::new(ToolCallEngine::new(config.clone(), Arc::clone(&governance)));
        let manager = Arc::new(Self {
            config,
            governance,
            toolcalls,
            statuses: RwLock::new(HashMap::new()),
            transports: RwLock::new(HashMap::new()),
            rpc_clients: RwLock::new(HashMap::new()),
            aggregation: RwLock::new(Aggregation::default()),
            connect_locks: Mutex::new(HashMap::new()),
            connect_epoch: RwLock::new(HashMap::new()),
            dispatch_handlers: RwLock::new(DispatchHandlers::default()),
            credential_providers: RwLock::new(HashMap::new()),
            descriptor_signature: RwLock::new(String::new()),
            internal_tx: tx,
        });
        let dispatcher = Arc::clone(&manager);
        tokio::spawn(async move { dispatcher.run_event_loop(rx).await });
        manager
    }

    // -----------------------------------------------------------------
    // Event loop — the manager's single serialized execution context.
    // -----------------------------------------------------------------

    async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(Uuid, TransportEvent)>) {
        while let Some((server_id, event)) = rx.recv().await {
            self.handle_event(server_id, event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, server_id: Uuid, event: TransportEvent) {
        match event {
            TransportEvent::Notification { method, params } => {
                self.handle_notification(server_id, method, params).await;
            }
            TransportEvent::ServerRequest { id, method, params } => {
                let transport = self.transports.read().await.get(&server_id).cloned();
                if let Some(transport) = transport {
                    let handlers = self.dispatch_handlers.read().await.clone();
                    dispatch::dispatch_server_request(&transport, &handlers, server_id, id, &method, params).await;
                } else {
                    warn!("server request from unknown/disconnected server {server_id}");
                }
            }
            TransportEvent::Disconnected { reason } => {
                self.governance
                    .push(GovernanceLevel::Warn, GovernanceCategory::Lifecycle, Some(server_id), None, format!("transport disconnected: {reason}"), None)
                    .await;
                self.set_state(server_id, ConnectionState::Idle).await;
                self.rebuild_aggregation().await;
                if self.retry_on_failure(server_id).await && self.is_selected(server_id).await {
                    self.schedule_reconnect(server_id, 1);
                }
            }
        }
    }

    async fn handle_notification(self: &Arc<Self>, server_id: Uuid, method: String, params: Option<Value>) {
        let notification = McpNotification::from_wire(&method, params.clone());
        self.governance
            .push(GovernanceLevel::Debug, GovernanceCategory::Notification, Some(server_id), None, format!("notification: {method}"), params)
            .await;

        if let McpNotification::Progress(p) = &notification {
            self.toolcalls.record_progress(p).await;
            self.governance
                .push(GovernanceLevel::Debug, GovernanceCategory::Progress, Some(server_id), None, "progress", None)
                .await;
        }
        if let McpNotification::ServerLog { level, data, .. } = &notification {
            self.governance
                .push(GovernanceLevel::Info, GovernanceCategory::ServerLog, Some(server_id), None, level.clone(), Some(data.clone()))
                .await;
        }
        if notification.invalidates_cache() {
            self.invalidate_cache(server_id).await;
            if self.is_ready(server_id).await {
                if let Err(e) = self.refresh_metadata(server_id).await {
                    warn!("metadata refresh after list-changed notification failed: {e}");
                }
            } else {
                self.rebuild_aggregation().await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Status bookkeeping
    // -----------------------------------------------------------------

    async fn set_state(&self, server_id: Uuid, state: ConnectionState) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&server_id) {
            status.state = state;
        }
    }

    async fn state_of(&self, server_id: Uuid) -> Option<ConnectionState> {
        self.statuses.read().await.get(&server_id).map(|s| s.state.clone())
    }

    async fn is_ready(&self, server_id: Uuid) -> bool {
        matches!(self.state_of(server_id).await, Some(s) if s.is_ready())
    }

    async fn is_selected(&self, server_id: Uuid) -> bool {
        self.statuses
            .read()
            .await
            .get(&server_id)
            .map(|s| s.descriptor.selected_for_chat)
            .unwrap_or(false)
    }

    async fn retry_on_failure(&self, server_id: Uuid) -> bool {
        self.statuses
            .read()
            .await
            .get(&server_id)
            .map(|s| s.descriptor.retry_on_failure)
            .unwrap_or(false)
    }

    async fn descriptor_of(&self, server_id: Uuid) -> Option<ServerDescriptor> {
        self.statuses.read().await.get(&server_id).map(|s| s.descriptor.clone())
    }

    async fn invalidate_cache(&self, server_id: Uuid) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&server_id) {
            status.metadata_cached_at = None;
        }
        drop(statuses);
        self.governance
            .push(GovernanceLevel::Info, GovernanceCategory::Cache, Some(server_id), None, "cache invalidated", None)
            .await;
    }

    async fn is_cache_stale(&self, server_id: Uuid) -> bool {
        let statuses = self.statuses.read().await;
        match statuses.get(&server_id).and_then(|s| s.metadata_cached_at) {
            Some(cached_at) => {
                let ttl = chrono::Duration::from_std(self.config.metadata_ttl).unwrap_or(chrono::Duration::max_value());
                Utc::now() - cached_at >= ttl
            }
            None => true,
        }
    }

    async fn rebuild_aggregation(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.metadata_ttl).unwrap_or(chrono::Duration::max_value());
        let snapshots: Vec<ServerSnapshot> = {
            let statuses = self.statuses.read().await;
            statuses
                .values()
                .map(|s| ServerSnapshot {
                    descriptor: s.descriptor.clone(),
                    state: s.state.clone(),
                    metadata_fresh: s.metadata_cached_at.map(|t| now - t < ttl).unwrap_or(false),
                    tools: s.tools.clone(),
                    resources: s.resources.clone(),
                    resource_templates: s.resource_templates.clone(),
                    prompts: s.prompts.clone(),
                })
                .collect()
        };
        let ready_count = snapshots.iter().filter(|s| s.state.is_ready()).count();
        let aggregation = aggregator::build(&snapshots);
        *self.aggregation.write().await = aggregation;
        crate::metrics::set_ready_server_count(ready_count);
        self.governance
            .push(GovernanceLevel::Debug, GovernanceCategory::Routing, None, None, "aggregation rebuilt", None)
            .await;
    }

    // -----------------------------------------------------------------
    // Descriptor reload / config watcher
    // -----------------------------------------------------------------

    pub async fn reload_descriptors(self: &Arc<Self>, descriptors: Vec<ServerDescriptor>) {
        let incoming: HashSet<Uuid> = descriptors.iter().map(|d| d.id).collect();
        let removed: Vec<Uuid> = {
            let statuses = self.statuses.read().await;
            statuses.keys().filter(|id| !incoming.contains(id)).copied().collect()
        };
        for id in removed {
            self.disconnect(id).await;
            self.statuses.write().await.remove(&id);
            // Invalidate any attempt_connect already past its initialize()
            // suspension point for this id; it will discard its results
            // instead of resurrecting a transport/rpc client we just tore
            // down.
            self.next_connect_epoch(id).await;
        }
        {
            let mut statuses = self.statuses.write().await;
            for descriptor in descriptors {
                statuses
                    .entry(descriptor.id)
                    .and_modify(|s| s.descriptor = descriptor.clone())
                    .or_insert_with(|| ServerStatus::new(descriptor));
            }
        }
        self.rebuild_aggregation().await;
        self.governance
            .push(GovernanceLevel::Info, GovernanceCategory::Lifecycle, None, None, "descriptors reloaded", None)
            .await;
    }

    /// Seed statuses from persisted records at startup, so aggregation can
    /// proceed from cache before any reconnect completes (distilled §4.4,
    /// "Persisted state").
    pub async fn load_persisted(&self, records: Vec<PersistedServerRecord>) {
        let mut statuses = self.statuses.write().await;
        for record in records {
            statuses.insert(record.descriptor.id, ServerStatus::from_persisted(record));
        }
        drop(statuses);
        self.rebuild_aggregation().await;
    }

    pub fn spawn_config_watcher(self: &Arc<Self>, loader: Arc<dyn DescriptorLoader>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.config_watch_interval);
            loop {
                interval.tick().await;
                match loader.load().await {
                    Ok(descriptors) => {
                        let signature = signature_of(&descriptors);
                        let changed = {
                            let mut current = manager.descriptor_signature.write().await;
                            if *current != signature {
                                *current = signature;
                                true
                            } else {
                                false
                            }
                        };
                        if changed {
                            manager.reload_descriptors(descriptors).await;
                        }
                    }
                    Err(e) => warn!("descriptor reload failed: {e}"),
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Transport construction
    // -----------------------------------------------------------------

    async fn build_transport(&self, descriptor: &ServerDescriptor, sink: EventSink) -> McpResult<Arc<dyn Transport>> {
        let (base_kind, provider_id) = resolve_transport_kind(&descriptor.transport);
        let header_provider: Option<Arc<dyn HeaderProvider>> = match provider_id {
            Some(id) => {
                let providers = self.credential_providers.read().await;
                let provider = providers
                    .get(id)
                    .cloned()
                    .ok_or_else(|| McpError::transport(format!("unknown credential provider '{id}'")))?;
                Some(Arc::new(OAuthHeaderProvider::new(provider)) as Arc<dyn HeaderProvider>)
            }
            None => None,
        };

        match base_kind {
            TransportKind::StreamableHttp { endpoint } => {
                let url = reqwest::Url::parse(endpoint).map_err(|e| McpError::transport(e.to_string()))?;
                let transport = StreamableHttpTransport::new(
                    url,
                    crate::rpc::SUPPORTED_PROTOCOL_VERSIONS[0],
                    descriptor.headers.clone(),
                    header_provider,
                    sink,
                    descriptor.resumption_token.clone(),
                );
                transport.start_streaming().await;
                Ok(transport as Arc<dyn Transport>)
            }
            TransportKind::SseSplit { endpoint } => {
                let url = reqwest::Url::parse(endpoint).map_err(|e| McpError::transport(e.to_string()))?;
                let transport = Arc::new(SseSplitTransport::new(url, descriptor.headers.clone(), header_provider, sink));
                transport.start_streaming().await;
                Ok(transport as Arc<dyn Transport>)
            }
            TransportKind::OAuthWrapped { .. } => {
                Err(McpError::transport("nested OAuth-wrapped transports are not supported"))
            }
        }
    }

    // -----------------------------------------------------------------
    // Connect / disconnect / reconnect
    // -----------------------------------------------------------------

    async fn connect_lock(&self, server_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.connect_locks.lock().await;
        Arc::clone(locks.entry(server_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Bumps and returns this server's connect epoch. Called both when an
    /// `attempt_connect` starts (to claim the latest epoch for itself) and
    /// when `reload_descriptors` removes the server (to invalidate any
    /// attempt already in flight), so a connect that resumes after
    /// `rpc.initialize().await` can tell whether it is still the most
    /// recent attempt for this id before writing its results.
    async fn next_connect_epoch(&self, server_id: Uuid) -> u64 {
        let mut epochs = self.connect_epoch.write().await;
        let epoch = epochs.entry(server_id).or_insert(0);
        *epoch += 1;
        *epoch
    }

    async fn current_connect_epoch(&self, server_id: Uuid) -> u64 {
        *self.connect_epoch.read().await.get(&server_id).unwrap_or(&0)
    }

    pub async fn connect(self: &Arc<Self>, server_id: Uuid, retry_on_failure: bool) -> McpResult<()> {
        let lock = self.connect_lock(server_id).await;
        let _guard = lock.lock().await;

        {
            let statuses = self.statuses.read().await;
            match statuses.get(&server_id) {
                None => return Err(McpError::NotConnected { server_id }),
                Some(s) if s.state.is_ready() => return Ok(()),
                _ => {}
            }
        }

        match self.attempt_connect(server_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_without_retry(server_id, e.to_string()).await;
                if retry_on_failure && self.is_selected(server_id).await {
                    self.schedule_reconnect(server_id, 1);
                }
                Err(e)
            }
        }
    }

    async fn attempt_connect(self: &Arc<Self>, server_id: Uuid) -> McpResult<()> {
        let epoch = self.next_connect_epoch(server_id).await;
        self.set_state(server_id, ConnectionState::Connecting).await;
        self.governance
            .push(GovernanceLevel::Info, GovernanceCategory::Lifecycle, Some(server_id), None, "connecting", None)
            .await;

        let descriptor = self.descriptor_of(server_id).await.ok_or(McpError::NotConnected { server_id })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if internal_tx.send((server_id, event)).is_err() {
                    break;
                }
            }
        });

        let transport = self.build_transport(&descriptor, tx).await?;
        let rpc = Arc::new(JsonRpcClient::new(Arc::clone(&transport)));

        let client_info = descriptor.client_info.clone().unwrap_or(ClientInfo {
            name: self.config.client_name.clone(),
            version: self.config.client_version.clone(),
        });
        let handlers = self.dispatch_handlers.read().await.clone();
        let capabilities = dispatch::client_capabilities(&handlers);

        let result = rpc.initialize(client_info, capabilities).await?;

        if self.current_connect_epoch(server_id).await != epoch {
            debug!("connect for {server_id} superseded (removed or re-attempted) during initialize; discarding");
            transport.disconnect().await;
            return Err(McpError::cancelled("connect superseded by descriptor reload"));
        }

        self.transports.write().await.insert(server_id, Arc::clone(&transport));
        self.rpc_clients.write().await.insert(server_id, Arc::clone(&rpc));
        {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&server_id) {
                status.server_info = Some(result.server_info.clone());
                status.negotiated_protocol_version = result.protocol_version.clone();
            }
        }
        self.set_state(server_id, ConnectionState::Ready).await;
        self.governance
            .push(GovernanceLevel::Info, GovernanceCategory::Lifecycle, Some(server_id), None, "connected", None)
            .await;
        crate::metrics::record_connect(&descriptor.display_name, true);

        if self.is_cache_stale(server_id).await {
            if let Err(e) = self.refresh_metadata(server_id).await {
                warn!("initial metadata refresh failed: {e}");
            }
        } else {
            self.rebuild_aggregation().await;
        }
        Ok(())
    }

    async fn fail_without_retry(&self, server_id: Uuid, reason: String) {
        let server_name = self.descriptor_of(server_id).await.map(|d| d.display_name);
        self.set_state(server_id, ConnectionState::Failed { reason: reason.clone() }).await;
        self.governance
            .push(GovernanceLevel::Warn, GovernanceCategory::Lifecycle, Some(server_id), None, format!("connect failed: {reason}"), None)
            .await;
        if let Some(name) = &server_name {
            crate::metrics::record_connect(name, false);
        }
        self.rebuild_aggregation().await;
    }

    fn schedule_reconnect(self: &Arc<Self>, server_id: Uuid, attempt: u32) {
        if attempt > self.config.reconnect_max_attempts {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager
                    .governance
                    .push(GovernanceLevel::Warn, GovernanceCategory::Lifecycle, Some(server_id), None, "retry ceiling reached; giving up until manual action", None)
                    .await;
            });
            return;
        }
        let manager = Arc::clone(self);
        let delay = self.config.backoff_delay(attempt);
        tokio::spawn(async move {
            if let Some(name) = manager.descriptor_of(server_id).await.map(|d| d.display_name) {
                crate::metrics::record_reconnect_scheduled(&name, attempt);
            }
            let scheduled_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            manager
                .set_state(
                    server_id,
                    ConnectionState::Reconnecting {
                        attempt,
                        scheduled_at,
                        reason: "awaiting retry after connect failure".to_string(),
                    },
                )
                .await;
            tokio::time::sleep(delay).await;
            let still_pending = matches!(
                manager.state_of(server_id).await,
                Some(ConnectionState::Reconnecting { attempt: a, .. }) if a == attempt
            );
            if !still_pending {
                return;
            }
            match manager.attempt_connect(server_id).await {
                Ok(()) => {}
                Err(e) => {
                    manager.fail_without_retry(server_id, e.to_string()).await;
                    manager.schedule_reconnect(server_id, attempt + 1);
                }
            }
        });
    }

    pub async fn disconnect(&self, server_id: Uuid) {
        if let Some(transport) = self.transports.write().await.remove(&server_id) {
            if let Some(token) = transport.resumption_token().await {
                let mut statuses = self.statuses.write().await;
                if let Some(status) = statuses.get_mut(&server_id) {
                    status.descriptor.resumption_token = Some(token);
                }
            }
            if let Some(rpc) = self.rpc_clients.read().await.get(&server_id).cloned() {
                self.toolcalls.cancel_all_for_server(&rpc, server_id, "server disconnected").await;
            }
            transport.disconnect().await;
        }
        self.rpc_clients.write().await.remove(&server_id);
        self.set_state(server_id, ConnectionState::Idle).await;
        self.governance
            .push(GovernanceLevel::Info, GovernanceCategory::Lifecycle, Some(server_id), None, "disconnected", None)
            .await;
        self.rebuild_aggregation().await;
    }

    pub async fn ensure_client_ready(self: &Arc<Self>, server_id: Uuid, refresh_if_cache_missing: bool) -> McpResult<Arc<JsonRpcClient>> {
        let ready = self.is_ready(server_id).await;
        if ready {
            if refresh_if_cache_missing && self.is_cache_stale(server_id).await {
                let _ = self.refresh_metadata(server_id).await;
            }
            return self.rpc_clients.read().await.get(&server_id).cloned().ok_or(McpError::TransportUnavailable);
        }
        {
            let exists = self.statuses.read().await.contains_key(&server_id);
            if !exists {
                return Err(McpError::NotConnected { server_id });
            }
        }
        self.connect(server_id, true).await?;
        self.rpc_clients.read().await.get(&server_id).cloned().ok_or(McpError::TransportUnavailable)
    }

    // -----------------------------------------------------------------
    // Metadata refresh
    // -----------------------------------------------------------------

    pub async fn refresh_metadata(self: &Arc<Self>, server_id: Uuid) -> McpResult<()> {
        if !self.is_ready(server_id).await {
            return Err(McpError::NotConnected { server_id });
        }
        let rpc = self
            .rpc_clients
            .read()
            .await
            .get(&server_id)
            .cloned()
            .ok_or(McpError::NotConnected { server_id })?;
        let timeout = Duration::from_secs(30);

        let (tools, resources, templates, prompts, roots) = tokio::join!(
            rpc.list_tools(timeout),
            rpc.list_resources(timeout),
            rpc.list_resource_templates(timeout),
            rpc.list_prompts(timeout),
            rpc.list_roots(timeout),
        );

        let first_error = [
            tools.as_ref().err(),
            resources.as_ref().err(),
            templates.as_ref().err(),
            prompts.as_ref().err(),
            roots.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        .next()
        .map(|e| e.to_string());

        let server_name = self.descriptor_of(server_id).await.map(|d| d.display_name);
        if let Some(reason) = first_error {
            if let Some(name) = &server_name {
                crate::metrics::record_metadata_refresh(name, false);
            }
            self.fail_without_retry(server_id, reason.clone()).await;
            if self.retry_on_failure(server_id).await && self.is_selected(server_id).await {
                self.schedule_reconnect(server_id, 1);
            }
            return Err(McpError::transport(reason));
        }

        let now = Utc::now();
        {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&server_id) {
                status.tools = tools.unwrap();
                status.resources = resources.unwrap();
                status.resource_templates = templates.unwrap();
                status.prompts = prompts.unwrap();
                status.roots = roots.unwrap();
                status.metadata_cached_at = Some(now);
            }
        }
        if let Some(name) = &server_name {
            crate::metrics::record_metadata_refresh(name, true);
        }
        self.rebuild_aggregation().await;
        self.governance
            .push(GovernanceLevel::Info, GovernanceCategory::Cache, Some(server_id), None, "metadata refreshed", None)
            .await;
        Ok(())
    }

    async fn busy_count(&self, server_id: Uuid) -> u32 {
        self.toolcalls
            .active_calls()
            .await
            .iter()
            .filter(|c| c.server_id == server_id && !c.state.is_terminal())
            .count() as u32
    }

    pub async fn set_log_level(self: &Arc<Self>, server_id: Uuid, level: &str) -> McpResult<()> {
        let rpc = self.ensure_client_ready(server_id, false).await?;
        rpc.set_log_level(level, Duration::from_secs(10)).await?;
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&server_id) {
            status.log_level = Some(level.to_string());
        }
        Ok(())
    }

    pub async fn persisted_record(&self, server_id: Uuid) -> Option<PersistedServerRecord> {
        let statuses = self.statuses.read().await;
        let status = statuses.get(&server_id)?;
        let metadata_cache = status.metadata_cached_at.map(|cached_at| MetadataCacheRecord {
            cached_at,
            server_info: status.server_info.clone().unwrap_or_default(),
            tools: status.tools.iter().map(Into::into).collect(),
            resources: status.resources.clone(),
            resource_templates: status.resource_templates.clone(),
            prompts: status.prompts.clone(),
            roots: status.roots.clone(),
        });
        Some(PersistedServerRecord {
            schema_version: crate::cache::CURRENT_SCHEMA_VERSION,
            descriptor: status.descriptor.clone(),
            metadata_cache,
        })
    }
}

/// A typed, cloneable handle a host embeds in its application state
/// (distilled §4.11). All mutation goes through `ConnectionManager`; this
/// is a thin, ergonomic facade over it.
#[derive(Clone)]
pub struct McpRuntimeHandle {
    manager: Arc<ConnectionManager>,
}

impl McpRuntimeHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            manager: ConnectionManager::new(config),
        }
    }

    pub fn from_manager(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub async fn load_descriptors(&self, descriptors: Vec<ServerDescriptor>) {
        self.manager.reload_descriptors(descriptors).await;
    }

    pub async fn load_persisted(&self, records: Vec<PersistedServerRecord>) {
        self.manager.load_persisted(records).await;
    }

    pub fn spawn_config_watcher(&self, loader: Arc<dyn DescriptorLoader>) {
        self.manager.spawn_config_watcher(loader);
    }

    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self.manager.statuses.read().await.values().cloned().collect();
        for status in &mut statuses {
            status.busy = self.manager.busy_count(status.descriptor.id).await;
        }
        statuses
    }

    pub async fn status(&self, server_id: Uuid) -> Option<ServerStatus> {
        let mut status = self.manager.statuses.read().await.get(&server_id).cloned()?;
        status.busy = self.manager.busy_count(server_id).await;
        Some(status)
    }

    pub async fn set_log_level(&self, server_id: Uuid, level: &str) -> McpResult<()> {
        self.manager.set_log_level(server_id, level).await
    }

    pub async fn connect(&self, server_id: Uuid) -> McpResult<()> {
        self.manager.connect(server_id, true).await
    }

    pub async fn disconnect(&self, server_id: Uuid) {
        self.manager.disconnect(server_id).await;
    }

    pub async fn set_selected(&self, server_id: Uuid, selected: bool) {
        {
            let mut statuses = self.manager.statuses.write().await;
            if let Some(status) = statuses.get_mut(&server_id) {
                status.descriptor.selected_for_chat = selected;
            }
        }
        self.manager.rebuild_aggregation().await;
        if !selected {
            self.manager.disconnect(server_id).await;
        }
    }

    pub async fn set_tool_enabled(&self, server_id: Uuid, tool_id: &str, enabled: bool) {
        {
            let mut statuses = self.manager.statuses.write().await;
            if let Some(status) = statuses.get_mut(&server_id) {
                status.descriptor.tool_enabled.insert(tool_id.to_string(), enabled);
            }
        }
        self.manager.rebuild_aggregation().await;
    }

    pub async fn set_tool_approval(&self, server_id: Uuid, tool_id: &str, policy: ApprovalPolicy) {
        {
            let mut statuses = self.manager.statuses.write().await;
            if let Some(status) = statuses.get_mut(&server_id) {
                status.descriptor.tool_approval.insert(tool_id.to_string(), policy);
            }
        }
        self.manager.rebuild_aggregation().await;
    }

    /// Invoke a tool by its aggregator-minted internal name (alias or
    /// canonical form). Rechecks enable/approval against the descriptor's
    /// current state before contacting the server (distilled §4.6).
    pub async fn invoke_tool(&self, internal_name: &str, arguments: Value, options: ToolCallOptions) -> McpResult<Value> {
        let target = {
            let aggregation = self.manager.aggregation.read().await;
            aggregation
                .resolve_tool(internal_name)
                .map(|t| (t.server_id, t.id.clone()))
                .ok_or_else(|| McpError::invalid_response(format!("unknown tool '{internal_name}'")))?
        };
        let (server_id, tool_id) = target;

        let descriptor = self
            .manager
            .descriptor_of(server_id)
            .await
            .ok_or(McpError::NotConnected { server_id })?;
        aggregator::enforce_tool_policy(&descriptor, &tool_id)?;

        let rpc = self.manager.ensure_client_ready(server_id, true).await?;
        self.manager.toolcalls.invoke(rpc, server_id, &tool_id, arguments, options).await
    }

    pub async fn read_resource(&self, internal_name: &str, arguments: Option<Value>) -> McpResult<Value> {
        let target = {
            let aggregation = self.manager.aggregation.read().await;
            aggregation
                .resolve_resource(internal_name)
                .map(|t| (t.server_id, t.id.clone()))
                .ok_or_else(|| McpError::invalid_response(format!("unknown resource '{internal_name}'")))?
        };
        let (server_id, uri) = target;
        let rpc = self.manager.ensure_client_ready(server_id, true).await?;
        rpc.read_resource(&uri, arguments, Duration::from_secs(30)).await
    }

    pub async fn get_prompt(&self, internal_name: &str, arguments: Option<Value>) -> McpResult<GetPromptResult> {
        let target = {
            let aggregation = self.manager.aggregation.read().await;
            aggregation
                .resolve_prompt(internal_name)
                .map(|t| (t.server_id, t.id.clone()))
                .ok_or_else(|| McpError::invalid_response(format!("unknown prompt '{internal_name}'")))?
        };
        let (server_id, name) = target;
        let rpc = self.manager.ensure_client_ready(server_id, true).await?;
        rpc.get_prompt(&name, arguments, Duration::from_secs(30)).await
    }

    pub async fn aggregated_tools(&self) -> Vec<crate::aggregator::AggregatedTool> {
        self.manager.aggregation.read().await.tools.clone()
    }

    pub async fn aggregated_resources(&self) -> Vec<crate::aggregator::AggregatedResource> {
        self.manager.aggregation.read().await.resources.clone()
    }

    pub async fn aggregated_prompts(&self) -> Vec<crate::aggregator::AggregatedPrompt> {
        self.manager.aggregation.read().await.prompts.clone()
    }

    pub async fn governance_log(&self) -> Vec<GovernanceEntry> {
        self.manager.governance.snapshot().await
    }

    pub async fn register_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        self.manager.dispatch_handlers.write().await.sampling = Some(handler);
    }

    pub async fn register_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        self.manager.dispatch_handlers.write().await.elicitation = Some(handler);
    }

    pub async fn register_credential_provider(&self, id: impl Into<String>, provider: Arc<dyn CredentialProvider>) {
        self.manager.credential_providers.write().await.insert(id.into(), provider);
    }

    pub async fn active_calls(&self) -> Vec<ManagedCall> {
        self.manager.toolcalls.active_calls().await
    }

    pub async fn cancel_call(&self, call_id: Uuid, reason: &str) -> McpResult<()> {
        let call = self.manager.toolcalls.get(call_id).await.ok_or_else(|| McpError::invalid_response("unknown call id"))?;
        let rpc = self
            .manager
            .rpc_clients
            .read()
            .await
            .get(&call.server_id)
            .cloned()
            .ok_or(McpError::NotConnected { server_id: call.server_id })?;
        self.manager.toolcalls.cancel(&rpc, call_id, reason).await
    }

    pub async fn force_refresh(&self, server_id: Uuid) -> McpResult<()> {
        self.manager.refresh_metadata(server_id).await
    }

    pub async fn invalidate_cache(&self, server_id: Uuid) {
        self.manager.invalidate_cache(server_id).await;
        self.manager.rebuild_aggregation().await;
    }

    pub async fn persisted_record(&self, server_id: Uuid) -> Option<PersistedServerRecord> {
        self.manager.persisted_record(server_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reload_descriptors_adds_and_removes_servers() {
        let handle = McpRuntimeHandle::new(RuntimeConfig::default());
        let descriptor = ServerDescriptor::new(
            "test",
            TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        let id = descriptor.id;
        handle.load_descriptors(vec![descriptor]).await;
        assert_eq!(handle.statuses().await.len(), 1);

        handle.load_descriptors(vec![]).await;
        assert!(handle.status(id).await.is_none());
    }

    #[tokio::test]
    async fn reload_descriptors_invalidates_the_connect_epoch_for_removed_servers() {
        let manager = ConnectionManager::new(RuntimeConfig::default());
        let descriptor = ServerDescriptor::new(
            "test",
            TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        let id = descriptor.id;
        manager.reload_descriptors(vec![descriptor]).await;

        // Simulate an attempt_connect that captured its epoch before a
        // concurrent reload removed the server out from under it.
        let in_flight_epoch = manager.next_connect_epoch(id).await;
        manager.reload_descriptors(vec![]).await;
        assert_ne!(manager.current_connect_epoch(id).await, in_flight_epoch);
    }

    #[tokio::test]
    async fn invoke_unknown_tool_name_is_an_error() {
        let handle = McpRuntimeHandle::new(RuntimeConfig::default());
        let err = handle
            .invoke_tool("mcp_deadbeef_calc", Value::Null, ToolCallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn ensure_client_ready_rejects_unknown_server() {
        let manager = ConnectionManager::new(RuntimeConfig::default());
        let err = manager.ensure_client_ready(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
    }
}
