//! The server: registry and bind/lifecycle manager
//!
//! The main point of entry for registering topologies. Registering binds
//! every node to its listen address (all-or-nothing under a total bind
//! budget), publishes the bound cluster in the registry and returns it.
//! Operator commands (prime, reject, accept, close, unregister) mutate the
//! bound runtime in place.

mod bound;
mod connection;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::{ClusterConnectionReport, ClusterSpec, NodeSpec, QueryLog, Scope};
use crate::config::Config;
use crate::error::{CassetteError, Result};
use crate::resolver::{AddressResolver, LoopbackResolver};
use crate::stub::{CloseType, Prime, PrimeKind, StubStore};

pub use bound::{BindDelayFn, BoundCluster, BoundDataCenter, BoundNode, RejectScope};
pub use connection::ClientChannel;

/// Per-register overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Override the server-wide activity-logging default
    pub activity_logging: Option<bool>,
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    config: Config,
    resolver: Option<Arc<dyn AddressResolver>>,
    stub_store: Option<Arc<StubStore>>,
    bind_delay: Option<BindDelayFn>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            resolver: None,
            stub_store: None,
            bind_delay: None,
        }
    }
}

impl ServerBuilder {
    /// Use this configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Total budget for binding all listeners of one register call
    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.config.server.bind_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Whether observed requests are recorded in activity logs
    pub fn with_activity_logging(mut self, enabled: bool) -> Self {
        self.config.server.activity_logging = enabled;
        self
    }

    /// Use a custom address resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use a custom stub store (the default carries the system-table built-ins)
    pub fn with_stub_store(mut self, stub_store: Arc<StubStore>) -> Self {
        self.stub_store = Some(stub_store);
        self
    }

    /// Test instrumentation: delay binds for selected addresses
    pub fn with_bind_delay(mut self, delay: BindDelayFn) -> Self {
        self.bind_delay = Some(delay);
        self
    }

    /// Build the server
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(LoopbackResolver::from_config(&self.config.resolver)));
        let stub_store = self
            .stub_store
            .unwrap_or_else(|| Arc::new(StubStore::with_builtins()));
        Ok(Server {
            bind_timeout: self.config.bind_timeout(),
            activity_logging: self.config.server.activity_logging,
            resolver,
            stub_store,
            bind_delay: self.bind_delay,
            registry: DashMap::new(),
            cluster_counter: AtomicU64::new(0),
        })
    }
}

/// The simulator server: owns the cluster registry, the stub store and the
/// address resolver. A process may host several independent servers.
pub struct Server {
    bind_timeout: Duration,
    activity_logging: bool,
    resolver: Arc<dyn AddressResolver>,
    stub_store: Arc<StubStore>,
    bind_delay: Option<BindDelayFn>,
    registry: DashMap<u64, Arc<BoundCluster>>,
    cluster_counter: AtomicU64,
}

impl Server {
    /// A server with default configuration
    pub fn new() -> Self {
        ServerBuilder::default()
            .build()
            .expect("default config is valid")
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The stub store backing this server
    pub fn stub_store(&self) -> &Arc<StubStore> {
        &self.stub_store
    }

    // ── registration ─────────────────────────────────────────────────────

    /// Register a topology with default options
    pub async fn register(&self, cluster: ClusterSpec) -> Result<Arc<BoundCluster>> {
        self.register_with_options(cluster, ServerOptions::default())
            .await
    }

    /// Register a topology: assign ids and tokens, pick addresses, bind all
    /// listeners concurrently under the bind budget, and publish the bound
    /// cluster. All-or-nothing: any failed or timed-out bind rolls back
    /// every successful bind and the registry is left untouched.
    pub async fn register_with_options(
        &self,
        mut spec: ClusterSpec,
        options: ServerOptions,
    ) -> Result<Arc<BoundCluster>> {
        let cluster_id = match spec.id {
            Some(id) => {
                if self.registry.contains_key(&id) {
                    return Err(CassetteError::BadArgument(format!(
                        "cluster id {id} is already registered"
                    )));
                }
                id
            }
            None => self.next_cluster_id(),
        };
        spec.id = Some(cluster_id);
        let activity_logging = options.activity_logging.unwrap_or(self.activity_logging);

        // Resolve ids, tokens and addresses onto the spec.
        let cluster_peer_info = spec.peer_info.clone();
        let mut resolver_assigned: HashSet<(u64, u64)> = HashSet::new();
        for (dc_pos, dc) in spec.data_centers.iter_mut().enumerate() {
            dc.id = dc_pos as u64;
            let node_count = dc.nodes.len();
            let dc_has_token = dc.peer_info.contains_key("token");
            for (node_pos, node) in dc.nodes.iter_mut().enumerate() {
                node.id = node_pos as u64;
                let has_token = node.peer_info.contains_key("token")
                    || dc_has_token
                    || cluster_peer_info.contains_key("token");
                if !has_token {
                    node.peer_info.insert(
                        "token".to_string(),
                        json!(crate::cluster::assign_token(dc.id, node.id, node_count)),
                    );
                }
                if node.address.is_none() {
                    node.address = Some(self.resolver.next());
                    resolver_assigned.insert((dc.id, node.id));
                }
            }
        }

        let cluster = BoundCluster::assemble(
            spec,
            self.stub_store.clone(),
            activity_logging,
            self.bind_delay.clone(),
            &|dc_id, node_id| resolver_assigned.contains(&(dc_id, node_id)),
        );

        // Bind every node concurrently; each pending bind gets whatever is
        // left of the total budget.
        let deadline = Instant::now() + self.bind_timeout;
        let mut handles = Vec::new();
        for node in cluster.nodes() {
            let node = node.clone();
            let task = node.clone();
            handles.push((node, tokio::spawn(async move { task.bind().await })));
        }

        let mut bound_nodes = Vec::new();
        let mut late_binders = Vec::new();
        let mut first_error: Option<CassetteError> = None;
        let mut timed_out = false;
        for (node, mut handle) in handles {
            let remaining = if timed_out {
                Duration::ZERO
            } else {
                deadline.saturating_duration_since(Instant::now())
            };
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(Ok(()))) => bound_nodes.push(node),
                Ok(Ok(Err(e))) => {
                    if node.resolver_assigned {
                        self.resolver.release(node.address);
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Ok(Err(join_error)) => {
                    if node.resolver_assigned {
                        self.resolver.release(node.address);
                    }
                    if first_error.is_none() {
                        first_error = Some(CassetteError::Io(std::io::Error::other(join_error)));
                    }
                }
                Err(_elapsed) => {
                    timed_out = true;
                    if first_error.is_none() {
                        first_error = Some(CassetteError::BindTimeout);
                    }
                    late_binders.push((node, handle));
                }
            }
        }

        if let Some(error) = first_error {
            debug!(cluster = cluster_id, error = %error, "register failed, rolling back binds");
            for node in &bound_nodes {
                self.close_node(node).await;
            }
            // A bind that outlives the budget settles in the background and
            // is torn down when it does.
            for (node, handle) in late_binders {
                let resolver = self.resolver.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(())) = handle.await {
                        node.close().await;
                    }
                    if node.resolver_assigned {
                        resolver.release(node.address);
                    }
                });
            }
            return Err(error);
        }

        info!(cluster = cluster_id, nodes = cluster.nodes().count(), "registered cluster");
        self.registry.insert(cluster_id, cluster.clone());
        Ok(cluster)
    }

    /// Register a standalone node by wrapping it in a hidden single-DC
    /// cluster. A node that already belongs to a data center must be
    /// registered via its cluster.
    pub async fn register_node(&self, node: NodeSpec) -> Result<Arc<BoundNode>> {
        if node.has_parent() {
            return Err(CassetteError::BadArgument(
                "node belongs to a cluster, register it via the cluster".to_string(),
            ));
        }
        let mut cluster = ClusterSpec::named("dummy");
        let dc = cluster.add_data_center();
        dc.name = Some("dummy".to_string());
        let slot = dc.add_node();
        slot.name = node.name;
        slot.address = node.address;
        slot.cassandra_version = node.cassandra_version;
        slot.dse_version = node.dse_version;
        slot.peer_info = node.peer_info;
        if !slot.peer_info.contains_key("token") {
            slot.peer_info.insert("token".to_string(), json!("0"));
        }

        let bound = self.register(cluster).await?;
        Ok(bound.node(0, 0).expect("wrapper cluster has one node").clone())
    }

    /// Unregister a cluster: close every node, release its addresses and
    /// remove it from the registry. Returns the previously registered value.
    pub async fn unregister(&self, cluster_id: u64) -> Result<Arc<BoundCluster>> {
        let Some(cluster) = self.registry.get(&cluster_id).map(|entry| entry.value().clone())
        else {
            return Err(CassetteError::BadArgument(format!(
                "cluster {cluster_id} not found"
            )));
        };
        info!(cluster = cluster_id, "unregistering cluster");
        for node in cluster.nodes() {
            self.close_node(node).await;
        }
        self.registry.remove(&cluster_id);
        Ok(cluster)
    }

    /// Unregister every cluster, returning how many were removed
    pub async fn unregister_all(&self) -> Result<usize> {
        let ids: Vec<u64> = self.registry.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for id in ids {
            if self.unregister(id).await.is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── priming ──────────────────────────────────────────────────────────

    /// Register a canned response
    pub fn prime(&self, prime: Prime) {
        self.stub_store.register(prime);
    }

    /// Remove primes of a kind within a scope; returns how many were removed
    pub fn clear_primes(&self, scope: &Scope, kind: PrimeKind) -> usize {
        self.stub_store.clear(scope, kind)
    }

    // ── connection control ───────────────────────────────────────────────

    /// Configure the nodes in scope to reject new connections
    pub async fn reject_connections(
        &self,
        scope: &Scope,
        after: u32,
        reject_scope: RejectScope,
    ) -> Result<()> {
        for node in self.nodes_in_scope(scope) {
            node.reject_new_connections(after, reject_scope).await;
        }
        Ok(())
    }

    /// Configure the nodes in scope to accept connections again
    pub async fn accept_connections(&self, scope: &Scope) -> Result<()> {
        for node in self.nodes_in_scope(scope) {
            node.accept_new_connections().await?;
        }
        Ok(())
    }

    /// Stop the nodes in scope: unbind listeners and drop their connections
    pub async fn stop(&self, scope: &Scope) -> Result<()> {
        self.reject_connections(scope, 0, RejectScope::Stop).await
    }

    /// Start previously stopped/rejected nodes
    pub async fn start(&self, scope: &Scope) -> Result<()> {
        self.accept_connections(scope).await
    }

    /// Close all connections in scope with the given method; returns the
    /// connections that were closed.
    pub async fn close_connections(
        &self,
        scope: &Scope,
        close_type: CloseType,
    ) -> Result<Vec<ClusterConnectionReport>> {
        let report = self.connections(scope);
        for node in self.nodes_in_scope(scope) {
            node.close_client_channels(close_type).await;
        }
        Ok(report)
    }

    /// Close one connection identified by its remote address
    pub async fn close_connection(
        &self,
        remote: SocketAddr,
        close_type: CloseType,
    ) -> Result<ClusterConnectionReport> {
        let clusters = self.clusters_in_scope(&Scope::any());
        for cluster in clusters {
            for dc in &cluster.data_centers {
                for node in &dc.nodes {
                    if let Some(channel) = node.channel_by_remote(remote) {
                        channel.close(close_type).await;
                        let mut report = ClusterConnectionReport::new(cluster.id);
                        report.add_node(dc.id, node.id, node.address, vec![remote]);
                        return Ok(report);
                    }
                }
            }
        }
        Err(CassetteError::BadArgument(format!(
            "connection {remote} not found"
        )))
    }

    /// Report open connections per node in scope
    pub fn connections(&self, scope: &Scope) -> Vec<ClusterConnectionReport> {
        let mut reports = Vec::new();
        for cluster in self.clusters_in_scope(scope) {
            let mut report = ClusterConnectionReport::new(cluster.id);
            for dc in &cluster.data_centers {
                for node in &dc.nodes {
                    if scope.contains(cluster.id, dc.id, node.id) {
                        report.add_node(dc.id, node.id, node.address, node.client_addresses());
                    }
                }
            }
            reports.push(report);
        }
        reports
    }

    // ── activity log ─────────────────────────────────────────────────────

    /// Observed requests for the nodes in scope
    pub fn activity_log(&self, scope: &Scope) -> Vec<QueryLog> {
        let mut entries = Vec::new();
        for cluster in self.clusters_in_scope(scope) {
            entries.extend(
                cluster
                    .activity_log
                    .filtered(|entry| {
                        scope.contains(cluster.id, entry.data_center_id, entry.node_id)
                    }),
            );
        }
        entries
    }

    /// Drop recorded requests for the nodes in scope
    pub fn clear_activity_log(&self, scope: &Scope) {
        for cluster in self.clusters_in_scope(scope) {
            if scope.data_center_id.is_none() && scope.node_id.is_none() {
                cluster.activity_log.clear();
            } else {
                cluster.activity_log.retain(|entry| {
                    !scope.contains(cluster.id, entry.data_center_id, entry.node_id)
                });
            }
        }
    }

    // ── registry access ──────────────────────────────────────────────────

    /// The registered cluster with this id
    pub fn cluster(&self, cluster_id: u64) -> Option<Arc<BoundCluster>> {
        self.registry.get(&cluster_id).map(|entry| entry.value().clone())
    }

    /// Ids of all registered clusters
    pub fn cluster_ids(&self) -> Vec<u64> {
        self.registry.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered clusters
    pub fn cluster_count(&self) -> usize {
        self.registry.len()
    }

    /// Resolve a cluster by numeric id or by name
    pub fn cluster_id_from_id_or_name(&self, id_or_name: &str) -> Option<u64> {
        if let Ok(id) = id_or_name.parse::<u64>() {
            if self.registry.contains_key(&id) {
                return Some(id);
            }
        }
        self.registry
            .iter()
            .find(|entry| entry.value().name == id_or_name)
            .map(|entry| *entry.key())
    }

    /// Resolve a data center by numeric id or by name within a cluster
    pub fn data_center_id_from_id_or_name(
        &self,
        cluster_id: u64,
        id_or_name: &str,
    ) -> Option<u64> {
        let cluster = self.cluster(cluster_id)?;
        cluster
            .data_centers
            .iter()
            .find(|dc| dc.name == id_or_name || dc.id.to_string() == id_or_name)
            .map(|dc| dc.id)
    }

    /// Resolve a node by numeric id or by name within a data center
    pub fn node_id_from_id_or_name(
        &self,
        cluster_id: u64,
        data_center_id: u64,
        id_or_name: &str,
    ) -> Option<u64> {
        let cluster = self.cluster(cluster_id)?;
        cluster
            .data_centers
            .iter()
            .find(|dc| dc.id == data_center_id)?
            .nodes
            .iter()
            .find(|node| node.name == id_or_name || node.id.to_string() == id_or_name)
            .map(|node| node.id)
    }

    /// All bound nodes falling inside the scope
    pub fn nodes_in_scope(&self, scope: &Scope) -> Vec<Arc<BoundNode>> {
        let mut nodes = Vec::new();
        for cluster in self.clusters_in_scope(scope) {
            for dc in &cluster.data_centers {
                for node in &dc.nodes {
                    if scope.contains(cluster.id, dc.id, node.id) {
                        nodes.push(node.clone());
                    }
                }
            }
        }
        nodes
    }

    fn clusters_in_scope(&self, scope: &Scope) -> Vec<Arc<BoundCluster>> {
        match scope.cluster_id {
            Some(id) => self.cluster(id).into_iter().collect(),
            None => self.registry.iter().map(|entry| entry.value().clone()).collect(),
        }
    }

    fn next_cluster_id(&self) -> u64 {
        loop {
            let id = self.cluster_counter.fetch_add(1, Ordering::Relaxed);
            if !self.registry.contains_key(&id) {
                return id;
            }
        }
    }

    async fn close_node(&self, node: &Arc<BoundNode>) {
        node.close().await;
        if node.resolver_assigned {
            debug!(address = %node.address, "releasing address back to resolver");
            self.resolver.release(node.address);
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
