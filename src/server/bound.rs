//! Bound topology runtime
//!
//! The live counterpart of a registered topology: each node owns a listener
//! task, the set of accepted client channels, its reject-state, and the
//! per-frame dispatch that consults the stub store or falls back to the
//! default response table.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::{
    epoch_millis, ActivityLog, ClusterConnectionReport, ClusterSpec, QueryLog,
};
use crate::error::{CassetteError, Result};
use crate::protocol::{Batch, BatchQuery, Frame, Message};
use crate::stub::{
    hex_id, Action, ActionKind, CloseType, DisconnectScope, NodeContext, Prime, PrimeResult,
    QueryMatcher, RequestMatcher, StubStore,
};

use super::connection::{spawn_connection, ClientChannel};

/// What a reject does to new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectScope {
    /// Unbind the listener; existing channels remain
    Unbind,
    /// Unbind the listener and disconnect existing channels
    Stop,
    /// Keep listening but drop Startup/Register frames
    RejectStartup,
}

/// Per-node reject-state record. Default is accepting with no counter.
#[derive(Debug, Clone, Copy)]
struct RejectState {
    listening: bool,
    reject_after: i64,
    scope: Option<RejectScope>,
}

impl Default for RejectState {
    fn default() -> Self {
        Self {
            listening: true,
            reject_after: 0,
            scope: None,
        }
    }
}

/// What the dispatch decided for one frame
pub(crate) enum Outcome {
    /// Nothing to send (dropped frame, or a spawned action list)
    None,
    /// Send this message
    Reply(Message),
    /// Send this message, then run the scheduled reject transition
    ReplyThenTransition(Message, RejectScope),
}

/// Test-instrumentation hook: artificial delay before a node's bind
pub type BindDelayFn = Arc<dyn Fn(SocketAddr) -> Option<Duration> + Send + Sync>;

struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// A bound, traffic-serving node
pub struct BoundNode {
    pub id: u64,
    pub data_center_id: u64,
    pub cluster_id: u64,
    pub name: String,
    pub address: SocketAddr,
    pub cassandra_version: Option<String>,
    pub dse_version: Option<String>,
    /// Peer info including the assigned token
    pub peer_info: BTreeMap<String, Value>,

    /// Whether this node's address came from the resolver (released on close)
    pub(crate) resolver_assigned: bool,

    cluster: OnceLock<Weak<BoundCluster>>,
    topology: OnceLock<Arc<ClusterSpec>>,

    stub_store: Arc<StubStore>,
    activity_logging: bool,
    bind_delay: Option<BindDelayFn>,

    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    clients: Mutex<HashMap<u64, Arc<ClientChannel>>>,
    channel_ids: AtomicU64,
    reject_state: Mutex<RejectState>,
}

impl std::fmt::Debug for BoundNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundNode")
            .field("id", &self.id)
            .field("data_center_id", &self.data_center_id)
            .field("cluster_id", &self.cluster_id)
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// A bound data center: scalar attributes plus its nodes
pub struct BoundDataCenter {
    pub id: u64,
    pub name: String,
    pub nodes: Vec<Arc<BoundNode>>,
}

impl std::fmt::Debug for BoundDataCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundDataCenter")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .finish()
    }
}

/// A bound, registered cluster
pub struct BoundCluster {
    pub id: u64,
    pub name: String,
    pub cassandra_version: Option<String>,
    pub dse_version: Option<String>,
    pub peer_info: BTreeMap<String, Value>,
    pub data_centers: Vec<BoundDataCenter>,
    pub activity_log: ActivityLog,
    spec: Arc<ClusterSpec>,
}

impl std::fmt::Debug for BoundCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundCluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cassandra_version", &self.cassandra_version)
            .field("dse_version", &self.dse_version)
            .field("data_centers", &self.data_centers)
            .finish_non_exhaustive()
    }
}

impl BoundCluster {
    /// Assemble the bound tree from a fully resolved spec (ids, addresses and
    /// tokens all assigned) and wire up the node back-references.
    pub(crate) fn assemble(
        spec: ClusterSpec,
        stub_store: Arc<StubStore>,
        activity_logging: bool,
        bind_delay: Option<BindDelayFn>,
        resolver_assigned: &dyn Fn(u64, u64) -> bool,
    ) -> Arc<Self> {
        let cluster_id = spec.id.unwrap_or(0);
        let spec = Arc::new(spec);

        let mut data_centers = Vec::with_capacity(spec.data_centers.len());
        for dc in &spec.data_centers {
            let mut nodes = Vec::with_capacity(dc.nodes.len());
            for node in &dc.nodes {
                nodes.push(Arc::new(BoundNode {
                    id: node.id,
                    data_center_id: dc.id,
                    cluster_id,
                    name: node.effective_name(),
                    address: node.address.expect("resolved spec has addresses"),
                    cassandra_version: node.cassandra_version.clone(),
                    dse_version: node.dse_version.clone(),
                    peer_info: node.peer_info.clone(),
                    resolver_assigned: resolver_assigned(dc.id, node.id),
                    cluster: OnceLock::new(),
                    topology: OnceLock::new(),
                    stub_store: stub_store.clone(),
                    activity_logging,
                    bind_delay: bind_delay.clone(),
                    listener: tokio::sync::Mutex::new(None),
                    clients: Mutex::new(HashMap::new()),
                    channel_ids: AtomicU64::new(0),
                    reject_state: Mutex::new(RejectState::default()),
                }));
            }
            data_centers.push(BoundDataCenter {
                id: dc.id,
                name: dc.effective_name(),
                nodes,
            });
        }

        let cluster = Arc::new(BoundCluster {
            id: cluster_id,
            name: spec.effective_name(),
            cassandra_version: spec.cassandra_version.clone(),
            dse_version: spec.dse_version.clone(),
            peer_info: spec.peer_info.clone(),
            data_centers,
            activity_log: ActivityLog::new(),
            spec: spec.clone(),
        });

        for node in cluster.nodes() {
            let _ = node.cluster.set(Arc::downgrade(&cluster));
            let _ = node.topology.set(spec.clone());
        }
        cluster
    }

    /// The resolved spec this cluster was bound from
    pub fn spec(&self) -> Arc<ClusterSpec> {
        self.spec.clone()
    }

    /// All nodes of all data centers
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<BoundNode>> {
        self.data_centers.iter().flat_map(|dc| dc.nodes.iter())
    }

    /// The node with the given data center and node ids
    pub fn node(&self, data_center_id: u64, node_id: u64) -> Option<&Arc<BoundNode>> {
        self.data_centers
            .iter()
            .find(|dc| dc.id == data_center_id)?
            .nodes
            .iter()
            .find(|node| node.id == node_id)
    }

    /// Sum of open client connections across all nodes
    pub fn active_connections(&self) -> u64 {
        self.nodes().map(|node| node.active_connections()).sum()
    }

    /// Snapshot of every node's open connections
    pub fn connection_report(&self) -> ClusterConnectionReport {
        let mut report = ClusterConnectionReport::new(self.id);
        for dc in &self.data_centers {
            for node in &dc.nodes {
                report.add_node(dc.id, node.id, node.address, node.client_addresses());
            }
        }
        report
    }
}

impl BoundNode {
    fn label(&self) -> String {
        format!("{}/{}", self.data_center_id, self.id)
    }

    fn context(&self) -> NodeContext {
        NodeContext {
            cluster_id: self.cluster_id,
            data_center_id: self.data_center_id,
            node_id: self.id,
            address: self.address,
            topology: self
                .topology
                .get()
                .cloned()
                .unwrap_or_else(|| Arc::new(ClusterSpec::default())),
        }
    }

    fn parent(&self) -> Option<Arc<BoundCluster>> {
        self.cluster.get().and_then(Weak::upgrade)
    }

    /// Open client connections that have not finished closing
    pub fn active_connections(&self) -> u64 {
        self.clients
            .lock()
            .values()
            .filter(|channel| !channel.is_closed())
            .count() as u64
    }

    /// Remote addresses of open client connections
    pub fn client_addresses(&self) -> Vec<SocketAddr> {
        self.clients
            .lock()
            .values()
            .filter(|channel| !channel.is_closed())
            .map(|channel| channel.remote)
            .collect()
    }

    /// The channel with the given remote address, if connected
    pub(crate) fn channel_by_remote(&self, remote: SocketAddr) -> Option<Arc<ClientChannel>> {
        self.clients
            .lock()
            .values()
            .find(|channel| channel.remote == remote)
            .cloned()
    }

    /// Whether the listener is currently bound
    pub async fn is_listening(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    // ── listener lifecycle ───────────────────────────────────────────────

    /// Bind the listener and start accepting. Fails with `BindFailed` when
    /// the OS rejects the address.
    pub(crate) async fn bind(self: &Arc<Self>) -> Result<()> {
        if let Some(delay_fn) = &self.bind_delay {
            if let Some(delay) = delay_fn(self.address) {
                tokio::time::sleep(delay).await;
            }
        }
        let listener =
            TcpListener::bind(self.address)
                .await
                .map_err(|source| CassetteError::BindFailed {
                    node: self.label(),
                    address: self.address,
                    source,
                })?;
        info!(node = %self.label(), address = %self.address, "bound listener");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let node = self.clone();
        tokio::spawn(accept_loop(node, listener, shutdown_rx, done_tx));
        *self.listener.lock().await = Some(ListenerHandle {
            shutdown_tx,
            done_rx,
        });
        Ok(())
    }

    /// Close the listening socket; existing channels remain
    pub(crate) async fn unbind(&self) {
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            debug!(node = %self.label(), "unbinding listener");
            let _ = handle.shutdown_tx.send(true);
            let mut done = handle.done_rx;
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Reopen the listener on the same address; no-op when already bound
    pub(crate) async fn rebind(self: &Arc<Self>) -> Result<()> {
        if self.is_listening().await {
            return Ok(());
        }
        self.bind().await
    }

    /// Disconnect all client channels; the listener is untouched
    pub(crate) async fn disconnect_connections(&self) {
        let channels: Vec<Arc<ClientChannel>> = self.clients.lock().values().cloned().collect();
        for channel in channels {
            channel.close(CloseType::Disconnect).await;
        }
    }

    /// Close channels of this node with the given method
    pub(crate) async fn close_client_channels(&self, close_type: CloseType) {
        let channels: Vec<Arc<ClientChannel>> = self.clients.lock().values().cloned().collect();
        for channel in channels {
            channel.close(close_type).await;
        }
    }

    /// Unbind, then disconnect every accepted channel
    pub(crate) async fn close(&self) {
        self.unbind().await;
        self.disconnect_connections().await;
    }

    pub(crate) fn forget_channel(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    // ── reject-state machine ─────────────────────────────────────────────

    /// Stop accepting new connections, immediately (`after` 0) or after the
    /// next `after` successful Startups.
    pub(crate) async fn reject_new_connections(self: &Arc<Self>, after: u32, scope: RejectScope) {
        if after == 0 {
            debug!(node = %self.label(), ?scope, "rejecting new connections");
            *self.reject_state.lock() = RejectState {
                listening: false,
                reject_after: 0,
                scope: Some(scope),
            };
            if scope != RejectScope::RejectStartup {
                self.unbind().await;
                if scope == RejectScope::Stop {
                    self.disconnect_connections().await;
                }
            }
        } else {
            debug!(node = %self.label(), after, ?scope, "rejecting new connections after counter");
            *self.reject_state.lock() = RejectState {
                listening: true,
                reject_after: i64::from(after),
                scope: Some(scope),
            };
        }
    }

    /// Resume accepting: reset the reject-state and rebind when unbound
    pub(crate) async fn accept_new_connections(self: &Arc<Self>) -> Result<()> {
        debug!(node = %self.label(), "accepting new connections");
        *self.reject_state.lock() = RejectState::default();
        self.rebind().await
    }

    /// Run the transition scheduled when the reject-after counter drained.
    /// The caller has already handed the Ready to the transport.
    pub(crate) async fn run_reject_transition(self: &Arc<Self>, scope: RejectScope) {
        match scope {
            RejectScope::RejectStartup => {}
            RejectScope::Unbind => self.unbind().await,
            RejectScope::Stop => {
                self.unbind().await;
                // The disconnect includes the channel this transition runs
                // on; detach so that channel's task can wind itself down.
                let node = self.clone();
                tokio::spawn(async move {
                    node.disconnect_connections().await;
                });
            }
        }
    }

    // ── frame dispatch ───────────────────────────────────────────────────

    /// Decide how to answer one frame: consult the stub store, else apply
    /// the default response table.
    pub(crate) async fn handle_frame(
        self: &Arc<Self>,
        channel: &Arc<ClientChannel>,
        frame: &Frame,
    ) -> Outcome {
        debug!(node = %self.label(), stream = frame.stream, kind = frame.message.kind_name(), "got request");
        let ctx = self.context();
        let stub = self.stub_store.find(&ctx, frame);

        if self.activity_logging {
            if let Some(cluster) = self.parent() {
                cluster
                    .activity_log
                    .record(self.query_log(frame, channel.remote, stub.is_some()));
            }
        }

        if let Some(stub) = stub {
            let actions = stub.actions(&ctx, frame);
            if !actions.is_empty() {
                let node = self.clone();
                let channel = channel.clone();
                let version = frame.version;
                let stream = frame.stream;
                tokio::spawn(async move {
                    run_actions(node, channel, version, stream, actions).await;
                });
            }
            return Outcome::None;
        }

        self.default_response(channel, frame)
    }

    /// The built-in minimal-viable database
    fn default_response(self: &Arc<Self>, channel: &Arc<ClientChannel>, frame: &Frame) -> Outcome {
        match &frame.message {
            Message::Startup(_) | Message::Register(_) => {
                let transition = {
                    let mut state = self.reject_state.lock();
                    if !state.listening {
                        // Refusing startups: keep the channel, drop the frame.
                        return Outcome::None;
                    }
                    if state.reject_after > 0 {
                        state.reject_after -= 1;
                        if state.reject_after == 0 {
                            state.reject_after = -1;
                            state.listening = false;
                            state.scope
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                };
                match transition {
                    Some(scope) => Outcome::ReplyThenTransition(Message::Ready, scope),
                    None => Outcome::Reply(Message::Ready),
                }
            }
            Message::Options => Outcome::Reply(supported_options()),
            Message::Query { query, .. } => match parse_use_keyspace(query) {
                Some(keyspace) => {
                    channel.set_keyspace(keyspace.clone());
                    Outcome::Reply(Message::SetKeyspace(keyspace))
                }
                None => Outcome::Reply(Message::Void),
            },
            Message::Execute { id, .. } => {
                Outcome::Reply(Message::Error(crate::protocol::CqlError::Unprepared {
                    message: format!("No prepared statement with id: {}", hex_id(id)),
                    id: id.clone(),
                }))
            }
            Message::Prepare { query } => {
                // Register an internal prime so the coming Executes get a
                // deterministic empty rowset instead of Unprepared.
                let prime = Prime::new(
                    RequestMatcher::Query(QueryMatcher::inferred(query)),
                    PrimeResult::no_rows(),
                )
                .for_cluster(self.cluster_id);
                let response = prime.to_prepared();
                self.stub_store.register_internal(prime);
                Outcome::Reply(response)
            }
            Message::Batch(_) => Outcome::Reply(Message::Void),
            // Response opcodes arriving from a client are ignored.
            _ => Outcome::None,
        }
    }

    fn query_log(&self, frame: &Frame, remote: SocketAddr, primed: bool) -> QueryLog {
        let (query, params) = match &frame.message {
            Message::Query { query, params } => (query.clone(), Some(params)),
            Message::Prepare { query } => (query.clone(), None),
            Message::Execute { id, params } => {
                (format!("EXECUTE {}", hex_id(id)), Some(params))
            }
            Message::Batch(batch) => (batch_log_text(batch), None),
            other => (other.kind_name().to_string(), None),
        };
        QueryLog {
            query,
            consistency: params.map(|p| p.consistency.as_str().to_string()),
            serial_consistency: params
                .and_then(|p| p.serial_consistency)
                .map(|cl| cl.as_str().to_string()),
            connection: remote.to_string(),
            timestamp: epoch_millis(),
            primed,
            data_center_id: self.data_center_id,
            node_id: self.id,
        }
    }
}

fn batch_log_text(batch: &Batch) -> String {
    match batch.queries.first() {
        Some(BatchQuery::Text(text, _)) => text.clone(),
        Some(BatchQuery::Id(id, _)) => format!("EXECUTE {}", hex_id(id)),
        None => "BATCH".to_string(),
    }
}

/// The Supported payload advertised to Options
fn supported_options() -> Message {
    let mut options = HashMap::new();
    options.insert(
        "PROTOCOL_VERSIONS".to_string(),
        vec!["3/v3".to_string(), "4/v4".to_string(), "5/v5-beta".to_string()],
    );
    options.insert("CQL_VERSION".to_string(), vec!["3.4.4".to_string()]);
    options.insert(
        "COMPRESSION".to_string(),
        vec!["snappy".to_string(), "lz4".to_string()],
    );
    Message::Supported(options)
}

/// `use <keyspace>` detection: leading whitespace allowed, case-insensitive
fn parse_use_keyspace(query: &str) -> Option<String> {
    let trimmed = query.trim_start();
    if trimmed.len() < 4 || !trimmed[..3].eq_ignore_ascii_case("use") {
        return None;
    }
    let rest = &trimmed[3..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let keyspace = rest.trim().trim_end_matches(';').trim();
    if keyspace.is_empty() {
        None
    } else {
        Some(keyspace.to_string())
    }
}

/// Execute a matched stub's action list, sequentially and in order
async fn run_actions(
    node: Arc<BoundNode>,
    channel: Arc<ClientChannel>,
    version: u8,
    stream: i16,
    actions: Vec<Action>,
) {
    for action in actions {
        if !action.delay.is_zero() {
            tokio::time::sleep(action.delay).await;
        }
        match action.kind {
            ActionKind::Respond(message) => {
                let frame = Frame {
                    version,
                    flags: 0,
                    stream,
                    message,
                };
                channel.write_frame(&frame).await;
            }
            ActionKind::NoResponse => {}
            ActionKind::Disconnect { scope, close_type } => {
                run_disconnect(&node, &channel, scope, close_type).await;
            }
        }
    }
}

async fn run_disconnect(
    node: &Arc<BoundNode>,
    channel: &Arc<ClientChannel>,
    scope: DisconnectScope,
    close_type: CloseType,
) {
    match scope {
        DisconnectScope::Connection => channel.close(close_type).await,
        DisconnectScope::Node => node.close_client_channels(close_type).await,
        DisconnectScope::DataCenter | DisconnectScope::Cluster => {
            let Some(cluster) = node.parent() else {
                return;
            };
            for sibling in cluster.nodes() {
                if scope == DisconnectScope::DataCenter
                    && sibling.data_center_id != node.data_center_id
                {
                    continue;
                }
                sibling.close_client_channels(close_type).await;
            }
        }
    }
}

async fn accept_loop(
    node: Arc<BoundNode>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(node = %node.label(), %remote, "accepted connection");
                        node.attach_channel(stream, remote);
                    }
                    Err(e) => {
                        warn!(node = %node.label(), error = %e, "accept failed");
                    }
                }
            }
        }
    }
    drop(listener);
    let _ = done_tx.send(true);
}

impl BoundNode {
    fn attach_channel(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let id = self.channel_ids.fetch_add(1, Ordering::Relaxed);
        let channel = spawn_connection(self.clone(), stream, remote, id);
        self.clients.lock().insert(id, channel);
    }
}
