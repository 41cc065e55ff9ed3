//! In-memory cluster implementing both transports, with fault injection.

use crate::error::{Result, TransportError};
use crate::partitioning::{segment_of, OwnershipSnapshot, OwnershipTable};
use crate::transport::{
    EndStatus, IterationBatch, IterationSession, IterationTransport, ListenerRegistration,
    ListenerTransport, StartIteration, Target,
};
use crate::types::{Address, Entry, EntryMetadata, IterationId, ListenerId, SegmentId, SegmentSet, TopologyId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Filter factory understood by the simulated servers: keeps keys starting
/// with the first parameter.
pub const PREFIX_FILTER: &str = "key-prefix";

#[derive(Debug, Clone)]
struct SimNode {
    alive: bool,
    segments: SegmentSet,
    /// Batches served before the node crashes.
    fail_after_batches: Option<usize>,
    batches_served: usize,
}

#[derive(Debug)]
struct SimSession {
    address: Address,
    batch_size: usize,
    /// Entries left per segment, `None` when the request had no segments.
    remaining: VecDeque<(Option<SegmentId>, VecDeque<Entry>)>,
}

/// Address of the `index`-th simulated node.
pub fn node_addr(index: u16) -> Address {
    Address::from(([127, 0, 0, 1], 11222 + index))
}

/// A set of simulated servers sharing one data set.
///
/// Every live node can serve every segment; ownership only decides where
/// the client sends requests. [`Target::Any`] picks the lowest live address
/// not excluded.
#[derive(Debug)]
pub struct SimulatedCluster {
    num_segments: u32,
    nodes: RwLock<BTreeMap<Address, SimNode>>,
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    sessions: Mutex<HashMap<IterationId, SimSession>>,
    next_session: AtomicU64,
    started: Mutex<Vec<(Address, StartIteration)>>,
    ended: AtomicUsize,
    listeners: Mutex<HashMap<Address, HashSet<ListenerId>>>,
    released: Mutex<Vec<ListenerId>>,
    registration_attempts: AtomicUsize,
    failing_registrations: AtomicUsize,
    reject_registrations: AtomicBool,
}

impl SimulatedCluster {
    /// A cluster with no nodes.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments,
            nodes: RwLock::new(BTreeMap::new()),
            data: RwLock::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            started: Mutex::new(Vec::new()),
            ended: AtomicUsize::new(0),
            listeners: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            registration_attempts: AtomicUsize::new(0),
            failing_registrations: AtomicUsize::new(0),
            reject_registrations: AtomicBool::new(false),
        }
    }

    /// A cluster of `count` nodes owning contiguous segment ranges.
    pub fn with_nodes(num_segments: u32, count: u16) -> Self {
        let cluster = Self::new(num_segments);
        for index in 0..count {
            let segments = (0..num_segments)
                .filter(|s| (*s as u64 * count as u64 / num_segments.max(1) as u64) as u16 == index)
                .collect();
            cluster.add_node(node_addr(index), segments);
        }
        cluster
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Add a live node owning `segments`.
    pub fn add_node(&self, addr: Address, segments: SegmentSet) {
        self.nodes.write().insert(
            addr,
            SimNode {
                alive: true,
                segments,
                fail_after_batches: None,
                batches_served: 0,
            },
        );
    }

    /// Crash a node. Requests to it fail with connection errors.
    pub fn kill_node(&self, addr: Address) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.alive = false;
        }
        self.listeners.lock().remove(&addr);
        tracing::debug!(%addr, "Simulated node killed");
    }

    /// Bring a crashed node back.
    pub fn revive_node(&self, addr: Address) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.alive = true;
            node.fail_after_batches = None;
        }
    }

    /// Crash the node once it has served `batches` more batches.
    pub fn fail_node_after(&self, addr: Address, batches: usize) {
        if let Some(node) = self.nodes.write().get_mut(&addr) {
            node.fail_after_batches = Some(node.batches_served + batches);
        }
    }

    pub fn is_alive(&self, addr: Address) -> bool {
        self.nodes.read().get(&addr).map(|n| n.alive).unwrap_or(false)
    }

    /// Ownership of the configured segments, live or not.
    pub fn snapshot(&self, topology_id: TopologyId) -> OwnershipSnapshot {
        let owners = self
            .nodes
            .read()
            .iter()
            .map(|(addr, node)| (*addr, node.segments.clone()))
            .collect();
        OwnershipSnapshot::new(topology_id, self.num_segments, owners)
    }

    /// Ownership restricted to live nodes; segments of dead nodes move to
    /// the lowest live address.
    pub fn live_snapshot(&self, topology_id: TopologyId) -> OwnershipSnapshot {
        let nodes = self.nodes.read();
        let mut owners: HashMap<Address, SegmentSet> = nodes
            .iter()
            .filter(|(_, n)| n.alive)
            .map(|(a, n)| (*a, n.segments.clone()))
            .collect();
        if let Some(heir) = nodes.iter().find(|(_, n)| n.alive).map(|(a, _)| *a) {
            for node in nodes.values().filter(|n| !n.alive) {
                owners.entry(heir).or_default().extend(&node.segments);
            }
        }
        OwnershipSnapshot::new(topology_id, self.num_segments, owners)
    }

    /// Ownership table for a client of this cluster.
    pub fn ownership(&self) -> OwnershipTable {
        OwnershipTable::new(self.snapshot(1))
    }

    /// Ownership table with no segment information.
    pub fn unpartitioned_ownership(&self) -> OwnershipTable {
        OwnershipTable::unpartitioned(1, self.nodes.read().keys().copied())
    }

    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Insert `count` entries `key-{i}` / `value-{i}`.
    pub fn populate(&self, count: usize) {
        let mut data = self.data.write();
        for i in 0..count {
            data.insert(
                Bytes::from(format!("key-{}", i)),
                Bytes::from(format!("value-{}", i)),
            );
        }
    }

    /// Insert `count` entries whose keys hash to `segment`. Returns the keys.
    pub fn populate_segment(&self, segment: SegmentId, count: usize) -> Vec<Bytes> {
        let keys: Vec<Bytes> = (0..count)
            .map(|i| super::key_in_segment(segment, self.num_segments, i))
            .collect();
        let mut data = self.data.write();
        for key in &keys {
            data.insert(key.clone(), Bytes::from(format!("value-{:?}", key)));
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Every start command received, with the node that accepted it.
    pub fn started(&self) -> Vec<(Address, StartIteration)> {
        self.started.lock().clone()
    }

    /// Sessions started but not ended.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Number of `end_iteration` calls that reached a live node.
    pub fn ended_sessions(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }

    /// The next `count` registrations fail with a connection error on the
    /// node they were sent to.
    pub fn fail_registrations(&self, count: usize) {
        self.failing_registrations.store(count, Ordering::SeqCst);
    }

    /// Every registration is rejected by the server.
    pub fn fail_registrations_permanently(&self) {
        self.reject_registrations.store(true, Ordering::SeqCst);
    }

    pub fn registration_attempts(&self) -> usize {
        self.registration_attempts.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self, addr: Address, listener_id: &ListenerId) -> bool {
        self.listeners
            .lock()
            .get(&addr)
            .map(|ids| ids.contains(listener_id))
            .unwrap_or(false)
    }

    /// Listener ids whose routing was released, in order.
    pub fn released_listeners(&self) -> Vec<ListenerId> {
        self.released.lock().clone()
    }

    fn resolve(&self, target: &Target) -> std::result::Result<Address, TransportError> {
        let nodes = self.nodes.read();
        match target {
            Target::Node(addr) => match nodes.get(addr) {
                Some(node) if node.alive => Ok(*addr),
                _ => Err(TransportError::ConnectionFailed {
                    addr: *addr,
                    reason: "connection refused".into(),
                }),
            },
            Target::Any { exclude } => nodes
                .iter()
                .find(|(addr, node)| node.alive && !exclude.contains(addr))
                .map(|(addr, _)| *addr)
                .ok_or(TransportError::NoServersAvailable),
        }
    }

    fn check_alive(&self, addr: Address) -> std::result::Result<(), TransportError> {
        if self.is_alive(addr) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed { addr })
        }
    }

    fn select_entries(&self, request: &StartIteration) -> VecDeque<(Option<SegmentId>, VecDeque<Entry>)> {
        let data = self.data.read();
        let prefix = request
            .filter
            .as_ref()
            .filter(|f| f.factory == PREFIX_FILTER)
            .and_then(|f| f.params.first().cloned());
        let to_entry = |(key, value): (&Bytes, &Bytes)| {
            let entry = Entry::new(key.clone(), value.clone());
            if request.with_metadata {
                entry.with_metadata(EntryMetadata {
                    version: 1,
                    ..Default::default()
                })
            } else {
                entry
            }
        };
        let keep = |key: &Bytes| prefix.as_ref().map(|p| key.starts_with(p)).unwrap_or(true);

        match &request.segments {
            None => {
                let entries = data.iter().filter(|(k, _)| keep(k)).map(to_entry).collect();
                VecDeque::from([(None, entries)])
            }
            Some(segments) => segments
                .iter()
                .map(|&segment| {
                    let entries = data
                        .iter()
                        .filter(|(k, _)| segment_of(k, self.num_segments) == segment && keep(k))
                        .map(to_entry)
                        .collect();
                    (Some(segment), entries)
                })
                .collect(),
        }
    }
}

#[async_trait]
impl IterationTransport for SimulatedCluster {
    async fn start_iteration(&self, request: &StartIteration, target: &Target) -> Result<IterationSession> {
        let address = self.resolve(target)?;
        let id = IterationId::new(Bytes::from(
            self.next_session.fetch_add(1, Ordering::SeqCst).to_be_bytes().to_vec(),
        ));
        let session = SimSession {
            address,
            batch_size: request.batch_size.max(1),
            remaining: self.select_entries(request),
        };
        self.sessions.lock().insert(id.clone(), session);
        self.started.lock().push((address, request.clone()));
        Ok(IterationSession { id, address })
    }

    async fn next_iteration(&self, session: &IterationSession) -> Result<IterationBatch> {
        tokio::task::yield_now().await;

        {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(&session.address)
                .ok_or(TransportError::InvalidSession {
                    addr: session.address,
                })?;
            if !node.alive {
                return Err(TransportError::ConnectionClosed {
                    addr: session.address,
                }
                .into());
            }
            if node.fail_after_batches == Some(node.batches_served) {
                node.alive = false;
                return Err(TransportError::ConnectionFailed {
                    addr: session.address,
                    reason: "node crashed".into(),
                }
                .into());
            }
            node.batches_served += 1;
        }

        let mut sessions = self.sessions.lock();
        let sim = sessions
            .get_mut(&session.id)
            .ok_or(TransportError::InvalidSession {
                addr: session.address,
            })?;

        let mut batch = IterationBatch::default();
        while let Some((segment, entries)) = sim.remaining.front_mut() {
            while batch.entries.len() < sim.batch_size {
                match entries.pop_front() {
                    Some(entry) => batch.entries.push(entry),
                    None => break,
                }
            }
            if !entries.is_empty() {
                break;
            }
            if let Some(segment) = segment {
                batch.completed_segments.insert(*segment);
            }
            sim.remaining.pop_front();
        }
        batch.has_more = !sim.remaining.is_empty();
        Ok(batch)
    }

    async fn end_iteration(&self, session: &IterationSession) -> Result<EndStatus> {
        self.check_alive(session.address)?;
        self.ended.fetch_add(1, Ordering::SeqCst);
        match self.sessions.lock().remove(&session.id) {
            Some(_) => Ok(EndStatus::Success),
            None => Ok(EndStatus::InvalidIteration),
        }
    }
}

#[async_trait]
impl ListenerTransport for SimulatedCluster {
    async fn register_listener(&self, registration: &ListenerRegistration, target: &Target) -> Result<Address> {
        self.registration_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_registrations.load(Ordering::SeqCst) {
            return Err(TransportError::Server("listener registration rejected".into()).into());
        }

        let addr = self.resolve(target)?;
        let fail = self
            .failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::ConnectionFailed {
                addr,
                reason: "registration failed".into(),
            }
            .into());
        }

        self.listeners
            .lock()
            .entry(addr)
            .or_default()
            .insert(registration.listener_id.clone());
        Ok(addr)
    }

    async fn unregister_listener(&self, listener_id: &ListenerId, addr: Address) -> Result<()> {
        self.check_alive(addr)?;
        if let Some(ids) = self.listeners.lock().get_mut(&addr) {
            ids.remove(listener_id);
        }
        Ok(())
    }

    fn release_listener(&self, _addr: Address, listener_id: &ListenerId) {
        self.released.lock().push(listener_id.clone());
    }
}
