//! The query engine: owns the datagram endpoint, the routing table, and the
//! pending-query table; exposes bootstrap, the two iterative lookups, and
//! the passive observer loop.

use crate::bencode::Value;
use crate::identity::{distance, Id};
use crate::message::{self, Message, Method, Tag};
use crate::routing::{Peer, RoutingTable};
use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_DATAGRAM: usize = 2048;
const READER_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const WORKER_COUNT: usize = 4;
const INBOUND_QUEUE_DEPTH: usize = 1024;

const NODE_LOOKUP_ROUNDS: usize = 3;
const NODE_LOOKUP_PER_ROUND: usize = 3;
const NODE_LOOKUP_PAUSE: Duration = Duration::from_millis(500);

const PEER_LOOKUP_SEED: usize = 16;
const PEER_LOOKUP_BATCH: usize = 5;
const PEER_LOOKUP_PAUSE: Duration = Duration::from_millis(300);

const BOOTSTRAP_WINDOW: Duration = Duration::from_secs(2);

const OBSERVER_WAKE: Duration = Duration::from_secs(1);
const OBSERVER_SAMPLE_EVERY: u64 = 10;
const OBSERVER_SWEEP_EVERY: u64 = 30;
const OBSERVER_SAMPLE_COUNT: usize = 5;

/// Placeholder write-token: no announces are ever honored, so the value
/// need only be present, not cryptographically meaningful.
const PLACEHOLDER_TOKEN: &[u8] = b"aoeusnth";

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Constructor parameters for a [`DhtEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub k: usize,
    pub query_timeout: Duration,
    pub passive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            k: crate::routing::DEFAULT_K,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            passive: false,
        }
    }
}

/// An entry in the observed-identifier log (passive mode only). Monotonic:
/// never removed while the observer runs.
#[derive(Debug, Clone)]
pub struct Observation {
    pub first_seen: Instant,
    pub probe_count: u64,
    pub sources: HashSet<Ipv4Addr>,
}

struct Pending {
    #[allow(dead_code)] // kept for observability/debugging, not branched on
    kind: Method,
    reply: Sender<(Message, SocketAddr)>,
    issued_at: Instant,
}

struct Inner {
    local_id: Id,
    socket: UdpSocket,
    routing: Mutex<RoutingTable>,
    pending: Mutex<HashMap<u16, Pending>>,
    observed: Mutex<HashMap<Id, Observation>>,
    counter: AtomicU16,
    stop: AtomicBool,
    query_timeout: Duration,
    passive: bool,
}

/// The running DHT participant: socket, routing table and pending table,
/// plus the reader/worker threads that drive them.
pub struct DhtEngine {
    inner: Arc<Inner>,
    reader: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl DhtEngine {
    /// Binds a UDP socket on `port` (0 = ephemeral) and starts the reader
    /// and worker threads. The routing table starts empty; call
    /// [`DhtEngine::bootstrap`] to populate it.
    pub fn new(config: EngineConfig, port: u16) -> anyhow::Result<DhtEngine> {
        let mut socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .with_context(|| format!("failed to bind udp socket on port {port}"))?;
        let mut poll = Poll::new().context("failed to create mio poll")?;
        poll.registry()
            .register(&mut socket, Token(0), Interest::READABLE)
            .context("failed to register udp socket with poll")?;

        let local_id = Id::random();
        log::info!("engine starting, local id {local_id}");

        let inner = Arc::new(Inner {
            local_id,
            socket,
            routing: Mutex::new(RoutingTable::new(local_id, config.k)),
            pending: Mutex::new(HashMap::new()),
            observed: Mutex::new(HashMap::new()),
            counter: AtomicU16::new(0),
            stop: AtomicBool::new(false),
            query_timeout: config.query_timeout,
            passive: config.passive,
        });

        let (work_tx, work_rx) = channel::bounded::<(Vec<u8>, SocketAddr)>(INBOUND_QUEUE_DEPTH);

        let reader = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || reader_loop(inner, poll, work_tx))
        };

        let workers = (0..WORKER_COUNT)
            .map(|_| {
                let inner = Arc::clone(&inner);
                let rx = work_rx.clone();
                thread::spawn(move || worker_loop(inner, rx))
            })
            .collect();

        Ok(DhtEngine { inner, reader: Some(reader), workers })
    }

    pub fn local_id(&self) -> Id {
        self.inner.local_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn routing_snapshot(&self) -> Vec<Peer> {
        self.inner.routing.lock().unwrap().snapshot()
    }

    pub fn routing_len(&self) -> usize {
        self.inner.routing.lock().unwrap().len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    pub fn observed_snapshot(&self) -> HashMap<Id, Observation> {
        self.inner.observed.lock().unwrap().clone()
    }

    /// Directly seeds a descriptor into the routing table, e.g. to manually
    /// prime an engine with a known-good peer outside of bootstrap/lookup.
    pub fn insert_peer(&self, peer: Peer) -> Result<bool, crate::routing::RoutingError> {
        self.inner.routing.lock().unwrap().insert(peer)
    }

    /// Signals every loop owned by this engine to stop at its next check.
    /// Does not block; call `drop` (or let the engine go out of scope) to
    /// join the reader/worker threads.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    fn next_tag(&self) -> (u16, Tag) {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        (n, n.to_be_bytes().to_vec())
    }

    /// Registers a pending correlation and sends the query. Send failures
    /// are logged and swallowed: a lookup never fails because one send did.
    fn register_and_send(
        &self,
        kind: Method,
        addr: SocketAddr,
        tag_u16: u16,
        payload: Vec<u8>,
        reply: Sender<(Message, SocketAddr)>,
    ) {
        {
            let mut table = self.inner.pending.lock().unwrap();
            table.insert(tag_u16, Pending { kind, reply, issued_at: Instant::now() });
        }
        if let Err(e) = self.inner.socket.send_to(&payload, addr) {
            log::debug!("send to {addr} failed: {e}");
            self.inner.pending.lock().unwrap().remove(&tag_u16);
        }
    }

    /// Removes pending entries older than the configured timeout. Their
    /// continuations are simply dropped, never invoked.
    fn reap_timeouts(&self) {
        let timeout = self.inner.query_timeout;
        let now = Instant::now();
        self.inner
            .pending
            .lock()
            .unwrap()
            .retain(|_, p| now.duration_since(p.issued_at) <= timeout);
    }

    /// Resolves each bootstrap host, sends it a `find_node(local_id)`, and
    /// folds any returned nodes into the routing table. Succeeds if at
    /// least one host responds within the bootstrap window.
    pub fn bootstrap(&self, hosts: &[String]) -> anyhow::Result<usize> {
        let (tx, rx) = channel::unbounded();
        let mut sent = 0usize;

        for host in hosts {
            match host.as_str().to_socket_addrs() {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        let (tag_u16, tag) = self.next_tag();
                        let payload = message::create_find_node(&tag, &self.inner.local_id, &self.inner.local_id);
                        self.register_and_send(Method::FindNode, addr, tag_u16, payload, tx.clone());
                        sent += 1;
                    }
                }
                Err(e) => log::warn!("bootstrap: failed to resolve {host}: {e}"),
            }
        }

        let deadline = Instant::now() + BOOTSTRAP_WINDOW;
        let mut responses = 0usize;
        while let Ok((msg, addr)) = rx.recv_deadline(deadline) {
            if let Message::Response { r, .. } = msg {
                responses += 1;
                fold_nodes_into(&self.inner, &r);
                log::debug!("bootstrap: response from {addr}");
            }
        }
        self.reap_timeouts();

        if sent > 0 && responses == 0 {
            anyhow::bail!("bootstrap failed: no responses from {sent} host(s) within {BOOTSTRAP_WINDOW:?}");
        }
        Ok(responses)
    }

    /// Iterative node lookup (spec.md section 4.5): returns up to `count`
    /// descriptors closest to `target`. Stops early, returning whatever was
    /// found so far, once [`DhtEngine::stop`] is called.
    pub fn find_node(&self, target: Id, count: usize) -> Vec<Peer> {
        let seed_count = (count * 2).max(1);
        let seed = self
            .inner
            .routing
            .lock()
            .unwrap()
            .closest(&target, seed_count)
            .unwrap_or_default();

        let mut found: HashMap<Id, Peer> = seed.into_iter().map(|p| (p.id, p)).collect();
        let mut queried: HashSet<Id> = HashSet::new();

        for _ in 0..NODE_LOOKUP_ROUNDS {
            if self.inner.stop.load(Ordering::SeqCst) {
                break;
            }
            let mut candidates: Vec<Peer> = found.values().copied().collect();
            candidates.sort_by_key(|p| distance(&p.id, &target));
            let to_query: Vec<Peer> = candidates
                .into_iter()
                .filter(|p| !queried.contains(&p.id))
                .take(NODE_LOOKUP_PER_ROUND)
                .collect();

            if to_query.is_empty() {
                break;
            }

            let (tx, rx) = channel::unbounded();
            for peer in &to_query {
                queried.insert(peer.id);
                let (tag_u16, tag) = self.next_tag();
                let payload = message::create_find_node(&tag, &self.inner.local_id, &target);
                self.register_and_send(Method::FindNode, peer.socket_addr(), tag_u16, payload, tx.clone());
            }
            drop(tx);

            let deadline = Instant::now() + NODE_LOOKUP_PAUSE;
            while let Ok((msg, _addr)) = rx.recv_deadline(deadline) {
                if let Message::Response { r, .. } = msg {
                    for node in nodes_from(&r) {
                        if node.id != self.inner.local_id {
                            found.entry(node.id).or_insert(node);
                            let _ = self.inner.routing.lock().unwrap().insert(node);
                        }
                    }
                }
            }
            self.reap_timeouts();
        }

        let mut result: Vec<Peer> = found.into_values().collect();
        result.sort_by_key(|p| distance(&p.id, &target));
        result.truncate(count);
        result
    }

    /// Iterative peer lookup (spec.md section 4.5): searches for peers
    /// announcing `info_hash`, returning whatever was found by `deadline`.
    /// Stops early, returning whatever was found so far, once
    /// [`DhtEngine::stop`] is called.
    pub fn get_peers(&self, info_hash: Id, deadline: Duration) -> HashSet<SocketAddrV4> {
        let start = Instant::now();
        let seed = self
            .inner
            .routing
            .lock()
            .unwrap()
            .closest(&info_hash, PEER_LOOKUP_SEED)
            .unwrap_or_default();

        let mut queue: VecDeque<Peer> = seed.into();
        let mut queried: HashSet<Id> = HashSet::new();
        let mut peers: HashSet<SocketAddrV4> = HashSet::new();

        while !queue.is_empty() && start.elapsed() < deadline && !self.inner.stop.load(Ordering::SeqCst) {
            let mut batch = Vec::with_capacity(PEER_LOOKUP_BATCH);
            while batch.len() < PEER_LOOKUP_BATCH {
                match queue.pop_front() {
                    Some(p) if !queried.contains(&p.id) => batch.push(p),
                    Some(_) => continue,
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let (tx, rx) = channel::unbounded();
            for peer in &batch {
                queried.insert(peer.id);
                let (tag_u16, tag) = self.next_tag();
                let payload = message::create_get_peers(&tag, &self.inner.local_id, &info_hash);
                self.register_and_send(Method::GetPeers, peer.socket_addr(), tag_u16, payload, tx.clone());
            }
            drop(tx);

            let round_deadline = (Instant::now() + PEER_LOOKUP_PAUSE).min(start + deadline);
            while let Ok((msg, _addr)) = rx.recv_deadline(round_deadline) {
                if let Message::Response { r, .. } = msg {
                    for value in values_from(&r) {
                        peers.insert(value);
                    }
                    for node in nodes_from(&r) {
                        if !queried.contains(&node.id) && node.id != self.inner.local_id {
                            let _ = self.inner.routing.lock().unwrap().insert(node);
                            queue.push_back(node);
                        }
                    }
                }
            }
            self.reap_timeouts();
        }

        peers
    }

    /// Runs the passive observer: periodically probes random known peers
    /// to stay visible, sweeping the pending table every 30s. Returns when
    /// `duration` elapses (0 = run until [`DhtEngine::stop`] is called) or
    /// the engine is stopped.
    pub fn run_passive(&self, duration: Duration) {
        let start = Instant::now();
        let mut tick: u64 = 0;

        loop {
            if self.inner.stop.load(Ordering::SeqCst) {
                break;
            }
            if !duration.is_zero() && start.elapsed() >= duration {
                break;
            }

            if tick % OBSERVER_SAMPLE_EVERY == 0 {
                let sample = self.inner.routing.lock().unwrap().sample(OBSERVER_SAMPLE_COUNT);
                for peer in sample {
                    let target = Id::random();
                    let (tag_u16, tag) = self.next_tag();
                    let payload = message::create_find_node(&tag, &self.inner.local_id, &target);
                    // Fire-and-forget: nobody is waiting on this reply, the
                    // periodic sweep below reaps it once it times out.
                    let (tx, _rx) = channel::unbounded();
                    self.register_and_send(Method::FindNode, peer.socket_addr(), tag_u16, payload, tx);
                }
            }

            if tick % OBSERVER_SWEEP_EVERY == 0 {
                self.reap_timeouts();
            }

            tick = tick.wrapping_add(1);
            thread::sleep(OBSERVER_WAKE);
        }
    }
}

impl Drop for DhtEngine {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn nodes_from(r: &BTreeMap<Vec<u8>, Value>) -> Vec<Peer> {
    r.get(b"nodes".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| message::unpack_nodes(b).ok())
        .unwrap_or_default()
}

fn values_from(r: &BTreeMap<Vec<u8>, Value>) -> Vec<SocketAddrV4> {
    r.get(b"values".as_slice())
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_bytes())
                .filter_map(message::unpack_value)
                .collect()
        })
        .unwrap_or_default()
}

fn fold_nodes_into(inner: &Inner, r: &BTreeMap<Vec<u8>, Value>) {
    for node in nodes_from(r) {
        if node.id != inner.local_id {
            let _ = inner.routing.lock().unwrap().insert(node);
        }
    }
}

fn tag_to_u16(t: &Tag) -> Option<u16> {
    if t.len() == 2 {
        Some(u16::from_be_bytes([t[0], t[1]]))
    } else {
        None
    }
}

fn reader_loop(inner: Arc<Inner>, mut poll: Poll, work_tx: Sender<(Vec<u8>, SocketAddr)>) {
    let mut events = Events::with_capacity(128);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        match poll.poll(&mut events, Some(READER_POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("dht reader: poll error: {e}");
                break;
            }
        }

        for event in events.iter() {
            if event.token() == Token(0) && event.is_readable() {
                loop {
                    match inner.socket.recv_from(&mut buf) {
                        Ok((len, addr)) => {
                            if work_tx.try_send((buf[..len].to_vec(), addr)).is_err() {
                                log::debug!("dht reader: inbound queue full, dropping datagram from {addr}");
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::debug!("dht reader: recv error: {e}");
                            break;
                        }
                    }
                }
            }
        }
    }
    // `work_tx` is dropped here, which unblocks every worker's `rx.recv()`.
}

fn worker_loop(inner: Arc<Inner>, rx: Receiver<(Vec<u8>, SocketAddr)>) {
    while let Ok((data, addr)) = rx.recv() {
        handle_datagram(&inner, &data, addr);
    }
}

fn handle_datagram(inner: &Arc<Inner>, data: &[u8], addr: SocketAddr) {
    let msg = match message::parse(data) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("dropping malformed datagram from {addr}: {e}");
            return;
        }
    };

    observe_sender(inner, &msg, addr);

    match msg {
        Message::Query { t, q, a } => handle_query(inner, &t, q, &a, addr),
        Message::Response { t, r } => {
            if let Some(tag) = tag_to_u16(&t) {
                let pending = inner.pending.lock().unwrap().remove(&tag);
                if let Some(p) = pending {
                    let _ = p.reply.send((Message::Response { t, r }, addr));
                }
            }
        }
        Message::Error { code, reason, .. } => {
            log::debug!("received error {code} from {addr}: {}", String::from_utf8_lossy(&reason));
        }
    }
}

/// Any message carries the sender's id; use it to keep the routing table
/// warm regardless of whether the message is a query or a response.
fn observe_sender(inner: &Arc<Inner>, msg: &Message, addr: SocketAddr) {
    let SocketAddr::V4(v4) = addr else { return };
    let sender_id = match msg {
        Message::Query { a, .. } => message::extract_id(a),
        Message::Response { r, .. } => message::extract_id(r),
        Message::Error { .. } => None,
    };
    if let Some(id) = sender_id {
        if id != inner.local_id {
            if let Ok(peer) = Peer::new(id, *v4.ip(), v4.port()) {
                let _ = inner.routing.lock().unwrap().insert(peer);
            }
        }
    }
}

fn handle_query(inner: &Arc<Inner>, t: &Tag, q: Method, a: &BTreeMap<Vec<u8>, Value>, addr: SocketAddr) {
    match q {
        Method::Ping => {
            let payload = message::create_ping_response(t, &inner.local_id);
            if let Err(e) = inner.socket.send_to(&payload, addr) {
                log::debug!("ping response send to {addr} failed: {e}");
            }
        }
        Method::FindNode => {
            let Some(target) = a
                .get(b"target".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| Id::try_from(b).ok())
            else {
                return;
            };
            let closest = inner.routing.lock().unwrap().closest(&target, 8).unwrap_or_default();
            let payload = message::create_find_node_response(t, &inner.local_id, &closest);
            if let Err(e) = inner.socket.send_to(&payload, addr) {
                log::debug!("find_node response send to {addr} failed: {e}");
            }
        }
        Method::GetPeers => {
            let Some(info_hash) = a
                .get(b"info_hash".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| Id::try_from(b).ok())
            else {
                return;
            };
            let closest = inner.routing.lock().unwrap().closest(&inner.local_id, 8).unwrap_or_default();
            let payload = message::create_get_peers_response(t, &inner.local_id, PLACEHOLDER_TOKEN, &closest);
            if let Err(e) = inner.socket.send_to(&payload, addr) {
                log::debug!("get_peers response send to {addr} failed: {e}");
            }

            if inner.passive {
                record_observation(inner, info_hash, addr);
            }
        }
    }
}

fn record_observation(inner: &Arc<Inner>, info_hash: Id, addr: SocketAddr) {
    let SocketAddr::V4(v4) = addr else { return };
    let mut observed = inner.observed.lock().unwrap();
    let entry = observed.entry(info_hash).or_insert_with(|| Observation {
        first_seen: Instant::now(),
        probe_count: 0,
        sources: HashSet::new(),
    });
    entry.probe_count += 1;
    entry.sources.insert(*v4.ip());
}
