//! End-to-end scenarios: a client engine and a server engine joined by
//! in-memory carrier shuttling, with no sockets or timers. Timer firings
//! are simulated by calling the corresponding engine events, which is
//! exactly what the network harness does.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use chopstream::chop::{Action, ConnId, Engine};
use chopstream::crypto::Side;
use chopstream::error::Result;
use chopstream::steg::{self, RecvStatus, Steg, StegHints};
use chopstream::Config;

/// A pass-through steg whose transmit room is an externally controlled
/// meter, zeroed by every transmission. Lets tests dole out room one
/// block at a time.
struct MeteredSteg {
    room: Arc<AtomicUsize>,
}

impl Steg for MeteredSteg {
    fn name(&self) -> &'static str {
        "metered"
    }

    fn transmit_room(&self) -> usize {
        self.room.load(Ordering::Relaxed)
    }

    fn transmit(&mut self, block: &[u8], out: &mut BytesMut, _hints: &mut StegHints) -> Result<()> {
        out.extend_from_slice(block);
        self.room.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn receive(
        &mut self,
        inbound: &mut BytesMut,
        extracted: &mut BytesMut,
        _hints: &mut StegHints,
    ) -> Result<RecvStatus> {
        extracted.extend_from_slice(inbound);
        inbound.clear();
        Ok(RecvStatus::Good)
    }
}

fn metered(room: usize) -> (Box<dyn Steg>, Arc<AtomicUsize>) {
    let meter = Arc::new(AtomicUsize::new(room));
    (
        Box::new(MeteredSteg {
            room: Arc::clone(&meter),
        }),
        meter,
    )
}

fn nosteg(side: Side) -> Box<dyn Steg> {
    steg::create("nosteg", side).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideId {
    Client,
    Server,
}

impl SideId {
    fn peer(self) -> SideId {
        match self {
            SideId::Client => SideId::Server,
            SideId::Server => SideId::Client,
        }
    }
}

#[derive(Default)]
struct SideState {
    /// Bytes the engine delivered to this side's upstream.
    up_out: Vec<u8>,
    /// The engine closed the upstream write half (peer FIN delivered).
    up_write_closed: bool,
    /// The engine released the upstream entirely (circuit destroyed).
    up_closed: bool,
    /// Currently armed flush timer, if any.
    flush_armed: Option<u32>,
    /// Currently armed axe timer, if any.
    axe_armed: Option<u32>,
    /// Connections with an armed must-send timer.
    must_send_armed: Vec<ConnId>,
    /// Circuits that asked for their downstreams to be (re)dialed.
    open_requests: Vec<u32>,
    /// Every downstream write this side emitted: (conn, byte length).
    writes_log: Vec<(ConnId, usize)>,
}

/// Two engines and the plumbing between them.
struct Loopback {
    client: Engine,
    server: Engine,
    client_state: SideState,
    server_state: SideState,
    c2s: HashMap<ConnId, ConnId>,
    s2c: HashMap<ConnId, ConnId>,
    queue: VecDeque<(SideId, Action)>,
    /// When false, carrier writes are parked in `captured` instead of
    /// being delivered, so tests can reorder or corrupt them.
    auto_deliver: bool,
    /// Parked carriers: (receiving side, receiving conn, bytes).
    captured: Vec<(SideId, ConnId, Bytes)>,
}

impl Loopback {
    fn new(n_down: usize) -> Self {
        let mut client_args = vec!["client".to_owned(), "127.0.0.1:5000".to_owned()];
        let mut server_args = vec!["server".to_owned(), "127.0.0.1:9005".to_owned()];
        for i in 0..n_down {
            let addr = format!("127.0.0.1:{}", 11253 + i);
            client_args.extend([addr.clone(), "nosteg".to_owned()]);
            server_args.extend([addr, "nosteg".to_owned()]);
        }
        Self {
            client: Engine::new(Config::from_args(&client_args).unwrap()),
            server: Engine::new(Config::from_args(&server_args).unwrap()),
            client_state: SideState::default(),
            server_state: SideState::default(),
            c2s: HashMap::new(),
            s2c: HashMap::new(),
            queue: VecDeque::new(),
            auto_deliver: true,
            captured: Vec::new(),
        }
    }

    fn manual(mut self) -> Self {
        self.auto_deliver = false;
        self
    }

    fn start_circuit(&mut self) -> u32 {
        let (cid, actions) = self.client.create_client_circuit().unwrap();
        self.dispatch(SideId::Client, actions);
        self.pump();
        cid
    }

    /// Create one linked downstream pair and let the client handshake.
    fn connect(
        &mut self,
        circuit: u32,
        client_steg: Box<dyn Steg>,
        server_steg: Box<dyn Steg>,
    ) -> (ConnId, ConnId) {
        let (s_conn, s_actions) = self.server.downstream_connected(server_steg, None);
        let (c_conn, c_actions) = self.client.downstream_connected(client_steg, Some(circuit));
        self.c2s.insert(c_conn, s_conn);
        self.s2c.insert(s_conn, c_conn);
        self.dispatch(SideId::Server, s_actions);
        self.dispatch(SideId::Client, c_actions);
        self.pump();
        (c_conn, s_conn)
    }

    fn client_up(&mut self, circuit: u32, data: &[u8]) {
        let actions = self.client.upstream_data(circuit, data);
        self.dispatch(SideId::Client, actions);
        self.pump();
    }

    fn client_up_eof(&mut self, circuit: u32) {
        let actions = self.client.upstream_eof(circuit);
        self.dispatch(SideId::Client, actions);
        self.pump();
    }

    fn server_up_eof(&mut self, circuit: u32) {
        let actions = self.server.upstream_eof(circuit);
        self.dispatch(SideId::Server, actions);
        self.pump();
    }

    fn fire_client_flush(&mut self, circuit: u32) {
        let actions = self.client.flush_timeout(circuit);
        self.dispatch(SideId::Client, actions);
        self.pump();
    }

    fn fire_server_must_send(&mut self, conn: ConnId) {
        let actions = self.server.must_send_timeout(conn);
        self.dispatch(SideId::Server, actions);
        self.pump();
    }

    /// Deliver parked carriers by index order, e.g. `[2, 0, 3, 1]`.
    fn deliver_captured(&mut self, order: &[usize]) {
        let parked = std::mem::take(&mut self.captured);
        for &i in order {
            let (to, conn, data) = &parked[i];
            let actions = match to {
                SideId::Client => self.client.downstream_data(*conn, data),
                SideId::Server => self.server.downstream_data(*conn, data),
            };
            self.dispatch(*to, actions);
            self.pump();
        }
    }

    fn deliver_all_captured(&mut self) {
        let order: Vec<usize> = (0..self.captured.len()).collect();
        self.deliver_captured(&order);
    }

    fn dispatch(&mut self, side: SideId, actions: Vec<Action>) {
        for a in actions {
            self.queue.push_back((side, a));
        }
    }

    fn pump(&mut self) {
        while let Some((side, action)) = self.queue.pop_front() {
            self.apply(side, action);
        }
    }

    fn state_mut(&mut self, side: SideId) -> &mut SideState {
        match side {
            SideId::Client => &mut self.client_state,
            SideId::Server => &mut self.server_state,
        }
    }

    fn peer_conn(&self, side: SideId, conn: ConnId) -> Option<ConnId> {
        match side {
            SideId::Client => self.c2s.get(&conn).copied(),
            SideId::Server => self.s2c.get(&conn).copied(),
        }
    }

    fn apply(&mut self, side: SideId, action: Action) {
        match action {
            Action::DownstreamWrite { conn, data } => {
                self.state_mut(side).writes_log.push((conn, data.len()));
                let Some(peer) = self.peer_conn(side, conn) else {
                    return; // unlinked connection; carrier evaporates
                };
                if self.auto_deliver {
                    let actions = match side.peer() {
                        SideId::Client => self.client.downstream_data(peer, &data),
                        SideId::Server => self.server.downstream_data(peer, &data),
                    };
                    self.dispatch(side.peer(), actions);
                } else {
                    self.captured.push((side.peer(), peer, data));
                }
            }
            Action::DownstreamShutdownWrite { conn } => {
                if let Some(peer) = self.peer_conn(side, conn) {
                    let actions = match side.peer() {
                        SideId::Client => self.client.downstream_eof(peer),
                        SideId::Server => self.server.downstream_eof(peer),
                    };
                    self.dispatch(side.peer(), actions);
                }
            }
            Action::DownstreamClose { conn } => {
                if let Some(peer) = self.peer_conn(side, conn) {
                    let actions = match side.peer() {
                        SideId::Client => self.client.downstream_eof(peer),
                        SideId::Server => self.server.downstream_eof(peer),
                    };
                    self.dispatch(side.peer(), actions);
                }
                match side {
                    SideId::Client => {
                        if let Some(peer) = self.c2s.remove(&conn) {
                            self.s2c.remove(&peer);
                        }
                    }
                    SideId::Server => {
                        if let Some(peer) = self.s2c.remove(&conn) {
                            self.c2s.remove(&peer);
                        }
                    }
                }
            }
            Action::UpstreamWrite { data, .. } => {
                self.state_mut(side).up_out.extend_from_slice(&data);
            }
            Action::UpstreamShutdownWrite { .. } => {
                self.state_mut(side).up_write_closed = true;
            }
            Action::UpstreamClose { .. } => {
                self.state_mut(side).up_closed = true;
            }
            Action::OpenDownstreams { circuit } => {
                self.state_mut(side).open_requests.push(circuit);
            }
            Action::OpenUpstream { .. } => {}
            Action::ArmFlushTimer { circuit, .. } => {
                self.state_mut(side).flush_armed = Some(circuit);
            }
            Action::DisarmFlushTimer { .. } => {
                self.state_mut(side).flush_armed = None;
            }
            Action::ArmAxeTimer { circuit, .. } => {
                self.state_mut(side).axe_armed = Some(circuit);
            }
            Action::DisarmAxeTimer { .. } => {
                self.state_mut(side).axe_armed = None;
            }
            Action::ArmMustSendTimer { conn, .. } => {
                let state = self.state_mut(side);
                if !state.must_send_armed.contains(&conn) {
                    state.must_send_armed.push(conn);
                }
            }
            Action::DisarmMustSendTimer { conn } => {
                self.state_mut(side).must_send_armed.retain(|&c| c != conn);
            }
        }
    }
}

#[test]
fn test_single_downstream_pass_through() {
    let mut lb = Loopback::new(1);
    let cid = lb.start_circuit();
    lb.connect(cid, nosteg(Side::Client), nosteg(Side::Server));

    lb.client_up(cid, b"hello, world!");
    lb.client_up_eof(cid);

    assert_eq!(lb.server_state.up_out, b"hello, world!");
    assert!(lb.server_state.up_write_closed);

    // The protected service answers with EOF; the server FINs back and
    // both circuits run to completion.
    lb.server_up_eof(cid);

    assert!(lb.client_state.up_write_closed);
    assert_eq!(lb.client.circuit_count(), 0);
    assert_eq!(lb.server.circuit_count(), 0);
    assert_eq!(lb.client.conn_count(), 0);
    assert_eq!(lb.server.conn_count(), 0);
    // Teardown cancelled the server's idle timer along the way.
    assert!(lb.server_state.axe_armed.is_none());
}

#[test]
fn test_round_trip_chunked_writes() {
    let mut lb = Loopback::new(1);
    let cid = lb.start_circuit();
    lb.connect(cid, nosteg(Side::Client), nosteg(Side::Server));

    let payload: Vec<u8> = (0..65_536u32).map(|i| (i % 251) as u8).collect();
    // A legal but awkward splitting of the stream into writes.
    let mut off = 0;
    let mut step = 1;
    while off < payload.len() {
        let end = (off + step).min(payload.len());
        lb.client_up(cid, &payload[off..end]);
        off = end;
        step = (step * 3 + 7) % 4093 + 1;
    }
    lb.client_up_eof(cid);
    lb.server_up_eof(cid);

    assert_eq!(lb.server_state.up_out, payload);
    assert!(lb.server_state.up_write_closed);
    assert_eq!(lb.client.circuit_count(), 0);
    assert_eq!(lb.server.circuit_count(), 0);
}

#[test]
fn test_two_downstreams_interleaved_delivery() {
    let mut lb = Loopback::new(2);
    let cid = lb.start_circuit();
    let (a_steg, a_room) = metered(5000);
    let (b_steg, b_room) = metered(5000);
    lb.connect(cid, a_steg, nosteg(Side::Server));
    lb.connect(cid, b_steg, nosteg(Side::Server));

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();

    // Feed in chunks; each pass hands one block to each downstream,
    // whichever order the scheduler prefers.
    for chunk in payload.chunks(10_000) {
        a_room.store(5000, Ordering::Relaxed);
        b_room.store(5000, Ordering::Relaxed);
        lb.client_up(cid, chunk);
    }
    let mut rounds = 0;
    while lb.server_state.up_out.len() < payload.len() {
        assert!(lb.client_state.flush_armed.is_some());
        a_room.store(5000, Ordering::Relaxed);
        b_room.store(5000, Ordering::Relaxed);
        lb.fire_client_flush(cid);
        rounds += 1;
        assert!(rounds < 100, "transfer did not converge");
    }

    assert_eq!(lb.server_state.up_out, payload);
    // Both connections actually carried traffic.
    let conns: std::collections::HashSet<ConnId> = lb
        .client_state
        .writes_log
        .iter()
        .map(|&(conn, _)| conn)
        .collect();
    assert_eq!(conns.len(), 2);
}

#[test]
fn test_reordered_blocks_deliver_in_sequence() {
    let mut lb = Loopback::new(4).manual();
    let cid = lb.start_circuit();

    let payload: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 256) as u8).collect();
    lb.client_up(cid, &payload);

    // Four one-block connections: each handshake send chops off one
    // 2048-byte data section.
    for _ in 0..4 {
        let (steg, _) = metered(2048 + 32);
        lb.connect(cid, steg, nosteg(Side::Server));
    }
    assert_eq!(lb.captured.len(), 4);

    // The network delivers them badly out of order.
    lb.deliver_captured(&[2, 0, 3, 1]);

    assert_eq!(lb.server_state.up_out, payload);
    assert_eq!(lb.server.circuit_count(), 1);
}

#[test]
fn test_tampered_block_tears_circuit_down() {
    let mut lb = Loopback::new(1).manual();
    let cid = lb.start_circuit();
    lb.connect(cid, nosteg(Side::Client), nosteg(Side::Server));
    // Deliver the handshake chaff so the server binds the circuit.
    lb.deliver_all_captured();

    lb.client_up(cid, b"block zero data");
    lb.deliver_all_captured();
    assert_eq!(lb.server_state.up_out, b"block zero data");

    lb.client_up(cid, b"this one gets mangled");
    assert_eq!(lb.captured.len(), 1);
    // Flip one bit in the sealed body (past the header) so the header
    // still parses and GCM verification is what fails.
    let (to, conn, data) = lb.captured.remove(0);
    let mut mangled = data.to_vec();
    let last = mangled.len() - 1;
    mangled[last] ^= 0x01;
    lb.captured.push((to, conn, Bytes::from(mangled)));
    lb.deliver_all_captured();

    // No RST can be authenticated for a forged block: the server just
    // drops the connection and the circuit, and the upstream sees clean
    // EOF after block zero's bytes.
    assert_eq!(lb.server_state.up_out, b"block zero data");
    assert!(lb.server_state.up_closed);
    assert_eq!(lb.server.circuit_count(), 0);
    assert_eq!(lb.server.conn_count(), 0);
    // ...and the server never transmitted anything downstream.
    assert!(lb.server_state.writes_log.is_empty());
}

#[test]
fn test_replayed_carrier_draws_rst() {
    let mut lb = Loopback::new(1).manual();
    let cid = lb.start_circuit();
    lb.connect(cid, nosteg(Side::Client), nosteg(Side::Server));
    lb.deliver_all_captured();

    lb.client_up(cid, b"once only");
    assert_eq!(lb.captured.len(), 1);
    let replay = lb.captured[0].clone();
    lb.deliver_all_captured();
    assert_eq!(lb.server_state.up_out, b"once only");

    // An attacker replays the recorded carrier. Its sequence number now
    // falls outside the receive window, so the server RSTs and destroys
    // the circuit.
    lb.captured.push(replay);
    lb.deliver_all_captured();
    assert_eq!(lb.server.circuit_count(), 0);

    // The RST block itself was parked; let it travel.
    lb.deliver_all_captured();
    // The RST reached the client and killed its circuit too.
    assert_eq!(lb.client.circuit_count(), 0);
    // Nothing past the original bytes leaked upstream.
    assert_eq!(lb.server_state.up_out, b"once only");
}

#[test]
fn test_flush_timer_sends_chaff_the_server_drops() {
    let mut lb = Loopback::new(1);
    let cid = lb.start_circuit();
    lb.connect(cid, nosteg(Side::Client), nosteg(Side::Server));

    let writes_before = lb.client_state.writes_log.len();

    // Idle client: every flush fire emits a zero-data block, and every
    // send pass re-arms the timer.
    for i in 0..3 {
        if i > 0 {
            assert!(lb.client_state.flush_armed.is_some());
        }
        lb.fire_client_flush(cid);
    }

    assert_eq!(lb.client_state.writes_log.len(), writes_before + 3);
    // The server silently drops chaff: nothing upstream, circuit alive.
    assert!(lb.server_state.up_out.is_empty());
    assert_eq!(lb.server.circuit_count(), 1);
}

#[test]
fn test_stale_circuit_gets_cover_reply() {
    let mut lb = Loopback::new(1);
    let cid = lb.start_circuit();
    lb.connect(cid, nosteg(Side::Client), nosteg(Side::Server));

    // Run the circuit to completion in both directions.
    lb.client_up(cid, b"short exchange");
    lb.client_up_eof(cid);
    lb.server_up_eof(cid);
    assert_eq!(lb.server.circuit_count(), 0);
    let up_out_before = lb.server_state.up_out.clone();
    let server_writes_before = lb.server_state.writes_log.len();

    // A late client connection shows up for the dead circuit id, on a
    // cover protocol that mandates a reply.
    let (conn, actions) = lb
        .server
        .downstream_connected(steg::create("nosteg_rr", Side::Server).unwrap(), None);
    lb.dispatch(SideId::Server, actions);
    lb.pump();

    let mut stale = Vec::new();
    stale.extend_from_slice(&cid.to_le_bytes());
    stale.extend_from_slice(b"undecryptable straggler bytes");
    let actions = lb.server.downstream_data(conn, &stale);
    lb.dispatch(SideId::Server, actions);
    lb.pump();

    // No circuit came back, nothing reached the upstream, but a cover
    // reply went out before the connection closed.
    assert_eq!(lb.server.circuit_count(), 0);
    assert_eq!(lb.server.conn_count(), 0);
    assert_eq!(lb.server_state.up_out, up_out_before);
    assert_eq!(lb.server_state.writes_log.len(), server_writes_before + 1);
    let (reply_conn, reply_len) = *lb.server_state.writes_log.last().unwrap();
    assert_eq!(reply_conn, conn);
    assert_eq!(reply_len, 32);
}

#[test]
fn test_request_response_round_robin_reopens_downstreams() {
    let mut lb = Loopback::new(1);
    let cid = lb.start_circuit();
    // The initial circuit creation already asked for downstreams once.
    assert_eq!(lb.client_state.open_requests, vec![cid]);

    // A strict one-request-per-connection cover protocol: the client's
    // handshake block spends the connection's only transmission and the
    // write half closes behind it.
    lb.connect(
        cid,
        steg::create("nosteg_rr", Side::Client).unwrap(),
        steg::create("nosteg_rr", Side::Server).unwrap(),
    );

    // The server owes a reply and its must-send timer is pending.
    assert_eq!(lb.server_state.must_send_armed.len(), 1);
    let server_conn = lb.server_state.must_send_armed[0];
    lb.fire_server_must_send(server_conn);

    // The reply spent the server's transmission too, so both halves are
    // closed, the connection is gone, and the client falls back to its
    // flush timer.
    assert_eq!(lb.client.conn_count(), 0);
    assert!(lb.client_state.flush_armed.is_some());

    // Firing it asks for a fresh round of cover connections.
    lb.fire_client_flush(cid);
    assert_eq!(lb.client_state.open_requests.len(), 2);
    assert_eq!(lb.client.circuit_count(), 1);
}
