//! The chopper: the core protocol engine.
//!
//! The chopper cuts one logical byte stream (the upstream) into
//! variable-length encrypted blocks and distributes them across any number
//! of concurrent cover connections (the downstreams), reassembling the
//! peer's blocks against a 256-slot sliding window on the way back in.
//!
//! [`Engine`] is a deterministic state machine with no I/O of its own: the
//! surrounding harness feeds it socket readability, connect completions,
//! and timer expirations through its event methods, and carries out the
//! [`Action`]s each call returns (write these bytes here, arm this timer,
//! dial these addresses). All circuit and connection state is owned by the
//! engine and touched from exactly one place, so there is nothing to lock.
//!
//! Circuits and downstream connections refer to each other by identifier,
//! never by reference; every cross-lookup is validated, so a timer firing
//! after its owner died is a no-op instead of a dangling pointer.

pub mod block;
mod circuit;
mod conn;
mod queue;

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chop::block::{
    encode_block, BlockHeader, Opcode, HEADER_LEN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SECTION_LEN,
};
use crate::chop::circuit::Circuit;
use crate::chop::conn::Conn;
use crate::config::Config;
use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::steg::{RecvStatus, Steg, StegHints};

/// The version-0 keying secret. Rekeying from out-of-band material is
/// reserved for a future protocol revision.
const PASSPHRASE: &[u8] =
    b"did you buy one of therapist reawaken chemists continually gamma pacifies?";

/// Identifier for one downstream connection within an engine.
pub type ConnId = u64;

/// Something the harness must do on the engine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dial every configured downstream address for this circuit
    /// (client side).
    OpenDownstreams {
        /// Circuit that wants cover connections.
        circuit: u32,
    },
    /// Dial the upstream service for this circuit (server side).
    OpenUpstream {
        /// Newly created circuit.
        circuit: u32,
    },
    /// Write carrier bytes to a downstream socket.
    DownstreamWrite {
        /// Target connection.
        conn: ConnId,
        /// Carrier bytes, already steg-encoded.
        data: Bytes,
    },
    /// Flush a downstream socket and close its write half; keep reading.
    DownstreamShutdownWrite {
        /// Target connection.
        conn: ConnId,
    },
    /// Flush and fully close a downstream socket; the engine has already
    /// forgotten the connection.
    DownstreamClose {
        /// Target connection.
        conn: ConnId,
    },
    /// Write cleartext bytes to a circuit's upstream.
    UpstreamWrite {
        /// Target circuit.
        circuit: u32,
        /// In-order cleartext.
        data: Bytes,
    },
    /// Flush the upstream and close its write half (peer sent FIN); keep
    /// reading.
    UpstreamShutdownWrite {
        /// Target circuit.
        circuit: u32,
    },
    /// Release the upstream entirely; the circuit is gone.
    UpstreamClose {
        /// Destroyed circuit.
        circuit: u32,
    },
    /// Arm (or re-arm) the circuit's flush timer.
    ArmFlushTimer {
        /// Owning circuit.
        circuit: u32,
        /// Delay until it fires.
        after: Duration,
    },
    /// Cancel the circuit's flush timer if pending.
    DisarmFlushTimer {
        /// Owning circuit.
        circuit: u32,
    },
    /// Arm (or re-arm) the circuit's axe timer.
    ArmAxeTimer {
        /// Owning circuit.
        circuit: u32,
        /// Delay until it fires.
        after: Duration,
    },
    /// Cancel the circuit's axe timer if pending.
    DisarmAxeTimer {
        /// Owning circuit.
        circuit: u32,
    },
    /// Arm (or re-arm) the connection's must-send timer.
    ArmMustSendTimer {
        /// Owning connection.
        conn: ConnId,
        /// Delay until it fires.
        after: Duration,
    },
    /// Cancel the connection's must-send timer if pending.
    DisarmMustSendTimer {
        /// Owning connection.
        conn: ConnId,
    },
}

/// How an attempted server-side handshake resolved.
enum Handshake {
    /// The connection is now attached to a circuit.
    Attached,
    /// Fewer than four id bytes have arrived; try again later.
    AwaitingBytes,
    /// The id maps to a dead circuit, or new circuits are refused.
    Stale,
}

/// Outcome of the block-framing loop on one connection.
enum RecvOutcome {
    /// All complete blocks were queued.
    Ok,
    /// Header check field or window test failed.
    InvalidHeader,
    /// GCM tag verification failed.
    MacFailure,
    /// The reassembly queue rejected the block (duplicate or outside the
    /// window).
    InsertRejected,
}

/// The protocol engine for one configured endpoint.
///
/// Owns every circuit and downstream connection, the server-side circuit
/// table included. Destroyed circuits leave a tombstone in the table so a
/// straggling connection for a dead id can be quietly absorbed, the same
/// service TIME_WAIT performs for TCP.
pub struct Engine {
    cfg: Config,
    circuits: HashMap<u32, Option<Circuit>>,
    conns: HashMap<ConnId, Conn>,
    next_conn_id: ConnId,
    actions: Vec<Action>,
    shutting_down: bool,
}

impl Engine {
    /// Create an engine for the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            circuits: HashMap::new(),
            conns: HashMap::new(),
            next_conn_id: 1,
            actions: Vec::new(),
            shutting_down: false,
        }
    }

    /// The configuration this engine runs under.
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Number of live (non-tombstone) circuits.
    pub fn circuit_count(&self) -> usize {
        self.circuits.values().filter(|s| s.is_some()).count()
    }

    /// Number of live downstream connections.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// True once shutdown has been requested.
    pub fn shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// True when nothing is left to drain; during shutdown, the harness
    /// may exit as soon as this holds.
    pub fn is_idle(&self) -> bool {
        self.conns.is_empty() && self.circuit_count() == 0
    }

    // ------------------------------------------------------------------
    // Events from the harness
    // ------------------------------------------------------------------

    /// A new upstream arrived (client side): create a circuit for it with
    /// a fresh random id and ask for its cover connections to be dialed.
    pub fn create_client_circuit(&mut self) -> Result<(u32, Vec<Action>)> {
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }

        let id = loop {
            let id = SecureRandom::u32();
            if id != 0 && !self.circuits.contains_key(&id) {
                break id;
            }
        };

        let ckt = Circuit::new(id, PASSPHRASE, self.cfg.mode.side());
        self.circuits.insert(id, Some(ckt));
        tracing::debug!(circuit = id, "created client circuit");
        self.actions.push(Action::OpenDownstreams { circuit: id });
        Ok((id, self.take_actions()))
    }

    /// A downstream socket is up: register it with its steganography
    /// module. Client-side connections pass the circuit that requested
    /// them; server-side connections stay unattached until the handshake.
    pub fn downstream_connected(
        &mut self,
        steg: Box<dyn Steg>,
        circuit: Option<u32>,
    ) -> (ConnId, Vec<Action>) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(conn_id, Conn::new(conn_id, steg));

        if let Some(cid) = circuit {
            if self.circuit_live(cid) {
                self.add_downstream(cid, conn_id);
                // The client must transmit something immediately, even if
                // the upstream has nothing to say yet: the server cannot
                // bind this connection to a circuit, or even open its own
                // upstream, until the handshake arrives.
                if !self.cfg.mode.is_server() {
                    self.conn_send(conn_id);
                }
            } else {
                // The circuit died while we were dialing.
                self.close_conn(conn_id);
            }
        }

        (conn_id, self.take_actions())
    }

    /// A downstream dial attempt failed (client side).
    pub fn downstream_connect_failed(&mut self, circuit: u32) -> Vec<Action> {
        tracing::warn!(circuit, "downstream connection attempt failed");
        let retry = match circuit_ref(&self.circuits, circuit) {
            Some(ckt) if ckt.downstreams.is_empty() && !ckt.closing() => {
                Some(ckt.flush_interval())
            }
            _ => None,
        };
        if let Some(after) = retry {
            self.actions.push(Action::ArmFlushTimer { circuit, after });
        }
        self.take_actions()
    }

    /// Carrier bytes arrived on a downstream socket.
    pub fn downstream_data(&mut self, conn: ConnId, data: &[u8]) -> Vec<Action> {
        let ready = match self.conns.get_mut(&conn) {
            Some(c) if !c.closing => {
                c.inbound.extend_from_slice(data);
                true
            }
            _ => false,
        };
        if ready {
            self.conn_recv(conn);
        }
        self.take_actions()
    }

    /// A downstream peer closed its sending side.
    pub fn downstream_eof(&mut self, conn: ConnId) -> Vec<Action> {
        self.conn_recv_eof(conn);
        self.take_actions()
    }

    /// Cleartext bytes arrived from a circuit's upstream.
    pub fn upstream_data(&mut self, circuit: u32, data: &[u8]) -> Vec<Action> {
        let live = match circuit_mut(&mut self.circuits, circuit) {
            Some(ckt) => {
                ckt.xmit_pending.extend_from_slice(data);
                true
            }
            None => false,
        };
        if live {
            self.circuit_send(circuit);
        }
        self.take_actions()
    }

    /// A circuit's upstream reached end-of-stream.
    pub fn upstream_eof(&mut self, circuit: u32) -> Vec<Action> {
        let live = match circuit_mut(&mut self.circuits, circuit) {
            Some(ckt) => {
                ckt.upstream_eof = true;
                true
            }
            None => false,
        };
        if live {
            self.circuit_send(circuit);
        }
        self.take_actions()
    }

    /// The server-side dial to the upstream service failed.
    pub fn upstream_open_failed(&mut self, circuit: u32) -> Vec<Action> {
        tracing::warn!(circuit, "failed to open upstream connection");
        self.destroy_circuit(circuit);
        self.take_actions()
    }

    /// The circuit's flush timer fired: transmit, with chaff if need be,
    /// to give the peer a chance to push data back.
    pub fn flush_timeout(&mut self, circuit: u32) -> Vec<Action> {
        if self.circuit_live(circuit) {
            self.circuit_send(circuit);
        }
        self.take_actions()
    }

    /// The circuit's axe timer fired: it has sat with no downstream
    /// connections for longer than any legitimate peer silence.
    pub fn axe_timeout(&mut self, circuit: u32) -> Vec<Action> {
        if self.circuit_live(circuit) {
            tracing::warn!(circuit, "axe timer expired; destroying circuit");
            self.destroy_circuit(circuit);
        }
        self.take_actions()
    }

    /// A connection's must-send timer fired: its cover protocol demands a
    /// transmission now.
    pub fn must_send_timeout(&mut self, conn: ConnId) -> Vec<Action> {
        let armed = self
            .conns
            .get_mut(&conn)
            .map(|c| std::mem::replace(&mut c.must_send_armed, false))
            .unwrap_or(false);
        if armed {
            self.conn_send(conn);
        }
        self.take_actions()
    }

    /// Stop accepting new circuits. With `barbaric`, additionally tear
    /// down every circuit and connection right now instead of letting
    /// them run to completion.
    pub fn start_shutdown(&mut self, barbaric: bool) -> Vec<Action> {
        self.shutting_down = true;
        tracing::info!(barbaric, "shutdown requested");

        if barbaric {
            let live: Vec<u32> = self
                .circuits
                .iter()
                .filter_map(|(id, slot)| slot.as_ref().map(|_| *id))
                .collect();
            for cid in live {
                self.destroy_circuit(cid);
            }
            let orphans: Vec<ConnId> = self.conns.keys().copied().collect();
            for conn in orphans {
                self.close_conn(conn);
            }
        }
        self.take_actions()
    }

    // ------------------------------------------------------------------
    // Receive pipeline
    // ------------------------------------------------------------------

    /// Drain carriers, resolve the handshake if needed, frame blocks into
    /// the reassembly queue, then deliver whatever became ready.
    fn conn_recv(&mut self, conn_id: ConnId) {
        // Let the steg module extract hidden bytes from the carrier.
        let mut bad = false;
        {
            let Self { conns, actions, .. } = self;
            let Some(conn) = conns.get_mut(&conn_id) else {
                return;
            };
            let mut hints = StegHints::default();
            let status = conn
                .steg
                .receive(&mut conn.inbound, &mut conn.recv_pending, &mut hints);
            apply_hints(conn, hints, actions);
            match status {
                Ok(RecvStatus::Good) | Ok(RecvStatus::Incomplete) => {}
                Ok(RecvStatus::Bad) | Err(_) => {
                    tracing::warn!(conn = conn_id, "steg module rejected carrier stream");
                    bad = true;
                }
            }
        }
        if bad {
            self.close_conn(conn_id);
            return;
        }

        // Bind the connection to a circuit if it has none yet.
        let cid = match self.conns.get(&conn_id).and_then(|c| c.circuit) {
            Some(cid) => cid,
            None => {
                if !self.cfg.mode.is_server() {
                    // Client connections are born attached; an orphan here
                    // means its circuit died underneath it.
                    self.close_conn(conn_id);
                    return;
                }
                match self.recv_handshake(conn_id) {
                    Handshake::AwaitingBytes => return,
                    Handshake::Attached => self
                        .conns
                        .get(&conn_id)
                        .and_then(|c| c.circuit)
                        .expect("attached connection has a circuit"),
                    Handshake::Stale => {
                        // A connection for a circuit we already tore down:
                        // a reconnect that crossed with our FIN. We no
                        // longer hold keys for it, so drop the payload,
                        // produce a cover reply if the steg module demands
                        // one, and close.
                        let must_reply = match self.conns.get_mut(&conn_id) {
                            Some(conn) => {
                                conn.recv_pending.clear();
                                conn.must_send_armed
                            }
                            None => false,
                        };
                        if must_reply {
                            self.conn_send(conn_id);
                        }
                        self.close_conn(conn_id);
                        return;
                    }
                }
            }
        };

        // Frame and verify blocks out of the extracted byte stream.
        let outcome = {
            let Self { circuits, conns, .. } = self;
            let Some(conn) = conns.get_mut(&conn_id) else {
                return;
            };
            let Some(ckt) = circuit_mut(circuits, cid) else {
                return;
            };

            let mut outcome = RecvOutcome::Ok;
            loop {
                let avail = conn.recv_pending.len();
                if avail == 0 {
                    break;
                }
                if avail < MIN_BLOCK_SIZE {
                    tracing::debug!(conn = conn_id, avail, "incomplete block framing");
                    break;
                }

                let hdr = BlockHeader::open(&conn.recv_pending[..HEADER_LEN], &ckt.hdr_dec);
                if !hdr.is_valid(ckt.recv_queue.window()) {
                    let hex: String = hdr
                        .cleartext()
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect();
                    tracing::info!(conn = conn_id, header = %hex, "invalid block header");
                    outcome = RecvOutcome::InvalidHeader;
                    break;
                }
                if avail < hdr.total_len() {
                    tracing::debug!(
                        conn = conn_id,
                        need = hdr.total_len(),
                        avail,
                        "incomplete block"
                    );
                    break;
                }

                conn.recv_pending.advance(HEADER_LEN);
                let body = conn.recv_pending.split_to(hdr.total_len() - HEADER_LEN);
                let plain = match ckt.opener.open(hdr.nonce(), &body) {
                    Ok(plain) => plain,
                    Err(_) => {
                        tracing::info!(conn = conn_id, "MAC verification failure");
                        outcome = RecvOutcome::MacFailure;
                        break;
                    }
                };

                tracing::debug!(
                    conn = conn_id,
                    seq = hdr.seqno(),
                    d = hdr.dlen(),
                    p = hdr.plen(),
                    f = hdr.opcode_byte(),
                    "receiving block"
                );

                let data = Bytes::copy_from_slice(&plain[..hdr.dlen()]);
                if !ckt.recv_queue.insert(hdr.seqno(), hdr.opcode_byte(), data) {
                    outcome = RecvOutcome::InsertRejected;
                    break;
                }
            }
            outcome
        };

        match outcome {
            RecvOutcome::Ok => self.process_queue(cid),
            RecvOutcome::InvalidHeader | RecvOutcome::InsertRejected => self.fail_circuit(cid),
            RecvOutcome::MacFailure => {
                // We cannot authenticate an RST for a forged block, so no
                // RST goes out: drop the poisoned connection, and give up
                // the circuit only if that leaves it with no downstreams
                // and no end-of-stream progress in either direction.
                self.close_conn(conn_id);
                let doomed = match circuit_ref(&self.circuits, cid) {
                    Some(ckt) => ckt.downstreams.is_empty() && !ckt.sent_fin && !ckt.received_fin,
                    None => false,
                };
                if doomed {
                    self.destroy_circuit(cid);
                }
            }
        }
    }

    /// Try to consume the 4-byte circuit id that prefixes the client's
    /// first block on every new downstream, and bind this connection
    /// accordingly.
    fn recv_handshake(&mut self, conn_id: ConnId) -> Handshake {
        let id = match self.conns.get_mut(&conn_id).and_then(Conn::take_handshake_id) {
            Some(id) => id,
            None => return Handshake::AwaitingBytes,
        };

        enum TableState {
            Live,
            Tombstone,
            Absent,
        }
        let state = match self.circuits.get(&id) {
            Some(Some(_)) => TableState::Live,
            Some(None) => TableState::Tombstone,
            None => TableState::Absent,
        };

        match state {
            TableState::Live => {
                tracing::debug!(conn = conn_id, circuit = id, "found existing circuit");
                self.add_downstream(id, conn_id);
                Handshake::Attached
            }
            TableState::Tombstone => {
                tracing::debug!(conn = conn_id, circuit = id, "stale circuit");
                Handshake::Stale
            }
            TableState::Absent => {
                if self.shutting_down {
                    tracing::debug!(conn = conn_id, circuit = id, "refusing new circuit");
                    return Handshake::Stale;
                }
                let ckt = Circuit::new(id, PASSPHRASE, self.cfg.mode.side());
                self.circuits.insert(id, Some(ckt));
                tracing::debug!(conn = conn_id, circuit = id, "created new circuit");
                self.actions.push(Action::OpenUpstream { circuit: id });
                self.add_downstream(id, conn_id);
                Handshake::Attached
            }
        }
    }

    /// Pop consecutive ready blocks off the reassembly queue and dispatch
    /// them by opcode.
    fn process_queue(&mut self, cid: u32) {
        let mut count = 0u32;
        let mut failed = false;

        loop {
            // Take one ready block, then decide its fate.
            let blk = match circuit_mut(&mut self.circuits, cid) {
                Some(ckt) => ckt.recv_queue.remove_next(),
                None => return,
            };
            let Some(blk) = blk else {
                break;
            };
            count += 1;

            let mut error = false;
            // There is no point answering an RST or a FIN with an RST.
            let mut rst_eligible = true;

            {
                let Self { circuits, actions, .. } = self;
                let Some(ckt) = circuit_mut(circuits, cid) else {
                    return;
                };
                match Opcode::from_byte(blk.op) {
                    Some(Opcode::Fin) => {
                        if ckt.received_fin {
                            tracing::info!(circuit = cid, "protocol error: duplicate FIN");
                            error = true;
                            rst_eligible = false;
                        } else {
                            tracing::debug!(circuit = cid, "received FIN");
                            if !blk.data.is_empty() {
                                actions.push(Action::UpstreamWrite {
                                    circuit: cid,
                                    data: blk.data,
                                });
                            }
                            // Mark end-of-stream before touching any later
                            // queued slot, so a data-bearing FIN followed
                            // by stragglers cannot deliver twice.
                            ckt.received_fin = true;
                            actions.push(Action::UpstreamShutdownWrite { circuit: cid });
                        }
                    }
                    Some(Opcode::Dat) => {
                        if !blk.data.is_empty() {
                            if ckt.received_fin {
                                tracing::info!(circuit = cid, "protocol error: data after FIN");
                                error = true;
                            } else {
                                actions.push(Action::UpstreamWrite {
                                    circuit: cid,
                                    data: blk.data,
                                });
                            }
                        }
                        // An empty DAT is chaff; drop it silently.
                    }
                    Some(Opcode::Rst) => {
                        tracing::info!(circuit = cid, "received RST; disconnecting circuit");
                        actions.push(Action::UpstreamShutdownWrite { circuit: cid });
                        error = true;
                        rst_eligible = false;
                    }
                    Some(Opcode::Rk1) | Some(Opcode::Rk2) | Some(Opcode::Rk3) => {
                        tracing::warn!(circuit = cid, "rekeying not yet implemented");
                        error = true;
                    }
                    None => {
                        tracing::warn!(
                            circuit = cid,
                            opcode = blk.op,
                            "protocol error: unknown block opcode"
                        );
                        error = true;
                    }
                }
            }

            if error {
                if rst_eligible {
                    let _ = self.send_special(cid, Opcode::Rst, Bytes::new());
                }
                failed = true;
                break;
            }
        }

        tracing::debug!(circuit = cid, count, "processed blocks");

        if failed {
            self.destroy_circuit(cid);
            return;
        }

        let send_more = match circuit_mut(&mut self.circuits, cid) {
            Some(ckt) => {
                if count > 0 {
                    ckt.dead_cycles = 0;
                }
                !ckt.xmit_pending.is_empty() || (ckt.upstream_eof && !ckt.sent_fin)
            }
            None => return,
        };

        // It may have become possible to send queued data or a FIN.
        if send_more {
            self.circuit_send(cid);
        } else {
            self.check_for_eof(cid);
        }
    }

    /// Process leftovers and decide whether a downstream whose peer
    /// stopped sending should be dropped from its circuit.
    fn conn_recv_eof(&mut self, conn_id: ConnId) {
        // Consume any not-yet-processed bytes. We can get here before
        // having processed anything at all from a new connection, the
        // handshake included.
        let pending = self
            .conns
            .get(&conn_id)
            .map(|c| !c.inbound.is_empty())
            .unwrap_or(false);
        if pending {
            self.conn_recv(conn_id);
        }

        let (leftover, circuit, no_more, must_send) = match self.conns.get(&conn_id) {
            Some(c) => (
                (!c.inbound.is_empty() || !c.recv_pending.is_empty()) && c.circuit.is_some(),
                c.circuit,
                c.no_more_transmissions,
                c.must_send_armed,
            ),
            None => return, // recv already closed it
        };

        if leftover {
            tracing::info!(conn = conn_id, "EOF with partial block in flight");
            self.close_conn(conn_id);
            return;
        }

        // Keep the connection only while we may still need to transmit
        // covert data on it, or the cover protocol still owes a reply.
        match circuit {
            Some(cid) => {
                let sent_fin = circuit_ref(&self.circuits, cid)
                    .map(|c| c.sent_fin)
                    .unwrap_or(true);
                if (sent_fin || no_more) && !must_send {
                    self.close_conn(conn_id);
                }
            }
            None => self.close_conn(conn_id),
        }
    }

    // ------------------------------------------------------------------
    // Send scheduler
    // ------------------------------------------------------------------

    /// Transmit as much pending upstream data as the downstreams will
    /// carry — and at least one block, even when there is nothing real to
    /// say, to preserve the query/response shape some carriers require.
    fn circuit_send(&mut self, cid: u32) {
        self.actions.push(Action::DisarmFlushTimer { circuit: cid });

        let (no_downstreams, axe_after) = match circuit_ref(&self.circuits, cid) {
            Some(ckt) => (ckt.downstreams.is_empty(), ckt.axe_interval()),
            None => return,
        };
        if no_downstreams {
            // We have no connections, but we must send. A client reopens
            // its cover connections; a server can only wait and hope the
            // client reconnects before the axe falls.
            tracing::debug!(circuit = cid, "no downstream connections");
            if !self.cfg.mode.is_server() {
                self.actions.push(Action::OpenDownstreams { circuit: cid });
            } else {
                self.actions.push(Action::ArmAxeTimer {
                    circuit: cid,
                    after: axe_after,
                });
            }
            return;
        }

        let avail0 = match circuit_ref(&self.circuits, cid) {
            Some(ckt) => ckt.xmit_pending.len(),
            None => return,
        };

        loop {
            let avail = match circuit_ref(&self.circuits, cid) {
                Some(ckt) => ckt.xmit_pending.len(),
                None => return,
            };
            tracing::debug!(circuit = cid, avail, "bytes to send");

            let Some((target, blocksize)) = self.pick_connection(cid, avail) else {
                // Not an error; e.g. the server has something to push
                // back but the client's next query has not arrived yet.
                tracing::debug!(circuit = cid, "no target connection available");
                break;
            };

            if self.send_targeted(cid, target, blocksize).is_err() {
                // The steg module refused the block; this connection is
                // no longer usable for transmission.
                self.close_conn(target);
                if !self.circuit_live(cid) {
                    return;
                }
                continue;
            }

            match circuit_ref(&self.circuits, cid) {
                Some(ckt) if !ckt.xmit_pending.is_empty() => continue,
                _ => break,
            }
        }

        match circuit_mut(&mut self.circuits, cid) {
            Some(ckt) => {
                if ckt.xmit_pending.len() < avail0 {
                    ckt.dead_cycles = 0;
                } else {
                    ckt.dead_cycles += 1;
                    tracing::debug!(circuit = cid, dead_cycles = ckt.dead_cycles, "dead cycle");
                }
            }
            None => return,
        }

        self.check_for_eof(cid);
    }

    /// Choose the downstream whose steg room best fits `desired` bytes of
    /// data section, and the total block size to build for it.
    ///
    /// Preference order: the smallest room that takes everything (minimum
    /// waste), else the largest room below (send as much as we can), else
    /// nothing.
    fn pick_connection(&self, cid: u32, desired: usize) -> Option<(ConnId, usize)> {
        let ckt = circuit_ref(&self.circuits, cid)?;
        let desired = desired.min(SECTION_LEN) + MIN_BLOCK_SIZE;

        let mut maxbelow = 0usize;
        let mut minabove = MAX_BLOCK_SIZE + 1;
        let mut targbelow = None;
        let mut targabove = None;

        tracing::debug!(circuit = cid, desired, "target block size");

        for &conn_id in &ckt.downstreams {
            let Some(conn) = self.conns.get(&conn_id) else {
                continue;
            };
            if conn.no_more_transmissions || conn.closing {
                continue;
            }

            let mut room = conn.steg.transmit_room();
            if room <= MIN_BLOCK_SIZE {
                room = 0;
            }
            room = room.min(MAX_BLOCK_SIZE);

            tracing::debug!(conn = conn_id, room, steg = conn.steg.name(), "offers bytes");

            if room >= desired {
                if room < minabove {
                    minabove = room;
                    targabove = Some(conn_id);
                }
            } else if room > maxbelow {
                maxbelow = room;
                targbelow = Some(conn_id);
            }
        }

        // If nothing at all offers room, both candidates still hold their
        // initial values and there is no target; callers wait for a
        // timer or for the peer's next move.
        match (targabove, targbelow) {
            (Some(conn), _) => Some((conn, desired)),
            (None, Some(conn)) => Some((conn, maxbelow)),
            (None, None) => None,
        }
    }

    /// Build and transmit one block of exactly `blocksize` bytes to the
    /// chosen connection, carrying as much pending data as fits.
    fn send_targeted(&mut self, cid: u32, conn_id: ConnId, blocksize: usize) -> Result<()> {
        debug_assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blocksize));

        let (data, padlen, op) = {
            let Some(ckt) = circuit_ref(&self.circuits, cid) else {
                return Err(Error::protocol("no such circuit"));
            };
            let avail = ckt.xmit_pending.len();
            let d = avail.min(blocksize - MIN_BLOCK_SIZE).min(SECTION_LEN);
            // FIN rides the block that carries the last pending byte.
            let op = if ckt.upstream_eof && !ckt.sent_fin && avail == d {
                Opcode::Fin
            } else {
                Opcode::Dat
            };
            let data = Bytes::copy_from_slice(&ckt.xmit_pending[..d]);
            (data, blocksize - MIN_BLOCK_SIZE - d, op)
        };

        let drained = data.len();
        self.send_block(cid, conn_id, &data, padlen, op)?;

        if let Some(ckt) = circuit_mut(&mut self.circuits, cid) {
            ckt.xmit_pending.advance(drained);
        }
        Ok(())
    }

    /// Emit a control block (RST today, RK* eventually) on whichever
    /// connection has room for it.
    fn send_special(&mut self, cid: u32, op: Opcode, payload: Bytes) -> Result<()> {
        let d = payload.len();
        debug_assert!(d <= SECTION_LEN);

        let pick = self.pick_connection(cid, d);
        let usable = match pick {
            Some((_, blocksize)) => blocksize - MIN_BLOCK_SIZE >= d,
            None => false,
        };
        if !usable {
            tracing::warn!(
                circuit = cid,
                opcode = op as u8,
                need = d + MIN_BLOCK_SIZE,
                "no usable connection for special block"
            );
            return Err(Error::protocol("no room for special block"));
        }

        let (conn_id, blocksize) = pick.expect("checked above");
        self.send_block(cid, conn_id, &payload, blocksize - MIN_BLOCK_SIZE - d, op)
    }

    /// Seal one block under the circuit's send contexts and hand it to
    /// the connection's steg module. The sequence number advances only on
    /// success, so a refused block never burns a seqno.
    fn send_block(
        &mut self,
        cid: u32,
        conn_id: ConnId,
        data: &[u8],
        padlen: usize,
        op: Opcode,
    ) -> Result<()> {
        let (block, seq) = {
            let Some(ckt) = circuit_ref(&self.circuits, cid) else {
                return Err(Error::protocol("no such circuit"));
            };
            let seq = ckt.send_seq;
            (
                encode_block(seq, data, padlen, &ckt.hdr_enc, &ckt.sealer, op),
                seq,
            )
        };

        tracing::debug!(
            conn = conn_id,
            seq,
            d = data.len(),
            p = padlen,
            f = op as u8,
            "transmitting block"
        );

        self.conn_transmit(conn_id, block)?;

        if let Some(ckt) = circuit_mut(&mut self.circuits, cid) {
            ckt.send_seq += 1;
            if op == Opcode::Fin {
                ckt.sent_fin = true;
            }
        }
        Ok(())
    }

    /// Push one framed block through a connection's steg module, merging
    /// the 4-byte circuit-id handshake into the client's first
    /// transmission.
    fn conn_transmit(&mut self, conn_id: ConnId, block: BytesMut) -> Result<()> {
        let is_server = self.cfg.mode.is_server();
        let Self { conns, actions, .. } = self;
        let Some(conn) = conns.get_mut(&conn_id) else {
            return Err(Error::protocol("no such connection"));
        };

        let block = if !conn.sent_handshake && !is_server {
            let cid = conn
                .circuit
                .ok_or_else(|| Error::protocol("handshake with no circuit"))?;
            let mut framed = BytesMut::with_capacity(4 + block.len());
            framed.put_slice(&cid.to_le_bytes());
            framed.extend_from_slice(&block);
            framed
        } else {
            block
        };

        let mut carrier = BytesMut::new();
        let mut hints = StegHints::default();
        if let Err(e) = conn.steg.transmit(&block[..], &mut carrier, &mut hints) {
            tracing::warn!(conn = conn_id, error = %e, "failed to transmit block");
            return Err(e);
        }

        actions.push(Action::DownstreamWrite {
            conn: conn_id,
            data: carrier.freeze(),
        });
        conn.sent_handshake = true;
        if conn.must_send_armed {
            conn.must_send_armed = false;
            actions.push(Action::DisarmMustSendTimer { conn: conn_id });
        }
        apply_hints(conn, hints, actions);
        Ok(())
    }

    /// A connection must transmit right now (handshake hook or must-send
    /// timer), whether or not any circuit has data for it.
    fn conn_send(&mut self, conn_id: ConnId) {
        let proceed = match self.conns.get_mut(&conn_id) {
            Some(conn) if !conn.closing && !conn.no_more_transmissions => {
                if conn.must_send_armed {
                    conn.must_send_armed = false;
                    self.actions
                        .push(Action::DisarmMustSendTimer { conn: conn_id });
                }
                true
            }
            _ => false,
        };
        if !proceed {
            return;
        }

        let cid = self
            .conns
            .get(&conn_id)
            .and_then(|c| c.circuit)
            .filter(|&cid| self.circuit_live(cid));

        match cid {
            Some(cid) => {
                tracing::debug!(conn = conn_id, circuit = cid, "must send");
                if self.send_targeted_auto(cid, conn_id).is_err() {
                    self.close_conn(conn_id);
                }
            }
            None => {
                // No circuit means no keys, so nothing covert can go out;
                // but the cover protocol may still mandate a reply (an
                // HTTP response to a query for a stale circuit). Feed the
                // steg module random bytes shaped like a minimum block.
                tracing::debug!(conn = conn_id, "must send (no upstream)");
                let mut close = false;
                {
                    let Self { conns, actions, .. } = self;
                    let Some(conn) = conns.get_mut(&conn_id) else {
                        return;
                    };
                    let room = conn.steg.transmit_room();
                    if room < MIN_BLOCK_SIZE {
                        tracing::warn!(
                            conn = conn_id,
                            have = room,
                            need = MIN_BLOCK_SIZE,
                            "send with insufficient transmit room"
                        );
                        close = true;
                    } else {
                        let chaff: [u8; MIN_BLOCK_SIZE] = SecureRandom::bytes();
                        let mut carrier = BytesMut::new();
                        let mut hints = StegHints::default();
                        match conn.steg.transmit(&chaff, &mut carrier, &mut hints) {
                            Ok(()) => {
                                actions.push(Action::DownstreamWrite {
                                    conn: conn_id,
                                    data: carrier.freeze(),
                                });
                                apply_hints(conn, hints, actions);
                            }
                            Err(_) => close = true,
                        }
                    }
                }
                if close {
                    self.close_conn(conn_id);
                }
            }
        }
    }

    /// Size a block for this specific connection from its current room
    /// and the circuit's pending data, then send it.
    fn send_targeted_auto(&mut self, cid: u32, conn_id: ConnId) -> Result<()> {
        let avail = match circuit_ref(&self.circuits, cid) {
            Some(ckt) => ckt.xmit_pending.len().min(SECTION_LEN) + MIN_BLOCK_SIZE,
            None => return Err(Error::protocol("no such circuit")),
        };

        let room = match self.conns.get(&conn_id) {
            Some(conn) => conn.steg.transmit_room(),
            None => return Err(Error::protocol("no such connection")),
        };
        if room < MIN_BLOCK_SIZE {
            tracing::warn!(
                conn = conn_id,
                have = room,
                need = MIN_BLOCK_SIZE,
                "send with insufficient transmit room"
            );
            return Err(Error::steg("insufficient transmit room"));
        }

        self.send_targeted(cid, conn_id, avail.min(room).min(MAX_BLOCK_SIZE))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach a downstream connection to a circuit.
    fn add_downstream(&mut self, cid: u32, conn_id: ConnId) {
        let Self {
            circuits,
            conns,
            actions,
            ..
        } = self;
        let Some(ckt) = circuit_mut(circuits, cid) else {
            return;
        };
        let Some(conn) = conns.get_mut(&conn_id) else {
            return;
        };
        debug_assert!(conn.circuit.is_none());
        conn.circuit = Some(cid);
        ckt.downstreams.insert(conn_id);

        tracing::debug!(
            circuit = cid,
            conn = conn_id,
            total = ckt.downstreams.len(),
            "added connection"
        );
        actions.push(Action::DisarmAxeTimer { circuit: cid });
    }

    /// Detach a downstream connection from its circuit, and decide what
    /// the newly lonely circuit does next.
    fn drop_downstream(&mut self, cid: u32, conn_id: ConnId) {
        enum Then {
            Nothing,
            Destroy,
            ArmAxe(Duration),
            ArmFlush(Duration),
        }

        let then = match circuit_mut(&mut self.circuits, cid) {
            Some(ckt) => {
                ckt.downstreams.remove(&conn_id);
                tracing::debug!(
                    circuit = cid,
                    conn = conn_id,
                    total = ckt.downstreams.len(),
                    "dropped connection"
                );
                // If that was the last connection and both FINs are in,
                // the circuit is complete. Otherwise a server arms the
                // axe against a client that never comes back, and a
                // client schedules chaff to give the server an opening
                // for further transmissions.
                if !ckt.downstreams.is_empty() {
                    Then::Nothing
                } else if ckt.closing() {
                    Then::Destroy
                } else if self.cfg.mode.is_server() {
                    Then::ArmAxe(ckt.axe_interval())
                } else {
                    Then::ArmFlush(ckt.flush_interval())
                }
            }
            None => Then::Nothing,
        };

        match then {
            Then::Nothing => {}
            Then::Destroy => self.destroy_circuit(cid),
            Then::ArmAxe(after) => self.actions.push(Action::ArmAxeTimer {
                circuit: cid,
                after,
            }),
            Then::ArmFlush(after) => self.actions.push(Action::ArmFlushTimer {
                circuit: cid,
                after,
            }),
        }
    }

    /// Forget a connection and tell the harness to flush and close it.
    fn close_conn(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        if conn.must_send_armed {
            self.actions
                .push(Action::DisarmMustSendTimer { conn: conn_id });
        }
        self.actions.push(Action::DownstreamClose { conn: conn_id });
        if let Some(cid) = conn.circuit {
            self.drop_downstream(cid, conn_id);
        }
    }

    /// Answer a protocol violation: one advisory RST, then teardown. A
    /// cooperating peer closes on RST; a hostile one was never going to
    /// listen anyway.
    fn fail_circuit(&mut self, cid: u32) {
        let _ = self.send_special(cid, Opcode::Rst, Bytes::new());
        self.destroy_circuit(cid);
    }

    /// If both directions have reached end-of-stream, finish the circuit:
    /// give connections owing a mandatory reply their last word, then
    /// send EOF down every downstream. Otherwise a client keeps the flush
    /// timer running — it must keep talking until both FINs are in, or
    /// the two sides could deadlock waiting for each other.
    fn check_for_eof(&mut self, cid: u32) {
        let (closing, downstreams, flush_after) = match circuit_ref(&self.circuits, cid) {
            Some(ckt) => (
                ckt.closing(),
                ckt.downstreams.iter().copied().collect::<Vec<_>>(),
                ckt.flush_interval(),
            ),
            None => return,
        };

        if closing {
            self.actions.push(Action::DisarmFlushTimer { circuit: cid });
            for conn_id in downstreams {
                let must = self
                    .conns
                    .get(&conn_id)
                    .map(|c| c.must_send_armed)
                    .unwrap_or(false);
                if must {
                    self.conn_send(conn_id);
                }
                let Self { conns, actions, .. } = self;
                if let Some(conn) = conns.get_mut(&conn_id) {
                    if !conn.no_more_transmissions {
                        conn.no_more_transmissions = true;
                        actions.push(Action::DownstreamShutdownWrite { conn: conn_id });
                    }
                }
            }
        } else if !self.cfg.mode.is_server() {
            self.actions.push(Action::ArmFlushTimer {
                circuit: cid,
                after: flush_after,
            });
        }
    }

    /// Tear a circuit down, leaving a tombstone in the table to absorb
    /// straggling connections for its id.
    fn destroy_circuit(&mut self, cid: u32) {
        let Some(mut ckt) = self.circuits.get_mut(&cid).and_then(Option::take) else {
            return;
        };

        if !ckt.sent_fin || !ckt.received_fin || !ckt.upstream_eof {
            tracing::warn!(
                circuit = cid,
                sent_fin = ckt.sent_fin,
                received_fin = ckt.received_fin,
                upstream_eof = ckt.upstream_eof,
                downstreams = ckt.downstreams.len(),
                "destroying active circuit"
            );
        } else {
            tracing::debug!(circuit = cid, "destroying circuit");
        }

        for conn_id in ckt.downstreams.drain() {
            if let Some(conn) = self.conns.remove(&conn_id) {
                if conn.must_send_armed {
                    self.actions
                        .push(Action::DisarmMustSendTimer { conn: conn_id });
                }
                self.actions.push(Action::DownstreamClose { conn: conn_id });
            }
        }

        self.actions.push(Action::DisarmFlushTimer { circuit: cid });
        self.actions.push(Action::DisarmAxeTimer { circuit: cid });
        self.actions.push(Action::UpstreamClose { circuit: cid });
    }

    fn circuit_live(&self, cid: u32) -> bool {
        circuit_ref(&self.circuits, cid).is_some()
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

/// Look up a live circuit, seeing through tombstones.
fn circuit_ref(map: &HashMap<u32, Option<Circuit>>, cid: u32) -> Option<&Circuit> {
    map.get(&cid).and_then(Option::as_ref)
}

/// Mutable variant of [`circuit_ref`].
fn circuit_mut(map: &mut HashMap<u32, Option<Circuit>>, cid: u32) -> Option<&mut Circuit> {
    map.get_mut(&cid).and_then(Option::as_mut)
}

/// Apply the behavior hints a steg module raised during a call.
fn apply_hints(conn: &mut Conn, hints: StegHints, actions: &mut Vec<Action>) {
    if hints.cease_transmission {
        // The peer may still send data back, so only the write half goes.
        tracing::debug!(conn = conn.id, "steg hint: cease transmission");
        if !conn.no_more_transmissions {
            conn.no_more_transmissions = true;
            actions.push(Action::DownstreamShutdownWrite { conn: conn.id });
        }
        if conn.must_send_armed {
            conn.must_send_armed = false;
            actions.push(Action::DisarmMustSendTimer { conn: conn.id });
        }
    }
    if let Some(ms) = hints.transmit_soon {
        if !conn.no_more_transmissions {
            tracing::debug!(conn = conn.id, ms, "steg hint: must send soon");
            conn.must_send_armed = true;
            actions.push(Action::ArmMustSendTimer {
                conn: conn.id,
                after: Duration::from_millis(ms),
            });
        }
    }
    if hints.expect_close {
        tracing::debug!(conn = conn.id, "steg hint: expect close");
    }
}
