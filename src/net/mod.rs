//! Network harness: binds the protocol engine to sockets and timers.
//!
//! One task owns the [`Engine`] and processes events serially — socket
//! readability, connect completions, timer expirations, shutdown
//! requests. Every socket gets a small reader task (forwarding bytes as
//! events) and a writer task (draining an ordered channel); closing the
//! channel flushes whatever is queued and then shuts the write half down,
//! so "flush then close" falls out of channel ordering. Timers are tasks
//! that sleep and send one event; disarming aborts them.

mod socks;

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chop::{Action, ConnId, Engine};
use crate::config::{Config, Mode};
use crate::error::Result;
use crate::steg;

/// Read buffer size for both upstream and downstream sockets.
const READ_CHUNK: usize = 16 * 1024;

/// Depth of each per-socket write queue.
const WRITE_QUEUE: usize = 64;

/// Depth of the central event queue.
const EVENT_QUEUE: usize = 1024;

enum NetEvent {
    UpstreamAccepted(TcpStream),
    DownstreamAccepted {
        index: usize,
        stream: TcpStream,
    },
    DownstreamDialed {
        circuit: u32,
        index: usize,
        result: std::io::Result<TcpStream>,
    },
    UpstreamOpenFailed {
        circuit: u32,
    },
    UpstreamData {
        circuit: u32,
        data: Bytes,
    },
    UpstreamEof {
        circuit: u32,
    },
    DownstreamData {
        conn: ConnId,
        data: Bytes,
    },
    DownstreamEof {
        conn: ConnId,
    },
    FlushTimer(u32),
    AxeTimer(u32),
    MustSendTimer(ConnId),
    Shutdown {
        barbaric: bool,
    },
}

/// The long-running transport process for one configuration.
pub struct Daemon {
    engine: Engine,
    event_tx: mpsc::Sender<NetEvent>,
    event_rx: mpsc::Receiver<NetEvent>,
    down_writers: HashMap<ConnId, mpsc::Sender<Bytes>>,
    down_readers: HashMap<ConnId, JoinHandle<()>>,
    up_writers: HashMap<u32, mpsc::Sender<Bytes>>,
    up_readers: HashMap<u32, JoinHandle<()>>,
    flush_timers: HashMap<u32, JoinHandle<()>>,
    axe_timers: HashMap<u32, JoinHandle<()>>,
    must_send_timers: HashMap<ConnId, JoinHandle<()>>,
    /// Circuits with a downstream dial batch still in flight, and how
    /// many dials remain. Guards against dial storms from repeated
    /// reopen requests.
    dialing: HashMap<u32, usize>,
}

impl Daemon {
    /// Build a daemon around a fresh engine for this configuration.
    pub fn new(cfg: Config) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            engine: Engine::new(cfg),
            event_tx,
            event_rx,
            down_writers: HashMap::new(),
            down_readers: HashMap::new(),
            up_writers: HashMap::new(),
            up_readers: HashMap::new(),
            flush_timers: HashMap::new(),
            axe_timers: HashMap::new(),
            must_send_timers: HashMap::new(),
            dialing: HashMap::new(),
        }
    }

    /// Run until shutdown completes. The first Ctrl-C starts a graceful
    /// drain (no new circuits; existing ones run to completion); a second
    /// tears everything down immediately.
    pub async fn run(mut self) -> Result<()> {
        let cfg = self.engine.cfg().clone();
        let mut accept_tasks = Vec::new();

        if cfg.mode.is_server() {
            for (index, target) in cfg.downstreams.iter().enumerate() {
                let listener = TcpListener::bind(target.addr).await?;
                tracing::info!(addr = %target.addr, steg = %target.steg, "listening for cover connections");
                let tx = self.event_tx.clone();
                accept_tasks.push(tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, index, "cover connection accepted");
                                let _ = stream.set_nodelay(true);
                                if tx
                                    .send(NetEvent::DownstreamAccepted { index, stream })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "accept error"),
                        }
                    }
                }));
            }
        } else {
            let listener = TcpListener::bind(cfg.up_addr).await?;
            tracing::info!(addr = %cfg.up_addr, mode = ?cfg.mode, "listening for upstream connections");
            let tx = self.event_tx.clone();
            let socks_mode = cfg.mode == Mode::SocksClient;
            accept_tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((mut stream, peer)) => {
                            tracing::debug!(%peer, "upstream connection accepted");
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                if socks_mode {
                                    if let Err(e) = socks::handshake(&mut stream).await {
                                        tracing::debug!(%peer, error = %e, "SOCKS negotiation failed");
                                        return;
                                    }
                                }
                                let _ = tx.send(NetEvent::UpstreamAccepted(stream)).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept error"),
                    }
                }
            }));
        }

        // First Ctrl-C drains, second one axes.
        let tx = self.event_tx.clone();
        accept_tasks.push(tokio::spawn(async move {
            let mut barbaric = false;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if tx.send(NetEvent::Shutdown { barbaric }).await.is_err() {
                    return;
                }
                if barbaric {
                    return;
                }
                barbaric = true;
            }
        }));

        while let Some(ev) = self.event_rx.recv().await {
            self.handle_event(ev).await;
            if self.engine.shutting_down() && self.engine.is_idle() {
                break;
            }
        }

        for task in accept_tasks {
            task.abort();
        }
        tracing::info!("all circuits and connections drained; exiting");
        Ok(())
    }

    async fn handle_event(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::UpstreamAccepted(stream) => match self.engine.create_client_circuit() {
                Ok((circuit, actions)) => {
                    self.register_upstream(circuit, stream);
                    self.perform(actions).await;
                }
                Err(e) => {
                    tracing::info!(error = %e, "refusing new upstream connection");
                }
            },
            NetEvent::DownstreamAccepted { index, stream } => {
                self.register_downstream(index, stream, None).await;
            }
            NetEvent::DownstreamDialed {
                circuit,
                index,
                result,
            } => {
                let batch_done = match self.dialing.get_mut(&circuit) {
                    Some(remaining) => {
                        *remaining -= 1;
                        *remaining == 0
                    }
                    None => false,
                };
                if batch_done {
                    self.dialing.remove(&circuit);
                }
                match result {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        self.register_downstream(index, stream, Some(circuit)).await;
                    }
                    Err(e) => {
                        tracing::warn!(circuit, index, error = %e, "downstream dial failed");
                        let actions = self.engine.downstream_connect_failed(circuit);
                        self.perform(actions).await;
                    }
                }
            }
            NetEvent::UpstreamOpenFailed { circuit } => {
                let actions = self.engine.upstream_open_failed(circuit);
                self.perform(actions).await;
            }
            NetEvent::UpstreamData { circuit, data } => {
                let actions = self.engine.upstream_data(circuit, &data);
                self.perform(actions).await;
            }
            NetEvent::UpstreamEof { circuit } => {
                let actions = self.engine.upstream_eof(circuit);
                self.perform(actions).await;
            }
            NetEvent::DownstreamData { conn, data } => {
                let actions = self.engine.downstream_data(conn, &data);
                self.perform(actions).await;
            }
            NetEvent::DownstreamEof { conn } => {
                let actions = self.engine.downstream_eof(conn);
                self.perform(actions).await;
            }
            NetEvent::FlushTimer(circuit) => {
                self.flush_timers.remove(&circuit);
                let actions = self.engine.flush_timeout(circuit);
                self.perform(actions).await;
            }
            NetEvent::AxeTimer(circuit) => {
                self.axe_timers.remove(&circuit);
                let actions = self.engine.axe_timeout(circuit);
                self.perform(actions).await;
            }
            NetEvent::MustSendTimer(conn) => {
                self.must_send_timers.remove(&conn);
                let actions = self.engine.must_send_timeout(conn);
                self.perform(actions).await;
            }
            NetEvent::Shutdown { barbaric } => {
                let actions = self.engine.start_shutdown(barbaric);
                self.perform(actions).await;
            }
        }
    }

    /// Wire an upstream socket to a circuit: reader task in, writer
    /// channel out.
    fn register_upstream(&mut self, circuit: u32, stream: TcpStream) {
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        self.up_writers.insert(circuit, tx);
        tokio::spawn(write_loop(write, rx));
        let ev = self.event_tx.clone();
        self.up_readers.insert(
            circuit,
            tokio::spawn(upstream_read_loop(read, circuit, ev)),
        );
    }

    /// Register a cover connection with the engine and wire its tasks.
    async fn register_downstream(&mut self, index: usize, stream: TcpStream, circuit: Option<u32>) {
        let cfg = self.engine.cfg();
        let Some(target) = cfg.downstreams.get(index) else {
            tracing::warn!(index, "no downstream target at index");
            return;
        };
        let steg = match steg::create(&target.steg, cfg.mode.side()) {
            Ok(steg) => steg,
            Err(e) => {
                tracing::warn!(index, error = %e, "cannot instantiate steganographer");
                return;
            }
        };

        let (conn, actions) = self.engine.downstream_connected(steg, circuit);

        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        self.down_writers.insert(conn, tx);
        tokio::spawn(write_loop(write, rx));
        let ev = self.event_tx.clone();
        self.down_readers
            .insert(conn, tokio::spawn(downstream_read_loop(read, conn, ev)));

        self.perform(actions).await;
    }

    /// Carry out everything the engine asked for.
    async fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::OpenDownstreams { circuit } => {
                    if self.dialing.contains_key(&circuit) {
                        tracing::debug!(circuit, "dial batch already in flight");
                        continue;
                    }
                    let targets = self.engine.cfg().downstreams.clone();
                    self.dialing.insert(circuit, targets.len());
                    for (index, target) in targets.into_iter().enumerate() {
                        let tx = self.event_tx.clone();
                        tokio::spawn(async move {
                            let result = TcpStream::connect(target.addr).await;
                            let _ = tx
                                .send(NetEvent::DownstreamDialed {
                                    circuit,
                                    index,
                                    result,
                                })
                                .await;
                        });
                    }
                }
                Action::OpenUpstream { circuit } => {
                    let addr = self.engine.cfg().up_addr;
                    let (tx, rx) = mpsc::channel(WRITE_QUEUE);
                    self.up_writers.insert(circuit, tx);
                    let ev = self.event_tx.clone();
                    self.up_readers.insert(
                        circuit,
                        tokio::spawn(async move {
                            match TcpStream::connect(addr).await {
                                Ok(stream) => {
                                    let _ = stream.set_nodelay(true);
                                    let (read, write) = stream.into_split();
                                    tokio::spawn(write_loop(write, rx));
                                    upstream_read_loop(read, circuit, ev).await;
                                }
                                Err(e) => {
                                    tracing::warn!(circuit, error = %e, "upstream dial failed");
                                    drop(rx);
                                    let _ = ev
                                        .send(NetEvent::UpstreamOpenFailed { circuit })
                                        .await;
                                }
                            }
                        }),
                    );
                }
                Action::DownstreamWrite { conn, data } => {
                    if let Some(tx) = self.down_writers.get(&conn) {
                        let _ = tx.send(data).await;
                    }
                }
                Action::DownstreamShutdownWrite { conn } => {
                    // Dropping the sender flushes the queue, then closes
                    // the write half.
                    self.down_writers.remove(&conn);
                }
                Action::DownstreamClose { conn } => {
                    self.down_writers.remove(&conn);
                    if let Some(task) = self.down_readers.remove(&conn) {
                        task.abort();
                    }
                }
                Action::UpstreamWrite { circuit, data } => {
                    if let Some(tx) = self.up_writers.get(&circuit) {
                        let _ = tx.send(data).await;
                    }
                }
                Action::UpstreamShutdownWrite { circuit } => {
                    self.up_writers.remove(&circuit);
                }
                Action::UpstreamClose { circuit } => {
                    self.up_writers.remove(&circuit);
                    if let Some(task) = self.up_readers.remove(&circuit) {
                        task.abort();
                    }
                }
                Action::ArmFlushTimer { circuit, after } => {
                    let tx = self.event_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(NetEvent::FlushTimer(circuit)).await;
                    });
                    if let Some(old) = self.flush_timers.insert(circuit, task) {
                        old.abort();
                    }
                }
                Action::DisarmFlushTimer { circuit } => {
                    if let Some(task) = self.flush_timers.remove(&circuit) {
                        task.abort();
                    }
                }
                Action::ArmAxeTimer { circuit, after } => {
                    let tx = self.event_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(NetEvent::AxeTimer(circuit)).await;
                    });
                    if let Some(old) = self.axe_timers.insert(circuit, task) {
                        old.abort();
                    }
                }
                Action::DisarmAxeTimer { circuit } => {
                    if let Some(task) = self.axe_timers.remove(&circuit) {
                        task.abort();
                    }
                }
                Action::ArmMustSendTimer { conn, after } => {
                    let tx = self.event_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(NetEvent::MustSendTimer(conn)).await;
                    });
                    if let Some(old) = self.must_send_timers.insert(conn, task) {
                        old.abort();
                    }
                }
                Action::DisarmMustSendTimer { conn } => {
                    if let Some(task) = self.must_send_timers.remove(&conn) {
                        task.abort();
                    }
                }
            }
        }
    }
}

/// Drain a write queue into a socket half; on queue close, flush is
/// already implied by ordering, so just shut the half down.
async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        if half.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = half.shutdown().await;
}

async fn downstream_read_loop(
    mut half: OwnedReadHalf,
    conn: ConnId,
    tx: mpsc::Sender<NetEvent>,
) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(NetEvent::DownstreamEof { conn }).await;
                return;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if tx
                    .send(NetEvent::DownstreamData { conn, data })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn upstream_read_loop(mut half: OwnedReadHalf, circuit: u32, tx: mpsc::Sender<NetEvent>) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(NetEvent::UpstreamEof { circuit }).await;
                return;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if tx
                    .send(NetEvent::UpstreamData { circuit, data })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}
