//! Per-connection peer session: owns the TCP socket and the state machine
//! described in the wire protocol, and talks to the scheduler only through
//! message passing (a [`SessionHandle`] plus channels) so neither side owns
//! the other.
use crate::config::Config;
use crate::file::SharedFileLayer;
use crate::peer::{Bitfield, Handshake, Message, PeerError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Dead,
}

/// A key identifying one outstanding block request: `(piece_index, begin, length)`.
pub type RequestKey = (u32, u32, u32);

/// Snapshot of a session's state the scheduler can read without going
/// through the command channel — updated by the session task under a
/// short-held std `Mutex`, never held across an `.await`.
#[derive(Debug, Clone)]
pub struct PeerStatusSnapshot {
    pub state: PeerState,
    pub bitfield: Bitfield,
    pub am_choked: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub am_interesting: bool,
    pub ready: bool,
    pub inflight: usize,
    pub success_rate: f64,
    pub avg_duration: Duration,
}

/// Commands the scheduler sends to a running session.
#[derive(Debug)]
pub enum SessionCommand {
    SendRequest { index: u32, begin: u32, length: u32 },
    SendHave { index: u32 },
    Shutdown,
}

/// Events a session reports back to the scheduler.
#[derive(Debug)]
pub enum SessionEvent {
    Ready(SessionHandle),
    Dead {
        handle: SessionHandle,
        returned: Vec<RequestKey>,
    },
    RequestResolved {
        handle: SessionHandle,
        index: u32,
        begin: u32,
        length: u32,
        success: bool,
        duration: Duration,
    },
}

/// An opaque, cloneable reference to a running session: its address, a
/// command sender, and a read-only status snapshot. The scheduler never
/// touches the session's socket or task directly.
#[derive(Clone)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    commands: mpsc::Sender<SessionCommand>,
    status: Arc<Mutex<PeerStatusSnapshot>>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> PeerStatusSnapshot {
        self.status.lock().expect("status mutex poisoned").clone()
    }

    pub async fn send_request(&self, index: u32, begin: u32, length: u32) {
        let _ = self
            .commands
            .send(SessionCommand::SendRequest { index, begin, length })
            .await;
    }

    pub async fn send_have(&self, index: u32) {
        let _ = self.commands.send(SessionCommand::SendHave { index }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl Eq for SessionHandle {}

struct Outstanding {
    started_at: Instant,
    deadline: Instant,
}

/// Owns one peer connection end to end: connects, handshakes, and then
/// loops reading frames and commands until the connection dies.
pub struct PeerSession {
    addr: SocketAddr,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    local_bitfield: Arc<Mutex<Bitfield>>,
    file_layer: SharedFileLayer,
    config: Config,
    status: Arc<Mutex<PeerStatusSnapshot>>,
    outstanding: HashMap<RequestKey, Outstanding>,
    score: crate::peer::Score,
    last_tx: Instant,
    first_message_seen: bool,
    punished_until: Instant,
}

impl PeerSession {
    /// Connects to `addr`, performs the handshake, and spawns the session
    /// task. Returns immediately with a handle; connection/handshake
    /// failure surfaces as a `SessionEvent::Dead` with an empty `returned`.
    #[instrument(skip(file_layer, local_bitfield, events_tx), fields(%addr))]
    pub fn spawn(
        addr: SocketAddr,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        piece_count: usize,
        local_bitfield: Arc<Mutex<Bitfield>>,
        file_layer: SharedFileLayer,
        config: Config,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> SessionHandle {
        let status = Arc::new(Mutex::new(PeerStatusSnapshot {
            state: PeerState::Connecting,
            bitfield: Bitfield::new(piece_count),
            am_choked: true,
            am_choking: true,
            am_interested: false,
            am_interesting: false,
            ready: false,
            inflight: 0,
            success_rate: 1.0,
            avg_duration: Duration::ZERO,
        }));
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let handle = SessionHandle {
            addr,
            commands: commands_tx,
            status: status.clone(),
        };

        let session = PeerSession {
            addr,
            info_hash,
            local_peer_id,
            local_bitfield,
            file_layer,
            score: crate::peer::Score::new(config.score_history),
            config,
            status,
            outstanding: HashMap::new(),
            last_tx: Instant::now(),
            first_message_seen: false,
            punished_until: Instant::now(),
        };

        let handle_for_task = handle.clone();
        tokio::spawn(session.run(handle_for_task, commands_rx, events_tx));
        handle
    }

    async fn run(
        mut self,
        handle: SessionHandle,
        mut commands_rx: mpsc::Receiver<SessionCommand>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) {
        let mut stream = match self.connect_and_handshake().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%self.addr, error = %err, "handshake failed");
                self.mark_dead();
                let _ = events_tx
                    .send(SessionEvent::Dead {
                        handle,
                        returned: vec![],
                    })
                    .await;
                return;
            }
        };

        {
            let mut status = self.status.lock().expect("status mutex poisoned");
            status.state = PeerState::Active;
        }
        self.update_readiness(&handle, &events_tx).await;

        let mut keepalive_ticker = tokio::time::interval(self.config.keepalive_interval);
        let mut timeout_ticker = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                frame = read_frame(&mut stream) => {
                    match frame {
                        Ok(body) => {
                            if self.handle_frame(&mut stream, &body, &handle, &events_tx).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                cmd = commands_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) | None => break,
                        Some(SessionCommand::SendRequest { index, begin, length }) => {
                            self.send_request(&mut stream, index, begin, length).await;
                        }
                        Some(SessionCommand::SendHave { index }) => {
                            let _ = send_message(&mut stream, &Message::Have { piece_index: index }).await;
                            self.last_tx = Instant::now();
                        }
                    }
                }
                _ = keepalive_ticker.tick() => {
                    if self.last_tx.elapsed() >= self.config.keepalive_interval {
                        let _ = send_message(&mut stream, &Message::Keepalive).await;
                        self.last_tx = Instant::now();
                    }
                }
                _ = timeout_ticker.tick() => {
                    self.expire_timed_out(&mut stream, &handle, &events_tx).await;
                }
            }
            self.update_readiness(&handle, &events_tx).await;
        }

        self.mark_dead();
        let returned: Vec<RequestKey> = self.outstanding.keys().copied().collect();
        let _ = events_tx.send(SessionEvent::Dead { handle, returned }).await;
    }

    async fn connect_and_handshake(&mut self) -> Result<TcpStream, PeerError> {
        {
            let mut status = self.status.lock().expect("status mutex poisoned");
            status.state = PeerState::Handshaking;
        }
        let mut stream = tokio::time::timeout(self.config.handshake_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        let our_handshake = Handshake::new(self.info_hash, self.local_peer_id);
        stream.write_all(&our_handshake.serialize()).await?;

        let peer_handshake = tokio::time::timeout(self.config.handshake_timeout, Handshake::read(&mut stream))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        peer_handshake.validate(self.info_hash)?;

        let local_bitfield = self.local_bitfield.lock().expect("bitfield mutex poisoned").clone();
        send_message(&mut stream, &Message::Bitfield { bytes: local_bitfield.as_bytes().to_vec() }).await?;
        self.last_tx = Instant::now();
        Ok(stream)
    }

    async fn handle_frame(
        &mut self,
        stream: &mut TcpStream,
        body: &[u8],
        handle: &SessionHandle,
        events_tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<(), ()> {
        let message = match Message::from_body(body) {
            Ok(m) => m,
            Err(_) => return Err(()),
        };
        let piece_count = self.status.lock().expect("status mutex poisoned").bitfield.piece_count();

        match message {
            Message::Keepalive => {}
            Message::Choke => {
                self.status.lock().expect("status mutex poisoned").am_choked = true;
            }
            Message::Unchoke => {
                self.status.lock().expect("status mutex poisoned").am_choked = false;
            }
            Message::Interested => {
                let was_choking = {
                    let mut status = self.status.lock().expect("status mutex poisoned");
                    status.am_interesting = true;
                    std::mem::replace(&mut status.am_choking, false)
                };
                if was_choking {
                    let _ = send_message(stream, &Message::Unchoke).await;
                    self.last_tx = Instant::now();
                }
            }
            Message::NotInterested => {
                self.status.lock().expect("status mutex poisoned").am_interesting = false;
            }
            Message::Bitfield { bytes } => {
                if self.first_message_seen {
                    return Err(());
                }
                let bf = Bitfield::from_wire_bytes(&bytes, piece_count).map_err(|_| ())?;
                self.adopt_remote_bitfield(bf);
                self.maybe_become_interested(stream).await;
            }
            Message::Have { piece_index } => {
                let mut status = self.status.lock().expect("status mutex poisoned");
                let _ = status.bitfield.set(piece_index, true);
                drop(status);
                self.maybe_become_interested(stream).await;
            }
            Message::Request { index, begin, length } => {
                self.serve_request(stream, index, begin, length).await;
            }
            Message::Piece { index, begin, block } => {
                self.accept_piece(index, begin, block, handle, events_tx).await;
            }
            Message::Cancel { .. } => {
                // We answer `request`s synchronously, so there is no queued
                // outbound `piece` to cancel.
            }
            Message::Extended { ext_id, .. } => {
                debug!(%self.addr, ext_id, "extended message recognized but not acted on");
            }
        }
        self.first_message_seen = true;
        Ok(())
    }

    fn adopt_remote_bitfield(&mut self, bf: Bitfield) {
        self.status.lock().expect("status mutex poisoned").bitfield = bf;
    }

    async fn maybe_become_interested(&mut self, stream: &mut TcpStream) {
        let (already_interested, lacks_something) = {
            let status = self.status.lock().expect("status mutex poisoned");
            let local = self.local_bitfield.lock().expect("bitfield mutex poisoned");
            let lacks = (0..status.bitfield.piece_count() as u32)
                .any(|i| status.bitfield.get(i) && !local.get(i));
            (status.am_interested, lacks)
        };
        if lacks_something && !already_interested {
            if send_message(stream, &Message::Interested).await.is_ok() {
                self.status.lock().expect("status mutex poisoned").am_interested = true;
                self.last_tx = Instant::now();
            }
        }
    }

    async fn serve_request(&mut self, stream: &mut TcpStream, index: u32, begin: u32, length: u32) {
        let (have_piece, am_choking) = {
            let status = self.status.lock().expect("status mutex poisoned");
            let local = self.local_bitfield.lock().expect("bitfield mutex poisoned");
            (local.get(index), status.am_choking)
        };
        if !have_piece || am_choking || length > crate::config::MAX_BLOCK_SERVE {
            return;
        }
        let block = {
            let mut layer = self.file_layer.lock().await;
            layer.read(index, begin, length)
        };
        if let Ok(block) = block {
            let _ = send_message(stream, &Message::Piece { index, begin, block }).await;
            self.last_tx = Instant::now();
        }
    }

    async fn accept_piece(
        &mut self,
        index: u32,
        begin: u32,
        block: Vec<u8>,
        handle: &SessionHandle,
        events_tx: &mpsc::Sender<SessionEvent>,
    ) {
        let key = (index, begin, block.len() as u32);
        let Some(outstanding) = self.outstanding.remove(&key) else {
            return;
        };
        let duration = outstanding.started_at.elapsed();
        let write_ok = {
            let mut layer = self.file_layer.lock().await;
            layer.write(index, begin, &block).is_ok()
        };
        self.record_outcome(write_ok, duration);
        let _ = events_tx
            .send(SessionEvent::RequestResolved {
                handle: handle.clone(),
                index,
                begin,
                length: key.2,
                success: write_ok,
                duration,
            })
            .await;
    }

    async fn send_request(&mut self, stream: &mut TcpStream, index: u32, begin: u32, length: u32) {
        let ready = self.ready_now();
        if !ready {
            return;
        }
        if send_message(stream, &Message::Request { index, begin, length }).await.is_ok() {
            self.outstanding.insert(
                (index, begin, length),
                Outstanding {
                    started_at: Instant::now(),
                    deadline: Instant::now() + self.config.request_timeout,
                },
            );
            self.last_tx = Instant::now();
        }
    }

    async fn expire_timed_out(
        &mut self,
        stream: &mut TcpStream,
        handle: &SessionHandle,
        events_tx: &mpsc::Sender<SessionEvent>,
    ) {
        let now = Instant::now();
        let expired: Vec<RequestKey> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(outstanding) = self.outstanding.remove(&key) {
                let duration = outstanding.started_at.elapsed();
                self.record_outcome(false, duration);
                let _ = send_message(
                    stream,
                    &Message::Cancel {
                        index: key.0,
                        begin: key.1,
                        length: key.2,
                    },
                )
                .await;
                let _ = events_tx
                    .send(SessionEvent::RequestResolved {
                        handle: handle.clone(),
                        index: key.0,
                        begin: key.1,
                        length: key.2,
                        success: false,
                        duration,
                    })
                    .await;
            }
        }
    }

    /// Records a resolved block request's outcome in the rolling score and,
    /// on failure, pushes `punished_until` out by a score-derived delay so
    /// the peer isn't immediately handed more work (spec's "re-arm the
    /// peer's readiness future, gated by a punishment delay").
    fn record_outcome(&mut self, success: bool, duration: Duration) {
        self.score.update(success, duration);
        if !success {
            let delay = self.score.punishment_delay(self.config.punish_max);
            if delay >= self.config.punish_floor {
                self.punished_until = Instant::now() + delay;
            }
        }
    }

    fn ready_now(&self) -> bool {
        let status = self.status.lock().expect("status mutex poisoned");
        status.am_interested
            && !status.am_choked
            && status.state == PeerState::Active
            && self.outstanding.len() < self.config.max_inflight
            && Instant::now() >= self.punished_until
    }

    async fn update_readiness(&mut self, handle: &SessionHandle, events_tx: &mpsc::Sender<SessionEvent>) {
        let became_ready = {
            let mut status = self.status.lock().expect("status mutex poisoned");
            status.inflight = self.outstanding.len();
            status.success_rate = self.score.success_rate();
            status.avg_duration = self.score.avg_duration();
            let ready_now = status.am_interested
                && !status.am_choked
                && status.state == PeerState::Active
                && self.outstanding.len() < self.config.max_inflight
                && Instant::now() >= self.punished_until;
            let became_ready = ready_now && !status.ready;
            status.ready = ready_now;
            became_ready
        };
        if became_ready {
            let _ = events_tx.send(SessionEvent::Ready(handle.clone())).await;
        }
    }

    fn mark_dead(&mut self) {
        let mut status = self.status.lock().expect("status mutex poisoned");
        status.state = PeerState::Dead;
        status.ready = false;
        info!(%self.addr, "session dead");
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn send_message(stream: &mut TcpStream, message: &Message) -> std::io::Result<()> {
    stream.write_all(&message.to_bytes()).await
}
