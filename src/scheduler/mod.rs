//! The per-torrent scheduler: admits pieces for download, dispatches block
//! requests to ready peers, and verifies completed pieces.
use crate::config::Config;
use crate::file::SharedFileLayer;
use crate::peer::{Bitfield, PeerSession, PeerState, SessionEvent, SessionHandle};
use crate::torrent::{Metainfo, PieceInfo};
use crate::tracker::PeerInfo;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One block within an [`ActivePiece`]'s request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub begin: u32,
    pub length: u32,
}

/// A piece currently being downloaded: a queue of not-yet-taken blocks plus
/// a count of blocks handed out but not yet resolved.
pub struct ActivePiece {
    pub piece_info: PieceInfo,
    queue: VecDeque<BlockRequest>,
    taken: usize,
    total_blocks: usize,
}

impl ActivePiece {
    fn new(piece_info: PieceInfo) -> Self {
        let mut queue = VecDeque::new();
        let mut offset = 0u32;
        while offset < piece_info.length {
            let length = (piece_info.length - offset).min(crate::config::MAX_BLOCK);
            queue.push_back(BlockRequest { begin: offset, length });
            offset += length;
        }
        let total_blocks = queue.len();
        ActivePiece {
            piece_info,
            queue,
            taken: 0,
            total_blocks,
        }
    }

    fn pop_block(&mut self) -> Option<BlockRequest> {
        let block = self.queue.pop_front();
        if block.is_some() {
            self.taken += 1;
        }
        block
    }

    fn return_block(&mut self, block: BlockRequest) {
        self.taken = self.taken.saturating_sub(1);
        self.queue.push_back(block);
    }

    fn resolve_success(&mut self) {
        self.taken = self.taken.saturating_sub(1);
    }

    fn is_drainable(&self) -> bool {
        self.queue.is_empty() && self.taken == 0
    }

    /// `inflight + |queue| + completed_blocks == total_blocks_in_piece`.
    #[cfg(test)]
    fn block_count_invariant_holds(&self) -> bool {
        let completed_blocks = self.total_blocks - self.queue.len() - self.taken;
        self.taken + self.queue.len() + completed_blocks == self.total_blocks
    }
}

/// Owns a single torrent's lifetime: the set of active pieces, the set of
/// live peer sessions, and the dispatch loop that pairs them up.
pub struct Scheduler {
    metainfo: Metainfo,
    config: Config,
    file_layer: SharedFileLayer,
    local_peer_id: [u8; 20],
    local_bitfield: Arc<Mutex<Bitfield>>,

    pending: Vec<usize>,
    active: HashMap<u32, ActivePiece>,
    peers: HashMap<SocketAddr, SessionHandle>,

    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

impl Scheduler {
    pub fn new(
        metainfo: Metainfo,
        file_layer: SharedFileLayer,
        config: Config,
        local_peer_id: [u8; 20],
        already_complete: Vec<bool>,
    ) -> Self {
        let piece_count = metainfo.num_pieces();
        let mut local_bitfield = Bitfield::new(piece_count);
        let mut pending = Vec::new();
        for (index, complete) in already_complete.into_iter().enumerate() {
            if complete {
                let _ = local_bitfield.set(index as u32, true);
            } else {
                pending.push(index);
            }
        }
        let (events_tx, events_rx) = mpsc::channel(256);
        Scheduler {
            metainfo,
            config,
            file_layer,
            local_peer_id,
            local_bitfield: Arc::new(Mutex::new(local_bitfield)),
            pending,
            active: HashMap::new(),
            peers: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Adds newly discovered tracker peers that aren't already connected.
    pub fn add_peers(&mut self, discovered: Vec<PeerInfo>) {
        for peer in discovered {
            let addr = peer.socket_addr();
            if self.peers.contains_key(&addr) {
                continue;
            }
            let handle = PeerSession::spawn(
                addr,
                self.metainfo.info_hash,
                self.local_peer_id,
                self.metainfo.num_pieces(),
                self.local_bitfield.clone(),
                self.file_layer.clone(),
                self.config.clone(),
                self.events_tx.clone(),
            );
            self.peers.insert(addr, handle);
        }
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    /// Runs the admission/dispatch/verification loop until every piece is
    /// complete. Tracker feeds run independently and call [`add_peers`] as
    /// they discover endpoints.
    ///
    /// [`add_peers`]: Scheduler::add_peers
    pub async fn run(&mut self, mut peer_feed: mpsc::Receiver<Vec<PeerInfo>>) {
        loop {
            self.admit_pending_pieces();

            if self.is_complete() && self.peers.is_empty() {
                info!("torrent complete");
                return;
            }

            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => return,
                    }
                }
                discovered = peer_feed.recv() => {
                    match discovered {
                        Some(peers) => self.add_peers(peers),
                        None => {}
                    }
                }
                _ = tokio::time::sleep(self.config.progress_tick) => {
                    self.log_progress();
                }
            }

            self.dispatch_pass().await;

            if self.is_complete() {
                info!("torrent complete");
                return;
            }
        }
    }

    fn admit_pending_pieces(&mut self) {
        while self.active.len() < self.config.max_active_pieces && !self.pending.is_empty() {
            let pick = rand::rng().random_range(0..self.pending.len());
            let index = self.pending.swap_remove(pick);
            let Some(piece_info) = self.metainfo.piece_info(index) else { continue };
            self.active.insert(index as u32, ActivePiece::new(piece_info));
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Ready(_handle) => {
                // Dispatch pass after the select! arm runs for every event anyway.
            }
            SessionEvent::Dead { handle, returned } => {
                self.peers.remove(&handle.addr);
                for (index, begin, length) in returned {
                    if let Some(active) = self.active.get_mut(&index) {
                        active.return_block(BlockRequest { begin, length });
                    }
                }
            }
            SessionEvent::RequestResolved {
                handle: _,
                index,
                begin,
                length,
                success,
                duration: _,
            } => {
                let drainable = if let Some(active) = self.active.get_mut(&index) {
                    if success {
                        active.resolve_success();
                    } else {
                        active.return_block(BlockRequest { begin, length });
                    }
                    active.is_drainable()
                } else {
                    false
                };
                if drainable {
                    self.verify_piece(index).await;
                }
            }
        }
    }

    async fn verify_piece(&mut self, index: u32) {
        let Some(active) = self.active.remove(&index) else { return };
        let piece = active.piece_info;
        let data = {
            let mut layer = self.file_layer.lock().await;
            layer.read(piece.index, 0, piece.length)
        };
        let matches = match data {
            Ok(bytes) => {
                let mut hasher = Sha1::new();
                hasher.update(&bytes);
                let digest: [u8; 20] = hasher.finalize().into();
                digest == piece.hash
            }
            Err(_) => false,
        };

        if matches {
            {
                let mut bitfield = self.local_bitfield.lock().expect("bitfield mutex poisoned");
                let _ = bitfield.set(index, true);
            }
            info!(piece = index, "piece verified");
            for handle in self.peers.values() {
                handle.send_have(index).await;
            }
        } else {
            warn!(piece = index, "hash mismatch, requeuing");
            self.pending.push(index as usize);
        }
    }

    async fn dispatch_pass(&mut self) {
        let mut ranked: Vec<SessionHandle> = self.peers.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.snapshot()
                .success_rate
                .partial_cmp(&a.snapshot().success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for handle in ranked {
            let snapshot = handle.snapshot();
            if snapshot.state != PeerState::Active || !snapshot.ready {
                continue;
            }
            let mut capacity = self.config.max_inflight.saturating_sub(snapshot.inflight);
            while capacity > 0 {
                let Some((piece_index, block)) = self.next_block_for(&snapshot.bitfield) else {
                    break;
                };
                handle.send_request(piece_index, block.begin, block.length).await;
                capacity -= 1;
            }
        }
    }

    fn next_block_for(&mut self, bitfield: &Bitfield) -> Option<(u32, BlockRequest)> {
        for (index, active) in self.active.iter_mut() {
            if !bitfield.get(*index) {
                continue;
            }
            if let Some(block) = active.pop_block() {
                return Some((*index, block));
            }
        }
        None
    }

    fn log_progress(&self) {
        let total = self.metainfo.num_pieces();
        let remaining = self.pending.len() + self.active.len();
        info!(
            complete = total.saturating_sub(remaining),
            total, peers = self.peers.len(),
            "progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_piece_splits_into_max_block_chunks() {
        let piece = PieceInfo {
            index: 0,
            length: crate::config::MAX_BLOCK * 2 + 100,
            hash: [0u8; 20],
        };
        let mut active = ActivePiece::new(piece);
        assert_eq!(active.total_blocks, 3);
        assert!(active.block_count_invariant_holds());

        let b1 = active.pop_block().unwrap();
        assert_eq!(b1.begin, 0);
        assert!(active.block_count_invariant_holds());
        active.resolve_success();
        assert!(active.block_count_invariant_holds());
    }

    #[test]
    fn failed_block_returns_to_queue() {
        let piece = PieceInfo {
            index: 0,
            length: crate::config::MAX_BLOCK,
            hash: [0u8; 20],
        };
        let mut active = ActivePiece::new(piece);
        let block = active.pop_block().unwrap();
        assert!(!active.is_drainable());
        active.return_block(block);
        assert_eq!(active.queue.len(), 1);
        assert_eq!(active.taken, 0);
    }

    #[test]
    fn drainable_only_when_queue_and_taken_are_empty() {
        let piece = PieceInfo {
            index: 0,
            length: 10,
            hash: [0u8; 20],
        };
        let mut active = ActivePiece::new(piece);
        assert!(!active.is_drainable());
        let block = active.pop_block().unwrap();
        assert!(!active.is_drainable());
        active.resolve_success();
        let _ = block;
        assert!(active.is_drainable());
    }
}
