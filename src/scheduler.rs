//! Global block-request bookkeeping.
//!
//! The scheduler owns one table mapping every block the host still needs to
//! the set of peers it has been requested from. Sessions claim blocks from
//! it under a lock and send the wire requests afterwards, so no block is
//! ever dispatched to two peers at once. Selection is strictly
//! first-available in piece-then-offset order; a block becomes claimable
//! again only when the peer holding it chokes or disconnects, or when its
//! piece fails validation.
use crate::bitfield::Bitfield;
use crate::peer::PeerId;
use crate::torrent::metainfo::Metainfo;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Blocks are 16 KiB; the final block of the final piece may be shorter.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// How many requests a session keeps in flight per peer.
pub const PIPELINE_DEPTH: usize = 8;

/// One block: a contiguous sub-range of a piece. The derived ordering is
/// piece index first, then offset, which is exactly the sweep order the
/// request table iterates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug)]
pub struct Scheduler {
    table: BTreeMap<BlockRequest, HashSet<PeerId>>,
}

impl Scheduler {
    /// Enumerates every block of every piece missing from `own` up front.
    pub fn new(meta: &Metainfo, own: &Bitfield) -> Scheduler {
        let mut table = BTreeMap::new();
        for index in 0..meta.num_pieces() {
            if !own.has(index) {
                for req in blocks_of(meta, index as u32) {
                    table.insert(req, HashSet::new());
                }
            }
        }
        debug!(blocks = table.len(), "request table built");
        Scheduler { table }
    }

    /// Claims up to `PIPELINE_DEPTH - in_flight` blocks for `peer_id`:
    /// the first table entries, in order, that the peer can serve
    /// (`peer_bits AND NOT own_bits`) and that no peer has been asked for.
    ///
    /// The claim happens here, inside the table; the caller records the
    /// returned requests in its in-flight set and puts them on the wire.
    pub fn next_requests(
        &mut self,
        peer_id: &PeerId,
        peer_bits: &Bitfield,
        own_bits: &Bitfield,
        in_flight: usize,
    ) -> Vec<BlockRequest> {
        let mut claimed = Vec::new();
        let useful = peer_bits.and_not(own_bits);
        if !useful.any() {
            return claimed;
        }
        while in_flight + claimed.len() < PIPELINE_DEPTH {
            let next = self
                .table
                .iter_mut()
                .find(|(req, peers)| useful.has(req.index as usize) && peers.is_empty());
            match next {
                Some((req, peers)) => {
                    peers.insert(*peer_id);
                    claimed.push(*req);
                }
                None => break,
            }
        }
        claimed
    }

    /// The peer choked us: its claims on the given in-flight blocks are
    /// released so another peer may pick them up.
    pub fn on_choke(&mut self, peer_id: &PeerId, in_flight: &HashSet<BlockRequest>) {
        for req in in_flight {
            if let Some(peers) = self.table.get_mut(req) {
                peers.remove(peer_id);
                debug!(?req, "released block after choke");
            }
        }
    }

    /// The peer is gone: every claim it held anywhere is released.
    pub fn on_disconnect(&mut self, peer_id: &PeerId) {
        for peers in self.table.values_mut() {
            peers.remove(peer_id);
        }
    }

    /// A block arrived and was written. Pops its table entry and reports
    /// whether the piece now has no outstanding blocks, in which case the
    /// caller validates it.
    pub fn on_block_received(&mut self, peer_id: &PeerId, req: &BlockRequest) -> bool {
        if let Some(peers) = self.table.remove(req) {
            // Only one peer is ever asked for a block.
            debug_assert!(peers.len() == 1 && peers.contains(peer_id));
        }
        !self.piece_has_entries(req.index)
    }

    /// Puts every block of a piece back with no claims, after the piece
    /// failed validation.
    pub fn requeue_piece(&mut self, meta: &Metainfo, index: u32) {
        for req in blocks_of(meta, index) {
            self.table.insert(req, HashSet::new());
        }
        debug!(piece = index, "requeued piece");
    }

    pub fn is_drained(&self) -> bool {
        self.table.is_empty()
    }

    fn piece_has_entries(&self, index: u32) -> bool {
        let start = BlockRequest {
            index,
            begin: 0,
            length: 0,
        };
        self.table
            .range(start..)
            .take_while(|(req, _)| req.index == index)
            .next()
            .is_some()
    }
}

/// The blocks of one piece in offset order: 16 KiB each, the tail shorter
/// when the piece size is not a multiple.
fn blocks_of(meta: &Metainfo, index: u32) -> impl Iterator<Item = BlockRequest> {
    let piece_size = meta.piece_size(index as usize);
    (0..piece_size).step_by(BLOCK_SIZE as usize).map(move |offset| {
        BlockRequest {
            index,
            begin: offset as u32,
            length: (piece_size - offset).min(BLOCK_SIZE as u64) as u32,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::sha1;
    use std::sync::Arc;

    /// Three pieces of two blocks each, except where noted.
    fn meta(piece_length: u64, total: u64, pieces: usize) -> Arc<Metainfo> {
        Arc::new(Metainfo {
            name: "t".to_string(),
            info_hash: [0u8; 20],
            piece_length,
            hashes: vec![sha1(b""); pieces],
            total,
        })
    }

    fn full_bits(n: usize) -> Bitfield {
        let mut bits = Bitfield::new(n);
        for i in 0..n {
            bits.set(i);
        }
        bits
    }

    #[test]
    fn enumerates_blocks_in_sweep_order_with_short_tail() {
        // 40,000 bytes in 2^14-byte pieces: two full pieces and a tail
        // piece of 7232 bytes.
        let meta = meta(1 << 14, 40_000, 3);
        let sched = Scheduler::new(&meta, &Bitfield::new(3));
        let reqs: Vec<BlockRequest> = sched.table.keys().copied().collect();
        assert_eq!(
            reqs,
            vec![
                BlockRequest { index: 0, begin: 0, length: 1 << 14 },
                BlockRequest { index: 1, begin: 0, length: 1 << 14 },
                BlockRequest { index: 2, begin: 0, length: 7232 },
            ]
        );
    }

    #[test]
    fn two_seeders_get_disjoint_pipelines_over_the_first_pieces() {
        // Pieces of 2^15 split into two 16 KiB blocks each; pipeline depth
        // capped at 2 by passing in_flight = PIPELINE_DEPTH - 2.
        let meta = meta(1 << 15, 3 << 15, 3);
        let mut sched = Scheduler::new(&meta, &Bitfield::new(3));
        let own = Bitfield::new(3);
        let seeder = full_bits(3);
        let head_start = PIPELINE_DEPTH - 2;

        let a = sched.next_requests(&[0xaa; 20], &seeder, &own, head_start);
        let b = sched.next_requests(&[0xbb; 20], &seeder, &own, head_start);

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        let all: HashSet<BlockRequest> = a.iter().chain(b.iter()).copied().collect();
        assert_eq!(all.len(), 4, "a block was dispatched twice");
        // The four claims cover the first two pieces in offset order.
        assert_eq!(
            a,
            vec![
                BlockRequest { index: 0, begin: 0, length: 1 << 14 },
                BlockRequest { index: 0, begin: 1 << 14, length: 1 << 14 },
            ]
        );
        assert_eq!(
            b,
            vec![
                BlockRequest { index: 1, begin: 0, length: 1 << 14 },
                BlockRequest { index: 1, begin: 1 << 14, length: 1 << 14 },
            ]
        );
    }

    #[test]
    fn claims_only_pieces_the_peer_has() {
        let meta = meta(1 << 14, 3 << 14, 3);
        let mut sched = Scheduler::new(&meta, &Bitfield::new(3));
        let own = Bitfield::new(3);
        let mut peer_bits = Bitfield::new(3);
        peer_bits.set(2);

        let reqs = sched.next_requests(&[1u8; 20], &peer_bits, &own, 0);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].index, 2);

        // A peer with nothing useful gets nothing.
        assert!(sched
            .next_requests(&[2u8; 20], &Bitfield::new(3), &own, 0)
            .is_empty());
    }

    #[test]
    fn choke_releases_claims_for_other_peers() {
        let meta = meta(1 << 14, 2 << 14, 2);
        let mut sched = Scheduler::new(&meta, &Bitfield::new(2));
        let own = Bitfield::new(2);
        let seeder = full_bits(2);

        let first = sched.next_requests(&[1u8; 20], &seeder, &own, 0);
        assert_eq!(first.len(), 2);
        // Everything is claimed, so a second peer is starved.
        assert!(sched.next_requests(&[2u8; 20], &seeder, &own, 0).is_empty());

        let in_flight: HashSet<BlockRequest> = first.into_iter().collect();
        sched.on_choke(&[1u8; 20], &in_flight);
        let retry = sched.next_requests(&[2u8; 20], &seeder, &own, 0);
        assert_eq!(retry.len(), 2);
    }

    #[test]
    fn disconnect_releases_every_claim() {
        let meta = meta(1 << 14, 2 << 14, 2);
        let mut sched = Scheduler::new(&meta, &Bitfield::new(2));
        let seeder = full_bits(2);
        let own = Bitfield::new(2);

        sched.next_requests(&[1u8; 20], &seeder, &own, 0);
        sched.on_disconnect(&[1u8; 20]);
        assert_eq!(
            sched.next_requests(&[2u8; 20], &seeder, &own, 0).len(),
            2
        );
    }

    #[test]
    fn block_receipt_signals_piece_completion() {
        let meta = meta(1 << 15, 1 << 15, 1);
        let mut sched = Scheduler::new(&meta, &Bitfield::new(1));
        let seeder = full_bits(1);
        let own = Bitfield::new(1);
        let peer = [1u8; 20];

        let reqs = sched.next_requests(&peer, &seeder, &own, 0);
        assert_eq!(reqs.len(), 2);
        assert!(!sched.on_block_received(&peer, &reqs[0]));
        assert!(sched.on_block_received(&peer, &reqs[1]));
        assert!(sched.is_drained());
    }

    #[test]
    fn requeue_restores_all_blocks_of_a_piece() {
        let meta = meta(1 << 15, 1 << 15, 1);
        let mut sched = Scheduler::new(&meta, &Bitfield::new(1));
        let seeder = full_bits(1);
        let own = Bitfield::new(1);
        let peer = [1u8; 20];

        for req in sched.next_requests(&peer, &seeder, &own, 0) {
            sched.on_block_received(&peer, &req);
        }
        assert!(sched.is_drained());

        sched.requeue_piece(&meta, 0);
        assert_eq!(sched.next_requests(&peer, &seeder, &own, 0).len(), 2);
    }
}
