//! Block selection after Unchoke.
//!
//! The original source hard-codes the next block to request; spec.md §9
//! surfaces this as an external seam instead so a real client can plug in
//! rarest-first or any other strategy without touching the state machine.

use crate::bitfield::Bitfield;

/// Fixed request size used by every implementation in practice (BEP-3 does
/// not mandate it, but 16 KiB is the value every mainline client requests).
pub const BLOCK_LENGTH: u32 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Decides which block to request next from a peer whose bitfield we know.
/// `num_pieces` bounds the search; the policy must not propose an
/// out-of-range piece index.
pub trait BlockSelectionPolicy: Send + Sync {
    fn next_block(&self, remote_bitfield: &Bitfield, num_pieces: usize) -> Option<Block>;
}

/// Requests block 0 of the first piece the peer has, per spec.md §4.F's
/// seed policy. Ignores what has already been fetched across connections —
/// real clients track that separately; this policy only needs to pick a
/// piece the peer actually has.
#[derive(Debug, Default)]
pub struct FirstUnfetched;

impl BlockSelectionPolicy for FirstUnfetched {
    fn next_block(&self, remote_bitfield: &Bitfield, num_pieces: usize) -> Option<Block> {
        (0..num_pieces).find(|&i| remote_bitfield.get(i)).map(|i| Block {
            piece_index: i as u32,
            begin: 0,
            length: BLOCK_LENGTH,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_first_piece_the_peer_has() {
        let mut bf = Bitfield::new(10);
        bf.set(3, true);
        bf.set(5, true);
        let block = FirstUnfetched.next_block(&bf, 10).unwrap();
        assert_eq!(
            block,
            Block {
                piece_index: 3,
                begin: 0,
                length: BLOCK_LENGTH,
            }
        );
    }

    #[test]
    fn returns_none_when_peer_has_nothing() {
        let bf = Bitfield::new(10);
        assert_eq!(FirstUnfetched.next_block(&bf, 10), None);
    }
}
