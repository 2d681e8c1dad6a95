use std::fmt;

use crate::error::{Result, SwarmError};

/// Size of one replication block (1 MiB). The last block of a file is shorter.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    Downloading,
    Done,
}

impl BlockState {
    /// Digit used in the status file.
    pub fn as_digit(self) -> char {
        match self {
            BlockState::Empty => '0',
            BlockState::Downloading => '1',
            BlockState::Done => '2',
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(BlockState::Empty),
            '1' => Some(BlockState::Downloading),
            '2' => Some(BlockState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockState::Empty => write!(f, "empty"),
            BlockState::Downloading => write!(f, "downloading"),
            BlockState::Done => write!(f, "done"),
        }
    }
}

/// Number of blocks needed to hold `size` bytes.
pub fn block_count(size: u64) -> usize {
    size.div_ceil(BLOCK_SIZE) as usize
}

/// Byte offset and exact length of `block` in a file of `size` bytes, or
/// `None` when the block lies past the end of the file.
pub fn block_span(size: u64, block: usize) -> Option<(u64, usize)> {
    let offset = (block as u64).checked_mul(BLOCK_SIZE)?;
    if offset >= size {
        return None;
    }
    Some((offset, BLOCK_SIZE.min(size - offset) as usize))
}

/// Per-file block state array with a cached count of finished blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStates {
    states: Vec<BlockState>,
    done: usize,
}

impl BlockStates {
    pub fn new(n_blocks: usize) -> Self {
        Self {
            states: vec![BlockState::Empty; n_blocks],
            done: 0,
        }
    }

    /// Fresh (all empty) states sized for a file of `size` bytes.
    pub fn for_size(size: u64) -> Self {
        Self::new(block_count(size))
    }

    pub fn set(&mut self, block: usize, state: BlockState) -> Result<()> {
        let current = self.get(block)?;
        if current != BlockState::Done && state == BlockState::Done {
            self.done += 1;
        } else if current == BlockState::Done && state != BlockState::Done {
            self.done -= 1;
        }
        self.states[block] = state;
        Ok(())
    }

    pub fn get(&self, block: usize) -> Result<BlockState> {
        self.states
            .get(block)
            .copied()
            .ok_or_else(|| SwarmError::Format(format!("Invalid block id {}", block)))
    }

    /// Append states loaded from a status file.
    pub fn append_states(&mut self, states: &[BlockState]) {
        self.done += states.iter().filter(|s| **s == BlockState::Done).count();
        self.states.extend_from_slice(states);
    }

    /// Reassign every block to `state`, resizing to `n_blocks`.
    pub fn set_size(&mut self, n_blocks: usize, state: BlockState) {
        self.states = vec![state; n_blocks];
        self.done = if state == BlockState::Done { n_blocks } else { 0 };
    }

    pub fn reset(&mut self) {
        let n = self.states.len();
        self.set_size(n, BlockState::Empty);
    }

    pub fn finished(&self) -> bool {
        self.done == self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn done_count(&self) -> usize {
        self.done
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockState> + '_ {
        self.states.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_only_when_all_done() {
        for n in 0..6 {
            let mut blocks = BlockStates::new(n);
            assert_eq!(blocks.finished(), n == 0);
            for i in 0..n {
                assert!(!blocks.finished());
                blocks.set(i, BlockState::Done).unwrap();
            }
            assert!(blocks.finished());
        }
    }

    #[test]
    fn done_to_done_does_not_double_count() {
        let mut blocks = BlockStates::new(2);
        blocks.set(0, BlockState::Done).unwrap();
        blocks.set(0, BlockState::Done).unwrap();
        assert_eq!(blocks.done_count(), 1);
        assert!(!blocks.finished());

        blocks.set(1, BlockState::Done).unwrap();
        assert!(blocks.finished());
        blocks.set(1, BlockState::Done).unwrap();
        assert!(blocks.finished());
    }

    #[test]
    fn leaving_done_uncounts_block() {
        let mut blocks = BlockStates::new(1);
        blocks.set(0, BlockState::Done).unwrap();
        blocks.set(0, BlockState::Empty).unwrap();
        assert_eq!(blocks.done_count(), 0);
        assert!(!blocks.finished());
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let mut blocks = BlockStates::new(3);
        assert!(blocks.get(3).is_err());
        assert!(blocks.set(7, BlockState::Done).is_err());
        assert_eq!(blocks.done_count(), 0);
    }

    #[test]
    fn append_and_resize_keep_counter_consistent() {
        let mut blocks = BlockStates::default();
        blocks.append_states(&[BlockState::Done, BlockState::Empty, BlockState::Done]);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks.done_count(), 2);

        blocks.set_size(4, BlockState::Done);
        assert!(blocks.finished());

        blocks.reset();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks.done_count(), 0);
        assert!(blocks.iter().all(|s| s == BlockState::Empty));
    }

    #[test]
    fn spans_cover_file_exactly() {
        let size = 2 * BLOCK_SIZE + BLOCK_SIZE / 2;
        assert_eq!(block_count(size), 3);
        assert_eq!(block_span(size, 0), Some((0, BLOCK_SIZE as usize)));
        assert_eq!(block_span(size, 1), Some((BLOCK_SIZE, BLOCK_SIZE as usize)));
        assert_eq!(
            block_span(size, 2),
            Some((2 * BLOCK_SIZE, (BLOCK_SIZE / 2) as usize))
        );
        assert_eq!(block_span(size, 3), None);
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(BLOCK_SIZE), 1);
    }
}
