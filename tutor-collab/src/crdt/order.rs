//! Document order split into blocks that carry their own counts.
//!
//! ```text
//! sequence:  [ b0 ][ b2 ][ b1 ]          block ids in document order
//! b2:        { arenas: [4, 9, 7], visible: 2 }
//! block_of:  arena → block id            rank: block id → slot in sequence
//! ```
//!
//! A positional query walks the block list summing counts, then scans a
//! single block, so it costs O(n / B + B) rather than O(n).

/// Blocks are split in half once they grow past this.
const BLOCK_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
struct Block {
    arenas: Vec<u32>,
    visible: usize,
}

/// Arena indices in document order, tombstones included.
#[derive(Debug, Clone, Default)]
pub(crate) struct OrderIndex {
    blocks: Vec<Block>,
    sequence: Vec<u32>,
    rank: Vec<u32>,
    block_of: Vec<u32>,
    live: Vec<bool>,
    len: usize,
    visible: usize,
}

impl OrderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units in order, tombstones included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn visible_len(&self) -> usize {
        self.visible
    }

    /// Slot in `sequence` holding order position `pos`, and the offset in
    /// that block. `pos == len` yields `(sequence.len(), 0)`.
    fn seek(&self, pos: usize) -> (usize, usize) {
        let mut remaining = pos;
        for (slot, &id) in self.sequence.iter().enumerate() {
            let len = self.blocks[id as usize].arenas.len();
            if remaining < len {
                return (slot, remaining);
            }
            remaining -= len;
        }
        (self.sequence.len(), 0)
    }

    pub fn get(&self, pos: usize) -> Option<u32> {
        let (slot, offset) = self.seek(pos);
        let id = *self.sequence.get(slot)?;
        self.blocks[id as usize].arenas.get(offset).copied()
    }

    /// Order position of `arena`.
    pub fn position(&self, arena: u32) -> Option<usize> {
        let id = *self.block_of.get(arena as usize)?;
        let block = self.blocks.get(id as usize)?;
        let offset = block.arenas.iter().position(|&a| a == arena)?;
        let slot = self.rank[id as usize] as usize;
        let before: usize = self.sequence[..slot]
            .iter()
            .map(|&b| self.blocks[b as usize].arenas.len())
            .sum();
        Some(before + offset)
    }

    /// Visible units before order position `pos`.
    pub fn visible_before(&self, pos: usize) -> usize {
        let mut remaining = pos;
        let mut count = 0;
        for &id in &self.sequence {
            let block = &self.blocks[id as usize];
            if remaining < block.arenas.len() {
                return count
                    + block.arenas[..remaining]
                        .iter()
                        .filter(|&&a| self.live[a as usize])
                        .count();
            }
            remaining -= block.arenas.len();
            count += block.visible;
        }
        count
    }

    /// Order position and arena of the `n`-th visible unit.
    pub fn nth_visible(&self, n: usize) -> Option<(usize, u32)> {
        let mut remaining = n;
        let mut pos = 0;
        for &id in &self.sequence {
            let block = &self.blocks[id as usize];
            if remaining >= block.visible {
                remaining -= block.visible;
                pos += block.arenas.len();
                continue;
            }
            for (offset, &arena) in block.arenas.iter().enumerate() {
                if !self.live[arena as usize] {
                    continue;
                }
                if remaining == 0 {
                    return Some((pos + offset, arena));
                }
                remaining -= 1;
            }
        }
        None
    }

    /// Insert `arena` at order position `pos` (clamped to the end).
    pub fn insert(&mut self, pos: usize, arena: u32, visible: bool) {
        let slot_for = arena as usize;
        if self.live.len() <= slot_for {
            self.live.resize(slot_for + 1, false);
            self.block_of.resize(slot_for + 1, 0);
        }
        self.live[slot_for] = visible;

        if self.sequence.is_empty() {
            self.blocks.push(Block::default());
            self.sequence.push(0);
            self.rank.push(0);
        }
        let (mut slot, mut offset) = self.seek(pos.min(self.len));
        if slot == self.sequence.len() {
            slot -= 1;
            offset = self.blocks[self.sequence[slot] as usize].arenas.len();
        }

        let id = self.sequence[slot];
        let block = &mut self.blocks[id as usize];
        block.arenas.insert(offset, arena);
        if visible {
            block.visible += 1;
            self.visible += 1;
        }
        let overfull = block.arenas.len() > BLOCK_CAPACITY;
        self.block_of[slot_for] = id;
        self.len += 1;

        if overfull {
            self.split(slot);
        }
    }

    fn split(&mut self, slot: usize) {
        let id = self.sequence[slot] as usize;
        let half = self.blocks[id].arenas.len() / 2;
        let tail = self.blocks[id].arenas.split_off(half);
        let moved = tail.iter().filter(|&&a| self.live[a as usize]).count();
        self.blocks[id].visible -= moved;

        let new_id = self.blocks.len() as u32;
        for &arena in &tail {
            self.block_of[arena as usize] = new_id;
        }
        self.blocks.push(Block { arenas: tail, visible: moved });
        self.sequence.insert(slot + 1, new_id);
        self.rank.push(0);
        for (rank, &block) in self.sequence.iter().enumerate().skip(slot + 1) {
            self.rank[block as usize] = rank as u32;
        }
    }

    /// Tombstone `arena`. Returns false if unknown or already hidden.
    pub fn hide(&mut self, arena: u32) -> bool {
        match self.live.get_mut(arena as usize) {
            Some(live) if *live => *live = false,
            _ => return false,
        }
        let id = self.block_of[arena as usize] as usize;
        self.blocks[id].visible -= 1;
        self.visible -= 1;
        true
    }

    /// Arenas from order position `pos` to the end.
    pub fn iter_from(&self, pos: usize) -> impl Iterator<Item = u32> + '_ {
        let (slot, offset) = self.seek(pos);
        self.sequence[slot..]
            .iter()
            .enumerate()
            .flat_map(move |(i, &id)| {
                let skip = if i == 0 { offset } else { 0 };
                self.blocks[id as usize].arenas[skip..].iter().copied()
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.iter_from(0)
    }
}
