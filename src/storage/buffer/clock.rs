use super::replacer::{FrameId, Replacer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Occupied { frame_id: FrameId, referenced: bool },
    /// Frame was pinned while tracked. Kept in place so re-unpinning can revive it.
    Tombstoned { frame_id: FrameId },
}

/// Clock (second-chance) replacement over a fixed ring of slots.
///
/// A newly unpinned frame enters with its reference bit clear. A frame that is
/// pinned and then unpinned again is revived with the bit set, so the sweep skips
/// it once before it can be chosen.
#[derive(Debug)]
pub struct ClockReplacer {
    slots: Vec<Slot>,
    /// Slot index of each tracked frame, indexed by frame id.
    positions: Vec<Option<usize>>,
    hand: usize,
    size: usize,
}

impl ClockReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; capacity],
            positions: vec![None; capacity],
            hand: 0,
            size: 0,
        }
    }

    fn position(&self, frame_id: FrameId) -> Option<usize> {
        self.positions.get(frame_id as usize).copied().flatten()
    }

    fn advance(&mut self) {
        self.hand = (self.hand + 1) % self.slots.len();
    }

    /// Empty a slot and forget whichever frame it held.
    fn clear_slot(&mut self, slot: usize) {
        if let Slot::Occupied { frame_id, .. } | Slot::Tombstoned { frame_id } = self.slots[slot] {
            self.positions[frame_id as usize] = None;
        }
        self.slots[slot] = Slot::Empty;
    }

    /// First empty or tombstoned slot at or after the hand.
    fn find_open_slot(&self) -> Option<usize> {
        let capacity = self.slots.len();
        (0..capacity)
            .map(|i| (self.hand + i) % capacity)
            .find(|&slot| !matches!(self.slots[slot], Slot::Occupied { .. }))
    }

    fn evict_smallest(&mut self) -> Option<FrameId> {
        let (slot, frame_id) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| match *s {
                Slot::Occupied { frame_id, .. } => Some((slot, frame_id)),
                _ => None,
            })
            .min_by_key(|&(_, frame_id)| frame_id)?;
        self.clear_slot(slot);
        self.size -= 1;
        Some(frame_id)
    }
}

impl Replacer for ClockReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        if self.size == 0 {
            return None;
        }

        // Only slots holding a live candidate count towards the sweep.
        let mut swept = 0;
        while swept < self.size {
            match self.slots[self.hand] {
                Slot::Empty | Slot::Tombstoned { .. } => self.advance(),
                Slot::Occupied {
                    frame_id,
                    referenced: true,
                } => {
                    self.slots[self.hand] = Slot::Occupied {
                        frame_id,
                        referenced: false,
                    };
                    self.advance();
                    swept += 1;
                }
                Slot::Occupied {
                    frame_id,
                    referenced: false,
                } => {
                    let slot = self.hand;
                    self.clear_slot(slot);
                    self.advance();
                    self.size -= 1;
                    return Some(frame_id);
                }
            }
        }

        self.evict_smallest()
    }

    fn pin(&mut self, frame_id: FrameId) {
        let Some(slot) = self.position(frame_id) else {
            return;
        };
        if let Slot::Occupied { .. } = self.slots[slot] {
            self.slots[slot] = Slot::Tombstoned { frame_id };
            self.size -= 1;
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if frame_id as usize >= self.slots.len() {
            return;
        }

        match self.position(frame_id) {
            Some(slot) => {
                if let Slot::Tombstoned { .. } = self.slots[slot] {
                    self.slots[slot] = Slot::Occupied {
                        frame_id,
                        referenced: true,
                    };
                    self.size += 1;
                }
            }
            None => {
                // Each frame holds at most one slot, so an untracked frame always finds one.
                let Some(slot) = self.find_open_slot() else {
                    return;
                };
                self.clear_slot(slot);
                self.slots[slot] = Slot::Occupied {
                    frame_id,
                    referenced: false,
                };
                self.positions[frame_id as usize] = Some(slot);
                self.size += 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.size
    }
}
