use crate::cell::CircId;
use tracing::warn;

/// Which half of the circuit-id space this end of a channel allocates from.
/// The initiator of a channel takes the high half, the responder the low
/// half; a client that accepted a channel allocates nothing on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircIdType {
    Higher,
    Lower,
    Neither,
}

/// Per-channel allocator of unused circuit ids
#[derive(Debug, Clone)]
pub struct CircIdAllocator {
    id_type: CircIdType,
    wide: bool,
    next_circ_id: u32,
}

impl CircIdAllocator {
    pub fn new(id_type: CircIdType, wide: bool) -> Self {
        Self {
            id_type,
            wide,
            next_circ_id: 1,
        }
    }

    pub fn id_type(&self) -> CircIdType {
        self.id_type
    }

    fn max_range(&self) -> u32 {
        if self.wide {
            1 << 31
        } else {
            1 << 15
        }
    }

    fn high_bit(&self) -> u32 {
        match self.id_type {
            CircIdType::Higher => self.max_range(),
            _ => 0,
        }
    }

    /// Next id not reported in use, scanning the space at most once.
    /// Returns `None` once every id in our half is taken.
    pub fn allocate(&mut self, in_use: impl Fn(CircId) -> bool) -> Option<CircId> {
        if self.id_type == CircIdType::Neither {
            warn!("Bug: Trying to pick a circuit id on a channel where we never allocate");
            return None;
        }
        let max_range = self.max_range();
        let high_bit = self.high_bit();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if attempts > max_range {
                warn!("No unused circuit ids on channel; giving up");
                return None;
            }
            let mut test_id = self.next_circ_id;
            self.next_circ_id = self.next_circ_id.wrapping_add(1);
            if test_id == 0 || test_id >= max_range {
                test_id = 1;
                self.next_circ_id = 2;
            }
            let candidate = CircId(test_id | high_bit);
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
    }

    /// Whether `id` lies in the half of the space we allocate from. A peer
    /// must never open a circuit with such an id.
    pub fn belongs_to_us(&self, id: CircId) -> bool {
        let is_high = id.0 & self.max_range() != 0;
        match self.id_type {
            CircIdType::Higher => is_high,
            CircIdType::Lower => !is_high,
            CircIdType::Neither => false,
        }
    }
}
