//! Sequence table
//!
//! Every posted command occupies one slot until its response has been
//! handled. The slot id travels in the header's `seq_id` and is how the
//! response dispatcher finds the completion to run.
//!
//! ```text
//! Free ──acquire──▶ Pending ──enqueued──▶ Used ──response──▶ Free
//!                      │                   │
//!                      └──post failed──▶ Free   └──cancel──▶ Cancelled ──response──▶ Free
//! ```

use crate::dmem::DmemRegion;
use crate::error::{PmuError, Result};
use crate::wire::PmuMsg;
use bytes::Bytes;

/// Number of sequence slots; `seq_id` is a byte.
pub const MAX_SEQUENCES: usize = 256;

const BITMAP_WORDS: usize = MAX_SEQUENCES / 64;

/// Caller-visible handle for a posted command.
pub type SeqDesc = u32;

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    /// Available
    Free,
    /// Allocated, command not yet in a queue
    Pending,
    /// Command in flight
    Used,
    /// Command in flight, completion suppressed
    Cancelled,
}

/// What a completion receives for a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The response message
    pub msg: PmuMsg,
    /// Bytes copied back from the output payload region, if any
    pub out_payload: Option<Bytes>,
}

impl Response {
    /// First body word, the conventional status field of generic replies.
    pub fn status(&self) -> Option<u32> {
        let b = self.msg.body.get(..4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Handler run exactly once when a command's response arrives.
///
/// Runs on the notification path with no channel lock held.
pub trait Completion: Send {
    /// Deliver the outcome of command `desc`.
    fn complete(self: Box<Self>, desc: SeqDesc, result: Result<Response>);
}

impl<F> Completion for F
where
    F: FnOnce(SeqDesc, Result<Response>) + Send,
{
    fn complete(self: Box<Self>, desc: SeqDesc, result: Result<Response>) {
        (*self)(desc, result);
    }
}

/// One slot.
pub struct Sequence {
    /// Slot id, sent as `seq_id`
    pub id: u8,
    /// Lifecycle state
    pub state: SeqState,
    /// Descriptor handed to the caller
    pub desc: SeqDesc,
    /// Largest response the caller accepts
    pub response_capacity: Option<u32>,
    /// DMEM region holding the input payload
    pub in_region: Option<DmemRegion>,
    /// DMEM region the firmware writes the output payload to
    pub out_region: Option<DmemRegion>,
    /// Output region aliases the input region
    pub out_shared: bool,
    completion: Option<Box<dyn Completion>>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("desc", &self.desc)
            .field("response_capacity", &self.response_capacity)
            .field("in_region", &self.in_region)
            .field("out_region", &self.out_region)
            .field("completion", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}

impl Sequence {
    #[allow(clippy::cast_possible_truncation)]
    const fn empty(id: usize) -> Self {
        Self {
            id: id as u8,
            state: SeqState::Free,
            desc: 0,
            response_capacity: None,
            in_region: None,
            out_region: None,
            out_shared: false,
            completion: None,
        }
    }

    /// Install the completion to run on response.
    pub fn set_completion(&mut self, completion: Option<Box<dyn Completion>>) {
        self.completion = completion;
    }

    /// Remove the completion, leaving none.
    pub fn take_completion(&mut self) -> Option<Box<dyn Completion>> {
        self.completion.take()
    }

    /// Regions to free, with aliased output collapsed into the input region.
    pub fn take_regions(&mut self) -> Vec<DmemRegion> {
        let mut out = Vec::with_capacity(2);
        if let Some(r) = self.in_region.take() {
            out.push(r);
        }
        if let Some(r) = self.out_region.take() {
            if !self.out_shared {
                out.push(r);
            }
        }
        self.out_shared = false;
        out
    }
}

/// Fixed arena of [`MAX_SEQUENCES`] slots with a first-fit bitmap.
#[derive(Debug)]
pub struct SequenceTable {
    slots: Vec<Sequence>,
    bitmap: [u64; BITMAP_WORDS],
    next_desc: SeqDesc,
}

impl Default for SequenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTable {
    /// All slots free.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SEQUENCES).map(Sequence::empty).collect(),
            bitmap: [0; BITMAP_WORDS],
            next_desc: 0,
        }
    }

    /// Free every slot, dropping outstanding completions uninvoked.
    pub fn reset(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            *slot = Sequence::empty(i);
        }
        self.bitmap = [0; BITMAP_WORDS];
    }

    /// Claim the lowest free slot and move it to `Pending`.
    ///
    /// # Errors
    ///
    /// [`PmuError::SequenceExhausted`] if every slot is taken.
    #[allow(clippy::cast_possible_truncation)]
    pub fn acquire(&mut self) -> Result<u8> {
        let (word, bits) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, bits)| **bits != u64::MAX)
            .ok_or_else(|| {
                tracing::warn!("no free sequence available");
                PmuError::SequenceExhausted
            })?;
        let bit = bits.trailing_ones() as usize;
        let id = word * 64 + bit;
        self.bitmap[word] |= 1 << bit;

        let desc = self.next_desc;
        self.next_desc = self.next_desc.wrapping_add(1);

        let slot = &mut self.slots[id];
        *slot = Sequence::empty(id);
        slot.state = SeqState::Pending;
        slot.desc = desc;
        Ok(id as u8)
    }

    /// Return slot `id` to the free pool.
    pub fn release(&mut self, id: u8) {
        let id = usize::from(id);
        self.slots[id] = Sequence::empty(id);
        self.bitmap[id / 64] &= !(1u64 << (id % 64));
    }

    /// Slot `id`.
    pub fn get(&self, id: u8) -> &Sequence {
        &self.slots[usize::from(id)]
    }

    /// Slot `id`, mutably.
    pub fn get_mut(&mut self, id: u8) -> &mut Sequence {
        &mut self.slots[usize::from(id)]
    }

    /// In-flight slot carrying descriptor `desc`.
    pub fn find_by_desc(&self, desc: SeqDesc) -> Option<u8> {
        self.slots
            .iter()
            .find(|s| s.desc == desc && matches!(s.state, SeqState::Used | SeqState::Pending))
            .map(|s| s.id)
    }

    /// Number of slots not `Free`.
    pub fn in_use(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }
}
