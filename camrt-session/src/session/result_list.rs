//! Result holder list
//!
//! Ring-buffer slab of [`SessionResultHolder`]s indexed by
//! `sequence_id % capacity`. Holders enter at the tail in strictly
//! increasing sequence order and leave from the head. Gaps are allowed
//! (a request that could not be tracked leaves its sequence id unused).
//!
//! The list also owns the per-stream FIFO trackers that decide which
//! sequence id may deliver the next buffer on each stream.

use super::result_holder::SessionResultHolder;
use crate::error::{Error, Result};
use crate::types::{SequenceId, StreamId};
use std::collections::{HashMap, VecDeque};

/// Per-stream queue of sequence ids still owed a buffer
#[derive(Debug, Default)]
pub struct StreamTracker {
    pending: HashMap<StreamId, VecDeque<SequenceId>>,
}

impl StreamTracker {
    pub fn register(&mut self, stream: StreamId, sequence_id: SequenceId) {
        self.pending.entry(stream).or_default().push_back(sequence_id);
    }

    /// Next sequence id expected to deliver on `stream`
    pub fn next_expected(&self, stream: StreamId) -> Option<SequenceId> {
        self.pending.get(&stream).and_then(|q| q.front().copied())
    }

    pub fn is_next(&self, stream: StreamId, sequence_id: SequenceId) -> bool {
        self.next_expected(stream) == Some(sequence_id)
    }

    /// Pop `sequence_id` from the front of `stream`; false if it was not next
    pub fn advance(&mut self, stream: StreamId, sequence_id: SequenceId) -> bool {
        match self.pending.get_mut(&stream) {
            Some(queue) if queue.front() == Some(&sequence_id) => {
                queue.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Forget `sequence_id` on every stream
    pub fn remove_sequence(&mut self, sequence_id: SequenceId) {
        for queue in self.pending.values_mut() {
            queue.retain(|&id| id != sequence_id);
        }
    }

    /// Streams still owed a buffer, in id order
    pub fn active_streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self
            .pending
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(stream, _)| *stream)
            .collect();
        streams.sort_unstable();
        streams
    }

    pub fn pending_on(&self, stream: StreamId) -> usize {
        self.pending.get(&stream).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(VecDeque::is_empty)
    }
}

pub struct ResultHolderList {
    slots: Vec<Option<SessionResultHolder>>,
    head: Option<SequenceId>,
    tail: Option<SequenceId>,
    len: usize,
    streams: StreamTracker,
}

impl ResultHolderList {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: None,
            tail: None,
            len: 0,
            streams: StreamTracker::default(),
        }
    }

    fn index(&self, sequence_id: SequenceId) -> usize {
        sequence_id as usize % self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head_sequence_id(&self) -> Option<SequenceId> {
        self.head
    }

    pub fn tail_sequence_id(&self) -> Option<SequenceId> {
        self.tail
    }

    /// Check that `sequence_id` could be appended without consuming a holder
    ///
    /// Sequence ids wrap, so ordering is judged by wrapping distance.
    pub fn check_insert(&self, sequence_id: SequenceId) -> Result<()> {
        if let Some(tail) = self.tail {
            let ahead = sequence_id.wrapping_sub(tail);
            if ahead == 0 || ahead > SequenceId::MAX / 2 {
                return Err(Error::InvalidState(format!(
                    "sequence {} inserted after tail {}",
                    sequence_id, tail
                )));
            }
        }
        if let Some(head) = self.head {
            if sequence_id.wrapping_sub(head) as usize >= self.slots.len() {
                return Err(Error::NoMemory(format!(
                    "result list span exceeds {} entries",
                    self.slots.len()
                )));
            }
        }
        if self.slots[self.index(sequence_id)].is_some() {
            return Err(Error::NoMemory(format!(
                "result list slot for sequence {} still in use",
                sequence_id
            )));
        }
        Ok(())
    }

    /// Append at the tail
    pub fn push_back(&mut self, holder: SessionResultHolder) -> Result<()> {
        let sequence_id = holder.sequence_id;
        self.check_insert(sequence_id)?;

        let index = self.index(sequence_id);
        self.slots[index] = Some(holder);
        self.head.get_or_insert(sequence_id);
        self.tail = Some(sequence_id);
        self.len += 1;
        Ok(())
    }

    pub fn front(&self) -> Option<&SessionResultHolder> {
        self.head.and_then(|seq| self.get(seq))
    }

    pub fn pop_front(&mut self) -> Option<SessionResultHolder> {
        let head = self.head?;
        let index = self.index(head);
        let holder = self.slots[index].take();
        self.len -= 1;

        // Advance to the next occupied slot, skipping gaps
        self.head = None;
        if self.len > 0 {
            if let Some(tail) = self.tail {
                let mut next = head.wrapping_add(1);
                loop {
                    if self.get(next).is_some() {
                        self.head = Some(next);
                        break;
                    }
                    if next == tail {
                        break;
                    }
                    next = next.wrapping_add(1);
                }
            }
        } else {
            self.tail = None;
        }
        holder
    }

    /// Pop every resolved holder at the head, stopping at the first unresolved one
    pub fn pop_resolved(&mut self) -> Vec<SessionResultHolder> {
        let mut popped = Vec::new();
        while self.front().is_some_and(SessionResultHolder::is_resolved) {
            if let Some(holder) = self.pop_front() {
                popped.push(holder);
            }
        }
        popped
    }

    pub fn get(&self, sequence_id: SequenceId) -> Option<&SessionResultHolder> {
        self.slots[self.index(sequence_id)]
            .as_ref()
            .filter(|h| h.sequence_id == sequence_id)
    }

    pub fn get_mut(&mut self, sequence_id: SequenceId) -> Option<&mut SessionResultHolder> {
        let index = self.index(sequence_id);
        self.slots[index]
            .as_mut()
            .filter(|h| h.sequence_id == sequence_id)
    }

    /// Holders in ascending sequence order
    pub fn iter(&self) -> impl Iterator<Item = &SessionResultHolder> {
        let split = self.head.map_or(0, |seq| self.index(seq));
        let (wrapped, from_head) = self.slots.split_at(split);
        from_head.iter().chain(wrapped.iter()).filter_map(Option::as_ref)
    }

    /// Mutable holders in ascending sequence order, plus the stream trackers
    pub fn split_mut(
        &mut self,
    ) -> (
        impl Iterator<Item = &mut SessionResultHolder>,
        &mut StreamTracker,
    ) {
        let split = self.head.map_or(0, |seq| seq as usize % self.slots.len());
        let (wrapped, from_head) = self.slots.split_at_mut(split);
        let holders = from_head
            .iter_mut()
            .chain(wrapped.iter_mut())
            .filter_map(Option::as_mut);
        (holders, &mut self.streams)
    }

    pub fn streams(&self) -> &StreamTracker {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamTracker {
        &mut self.streams
    }

    /// Remove everything, returning the holders in order
    pub fn drain(&mut self) -> Vec<SessionResultHolder> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(holder) = self.pop_front() {
            drained.push(holder);
        }
        self.streams.clear();
        drained
    }
}
