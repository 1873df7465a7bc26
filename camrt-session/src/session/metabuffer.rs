//! Pending metabuffer-done queue
//!
//! Tracks, per sequence id, whether metadata and buffers have been
//! delivered. Once every frame of a pipeline request is done, the request's
//! metadata slot becomes releasable: immediately if the pipeline confirmed
//! with a MetaBufferDone callback, otherwise once `max_delay` newer
//! requests of that pipeline have completed.

use crate::types::{RequestId, SequenceId};
use std::collections::BTreeMap;
use tracing::{debug, trace};

pub const META_READY: u8 = 0b01;
pub const BUFFER_READY: u8 = 0b10;
pub const ALL_READY: u8 = META_READY | BUFFER_READY;

#[derive(Debug, Clone)]
struct PendingEntry {
    pipeline_index: usize,
    request_id: RequestId,
    mask: u8,
}

#[derive(Debug, Default, Clone, Copy)]
struct RequestDone {
    frames_pending: u32,
    session_done: bool,
    pipeline_done: bool,
}

#[derive(Debug, Default)]
struct PipelineEntry {
    latest_done_request_id: RequestId,
    requests: BTreeMap<RequestId, RequestDone>,
}

pub(crate) struct PendingMetaBufferDoneQueue {
    ring: Vec<Vec<PendingEntry>>,
    ring_sequence: Vec<Option<SequenceId>>,
    pipelines: Vec<PipelineEntry>,
    max_delay: u32,
}

impl PendingMetaBufferDoneQueue {
    pub fn new(capacity: usize, num_pipelines: usize, max_delay: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: vec![Vec::new(); capacity],
            ring_sequence: vec![None; capacity],
            pipelines: (0..num_pipelines).map(|_| PipelineEntry::default()).collect(),
            max_delay,
        }
    }

    fn slot(&self, sequence_id: SequenceId) -> usize {
        sequence_id as usize % self.ring.len()
    }

    /// Start tracking one frame of `request_id`
    pub fn register(&mut self, sequence_id: SequenceId, pipeline_index: usize, request_id: RequestId) {
        let Some(pipeline) = self.pipelines.get_mut(pipeline_index) else {
            return;
        };
        pipeline.requests.entry(request_id).or_default().frames_pending += 1;

        let slot = self.slot(sequence_id);
        if self.ring_sequence[slot] != Some(sequence_id) {
            self.ring[slot].clear();
            self.ring_sequence[slot] = Some(sequence_id);
        }
        self.ring[slot].push(PendingEntry {
            pipeline_index,
            request_id,
            mask: 0,
        });
    }

    /// Set ready bits for a frame
    pub fn mark(&mut self, sequence_id: SequenceId, pipeline_index: usize, flags: u8) {
        let slot = self.slot(sequence_id);
        if self.ring_sequence[slot] != Some(sequence_id) {
            return;
        }

        let Some(pos) = self.ring[slot]
            .iter()
            .position(|e| e.pipeline_index == pipeline_index)
        else {
            return;
        };

        let entry = &mut self.ring[slot][pos];
        entry.mask |= flags;
        if entry.mask != ALL_READY {
            return;
        }

        let request_id = entry.request_id;
        self.ring[slot].swap_remove(pos);
        if self.ring[slot].is_empty() {
            self.ring_sequence[slot] = None;
        }

        let pipeline = &mut self.pipelines[pipeline_index];
        if let Some(done) = pipeline.requests.get_mut(&request_id) {
            done.frames_pending = done.frames_pending.saturating_sub(1);
            if done.frames_pending == 0 {
                done.session_done = true;
                pipeline.latest_done_request_id = pipeline.latest_done_request_id.max(request_id);
                trace!(pipeline_index, request_id, "Request metadata done");
            }
        }
    }

    /// Pipeline confirmed it no longer uses the slot of `request_id`
    pub fn pipeline_done(&mut self, pipeline_index: usize, request_id: RequestId) {
        match self
            .pipelines
            .get_mut(pipeline_index)
            .and_then(|p| p.requests.get_mut(&request_id))
        {
            Some(done) => done.pipeline_done = true,
            None => debug!(pipeline_index, request_id, "MetaBufferDone for untracked request"),
        }
    }

    /// Requests whose slots may be released now, in request order per pipeline
    pub fn drain_releasable(&mut self) -> Vec<(usize, RequestId)> {
        let mut released = Vec::new();
        for (pipeline_index, pipeline) in self.pipelines.iter_mut().enumerate() {
            while let Some((&request_id, done)) = pipeline.requests.first_key_value() {
                let window_passed = pipeline.latest_done_request_id
                    >= request_id + self.max_delay as RequestId;
                if !(done.session_done && (done.pipeline_done || window_passed)) {
                    break;
                }
                pipeline.requests.remove(&request_id);
                released.push((pipeline_index, request_id));
            }
        }
        released
    }

    /// Drop everything tracked for `pipelines`, returning the requests held
    pub fn release_all(&mut self, pipelines: &[usize]) -> Vec<(usize, RequestId)> {
        let mut released = Vec::new();
        for &pipeline_index in pipelines {
            if let Some(pipeline) = self.pipelines.get_mut(pipeline_index) {
                released.extend(
                    std::mem::take(&mut pipeline.requests)
                        .into_keys()
                        .map(|request_id| (pipeline_index, request_id)),
                );
            }
        }

        for (slot, entries) in self.ring.iter_mut().enumerate() {
            entries.retain(|e| !pipelines.contains(&e.pipeline_index));
            if entries.is_empty() {
                self.ring_sequence[slot] = None;
            }
        }
        released
    }

    /// Requests tracked but not yet released
    pub fn pending(&self) -> usize {
        self.pipelines.iter().map(|p| p.requests.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_waits_for_delay_window() {
        let mut queue = PendingMetaBufferDoneQueue::new(16, 1, 2);
        for seq in 0..3 {
            queue.register(seq, 0, seq as RequestId + 1);
        }

        queue.mark(0, 0, META_READY);
        assert!(queue.drain_releasable().is_empty());
        queue.mark(0, 0, BUFFER_READY);
        // Done, but fewer than two newer requests completed
        assert!(queue.drain_releasable().is_empty());

        queue.mark(1, 0, ALL_READY);
        queue.mark(2, 0, ALL_READY);
        assert_eq!(queue.drain_releasable(), vec![(0, 1)]);
    }

    #[test]
    fn test_pipeline_done_releases_immediately() {
        let mut queue = PendingMetaBufferDoneQueue::new(16, 1, 4);
        queue.register(0, 0, 1);
        queue.pipeline_done(0, 1);
        assert!(queue.drain_releasable().is_empty());

        queue.mark(0, 0, ALL_READY);
        assert_eq!(queue.drain_releasable(), vec![(0, 1)]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_batched_request_needs_all_frames() {
        let mut queue = PendingMetaBufferDoneQueue::new(16, 1, 0);
        queue.register(0, 0, 1);
        queue.register(1, 0, 1);

        queue.mark(0, 0, ALL_READY);
        assert!(queue.drain_releasable().is_empty());
        queue.mark(1, 0, ALL_READY);
        assert_eq!(queue.drain_releasable(), vec![(0, 1)]);
    }

    #[test]
    fn test_release_all_for_flushed_pipelines() {
        let mut queue = PendingMetaBufferDoneQueue::new(16, 2, 2);
        queue.register(0, 0, 1);
        queue.register(0, 1, 1);
        queue.register(1, 1, 2);

        let mut released = queue.release_all(&[1]);
        released.sort_unstable();
        assert_eq!(released, vec![(1, 1), (1, 2)]);
        assert_eq!(queue.pending(), 1);
    }
}
