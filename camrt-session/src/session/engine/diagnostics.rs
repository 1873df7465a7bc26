//! State dumps
//!
//! A dump must work while the session is wedged, so every lock other than
//! the dump lock is only tried for a short while and reported as busy
//! otherwise.

use super::core::SessionInner;
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::warn;

const DUMP_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

impl SessionInner {
    /// Render the session state and log it
    pub(super) fn dump_state(&self) -> String {
        let _dump = self.dump_lock.lock();
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = self.render_state(&mut out);
        warn!("Session {} state dump:\n{}", self.id, out);
        out
    }

    /// Dump once per incident; reset after a successful flush
    pub(super) fn dump_once(&self, reason: &str) {
        if self.dump_complete.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Session {} dumping state: {}", self.id, reason);
        self.dump_state();
    }

    fn render_state(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "session {} ({})", self.id, self.name)?;
        writeln!(out, "  state: {}", self.state.current())?;
        writeln!(
            out,
            "  last shutter sequence: {}, last SOF timestamp: {}",
            self.last_shutter_sequence_id.load(Ordering::Acquire),
            self.last_sof_timestamp.load(Ordering::Acquire)
        )?;

        let admission = self.admission.snapshot();
        writeln!(
            out,
            "  admission: live {}/{} cold start {} long exposure {}ms admitted {} released {}",
            admission.live_pending,
            admission.max_live_pending,
            admission.cold_start_remaining,
            admission.long_exposure_ms,
            admission.total_admitted,
            admission.total_released
        )?;

        match self.requests.try_lock_for(DUMP_LOCK_TIMEOUT) {
            Some(requests) => writeln!(
                out,
                "  requests: next sequence {} batching {} staged {} next sync {}",
                requests.next_sequence_id,
                requests.batching_on,
                requests.staging.is_some(),
                requests.next_sync_id
            )?,
            None => writeln!(out, "  requests: <busy>")?,
        }
        writeln!(
            out,
            "  request queue: {}/{}",
            self.request_queue.len(),
            self.request_queue.depth()
        )?;

        match self.flush.try_lock_for(DUMP_LOCK_TIMEOUT) {
            Some(flush) => writeln!(
                out,
                "  flush: in progress {} session scope {} targets {:?} rejected {} generation {}",
                flush.in_progress,
                flush.session_scope,
                flush.targets,
                flush.rejected.len(),
                flush.generation
            )?,
            None => writeln!(out, "  flush: <busy>")?,
        }

        for handle in &self.pipelines {
            writeln!(
                out,
                "  pipeline {} {}: status {:?} live {} flushing {} nodes done {} last request {} last valid {} last completed {}",
                handle.index,
                handle.pipeline.name(),
                handle.pipeline.status(),
                handle.get_live_pending_request(),
                handle.is_flushing(),
                handle.pipeline.all_nodes_done(),
                handle.last_request_id(),
                handle.last_valid_request_id(),
                handle.last_completed_request_id()
            )?;
        }

        match self.results.try_lock_for(DUMP_LOCK_TIMEOUT) {
            Some(list) => {
                writeln!(
                    out,
                    "  result list: {} holders (head {:?}, tail {:?}, capacity {})",
                    list.len(),
                    list.head_sequence_id(),
                    list.tail_sequence_id(),
                    list.capacity()
                )?;
                for session_holder in list.iter() {
                    writeln!(
                        out,
                        "    seq {} age {}ms long exposure {}ms",
                        session_holder.sequence_id,
                        session_holder.created_at.elapsed().as_millis(),
                        session_holder.long_exposure_ms
                    )?;
                    for holder in &session_holder.holders {
                        writeln!(
                            out,
                            "      pipeline {} request {} frame {} metadata pending {} error {} buffers ok {} err {} outstanding {:?} cancelled {} shutter {}",
                            holder.pipeline_index,
                            holder.request_id,
                            holder.frame_number,
                            holder.pending_metadata_count,
                            holder.metadata_error,
                            holder.num_ok_buffers,
                            holder.num_error_buffers,
                            holder.outstanding_streams(),
                            holder.is_cancelled,
                            holder.shutter_sent
                        )?;
                    }
                }
                let streams = list.streams();
                for stream in streams.active_streams() {
                    writeln!(
                        out,
                        "    {}: next sequence {:?} pending {}",
                        stream,
                        streams.next_expected(stream),
                        streams.pending_on(stream)
                    )?;
                }
            }
            None => writeln!(out, "  result list: <busy>")?,
        }

        match self.metabuffers.try_lock_for(DUMP_LOCK_TIMEOUT) {
            Some(metabuffers) => {
                writeln!(out, "  metabuffers pending release: {}", metabuffers.pending())?
            }
            None => writeln!(out, "  metabuffers: <busy>")?,
        }

        if let Some(timing) = self.timing.try_lock_for(DUMP_LOCK_TIMEOUT) {
            let fps = timing
                .result_fps()
                .map_or_else(|| "n/a".to_string(), |fps| format!("{:.1}", fps));
            writeln!(
                out,
                "  timing: {} in flight, average {:?}, oldest {:?}, result fps {}",
                timing.in_flight(),
                timing.average(),
                timing.oldest_in_flight(),
                fps
            )?;
            for entry in timing.recent().iter().rev().take(10) {
                writeln!(
                    out,
                    "    seq {} requests {:?} took {}ms",
                    entry.sequence_id,
                    entry.request_ids,
                    entry.elapsed.as_millis()
                )?;
            }
        }
        Ok(())
    }
}
