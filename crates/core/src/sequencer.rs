//! Global output numbering.
//!
//! Every output frame's index is computed from its pair's position in the
//! original sequence, never from a running counter, so the numbering is the
//! same whatever batch size the driver used.

use std::path::Path;

use anyhow::{bail, ensure, Result};
use tracing::debug;

use crate::types::{Frame, OutputFrame, OutputKind};

/// Receives finished frames keyed by final index, in any order.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &OutputFrame<'_>) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> FrameSink for F
where
    F: FnMut(&OutputFrame<'_>) -> Result<()> + Send,
{
    fn write_frame(&mut self, frame: &OutputFrame<'_>) -> Result<()> {
        self(frame)
    }
}

/// Index of the leading endpoint of pair `pair` (1-based).
pub fn base_index(pair: usize, slomo_factor: u32) -> u64 {
    (pair as u64 - 1) * slomo_factor as u64 + 1
}

/// Index of the `step`-th synthesized frame of pair `pair`.
pub fn synthesized_index(pair: usize, step: u32, slomo_factor: u32) -> u64 {
    base_index(pair, slomo_factor) + step as u64
}

/// Index of the last original frame, which closes the sequence.
pub fn closing_index(frame_count: usize, slomo_factor: u32) -> u64 {
    base_index(frame_count - 1, slomo_factor) + slomo_factor as u64
}

pub fn total_output_frames(frame_count: usize, slomo_factor: u32) -> u64 {
    (frame_count as u64 - 1) * slomo_factor as u64 + 1
}

pub struct OutputSequencer<S> {
    sink: S,
    frame_count: usize,
    slomo_factor: u32,
    emitted: Vec<bool>,
    written: u64,
}

impl<S: FrameSink> OutputSequencer<S> {
    pub fn new(sink: S, frame_count: usize, slomo_factor: u32) -> Result<Self> {
        ensure!(frame_count >= 2, "need at least 2 frames, got {frame_count}");
        ensure!(slomo_factor >= 2, "slomo factor must be >= 2, got {slomo_factor}");
        let total = (frame_count as u64 - 1)
            .checked_mul(u64::from(slomo_factor))
            .and_then(|n| n.checked_add(1))
            .and_then(|n| usize::try_from(n).ok());
        let Some(total) = total else {
            bail!("{frame_count} frames at slomo factor {slomo_factor} overflow the output index range");
        };
        Ok(Self {
            sink,
            frame_count,
            slomo_factor,
            emitted: vec![false; total],
            written: 0,
        })
    }

    pub fn total(&self) -> u64 {
        self.emitted.len() as u64
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Emit original frame `number` as the leading endpoint of pair `number`.
    pub fn emit_endpoint(&mut self, number: usize, origin: Option<&Path>, frame: &Frame) -> Result<u64> {
        ensure!(
            number >= 1 && number < self.frame_count,
            "pair {number} out of range 1..{}",
            self.frame_count - 1
        );
        let index = base_index(number, self.slomo_factor);
        self.emit(index, OutputKind::Original { number, origin }, frame)
    }

    /// Emit the `step`-th intermediate frame of pair `pair`.
    pub fn emit_synthesized(&mut self, pair: usize, step: u32, frame: &Frame) -> Result<u64> {
        ensure!(
            pair >= 1 && pair < self.frame_count,
            "pair {pair} out of range 1..{}",
            self.frame_count - 1
        );
        ensure!(
            step >= 1 && step < self.slomo_factor,
            "step {step} out of range 1..{}",
            self.slomo_factor - 1
        );
        let index = synthesized_index(pair, step, self.slomo_factor);
        self.emit(index, OutputKind::Synthesized { pair, step }, frame)
    }

    /// Emit the last original frame, once, after every pair.
    pub fn emit_closing(&mut self, origin: Option<&Path>, frame: &Frame) -> Result<u64> {
        let index = closing_index(self.frame_count, self.slomo_factor);
        let number = self.frame_count;
        self.emit(index, OutputKind::Original { number, origin }, frame)
    }

    fn emit(&mut self, index: u64, kind: OutputKind<'_>, frame: &Frame) -> Result<u64> {
        let slot = index as usize - 1;
        match self.emitted.get(slot) {
            None => bail!("output index {index} is beyond {}", self.total()),
            Some(true) => bail!("output index {index} emitted twice"),
            Some(false) => {}
        }
        self.sink.write_frame(&OutputFrame { index, kind, frame })?;
        self.emitted[slot] = true;
        self.written += 1;
        Ok(index)
    }

    /// Check the index set is exactly `1..=total`, flush the sink and hand it back.
    pub fn finish(mut self) -> Result<S> {
        let missing: Vec<u64> = self
            .emitted
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(slot, _)| slot as u64 + 1)
            .take(8)
            .collect();
        ensure!(
            missing.is_empty(),
            "output sequence has gaps; first missing indices: {missing:?}"
        );
        self.sink.finish()?;
        debug!(frames = self.written, "output sequence complete");
        Ok(self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discard_sink() -> impl FnMut(&OutputFrame<'_>) -> Result<()> + Send {
        |_frame: &OutputFrame<'_>| -> Result<()> { Ok(()) }
    }

    #[test]
    fn test_index_formulas() {
        assert_eq!(base_index(1, 3), 1);
        assert_eq!(base_index(2, 3), 4);
        assert_eq!(synthesized_index(1, 2, 3), 3);
        assert_eq!(closing_index(3, 3), 7);
        assert_eq!(total_output_frames(3, 3), 7);
        assert_eq!(total_output_frames(3, 2), 5);
        assert_eq!(closing_index(2, 8), total_output_frames(2, 8));
    }

    #[test]
    fn test_batch_counter_with_slot_offset_matches_direct_formula() {
        // Counter advanced once per batch plus `sf * slot` within the batch.
        let (frames, sf) = (11usize, 4u32);
        for batch_size in 1..frames {
            let mut counter = 1u64;
            let mut pair = 1usize;
            while pair < frames {
                let in_batch = batch_size.min(frames - pair);
                for slot in 0..in_batch {
                    let expected = base_index(pair + slot, sf);
                    assert_eq!(counter + sf as u64 * slot as u64, expected);
                }
                counter += sf as u64 * in_batch as u64;
                pair += in_batch;
            }
            assert_eq!(counter, closing_index(frames, sf));
        }
    }

    #[test]
    fn test_duplicate_index_is_rejected() {
        let frame = Frame::solid(2, 2, [0, 0, 0]);
        let mut sequencer = OutputSequencer::new(discard_sink(), 3, 2).unwrap();
        sequencer.emit_endpoint(1, None, &frame).unwrap();
        let err = sequencer.emit_endpoint(1, None, &frame).unwrap_err();
        assert!(err.to_string().contains("emitted twice"));
    }

    #[test]
    fn test_out_of_range_requests_are_rejected() {
        let frame = Frame::solid(2, 2, [0, 0, 0]);
        let mut sequencer = OutputSequencer::new(discard_sink(), 3, 2).unwrap();
        assert!(sequencer.emit_endpoint(3, None, &frame).is_err());
        assert!(sequencer.emit_synthesized(1, 2, &frame).is_err());
        assert!(sequencer.emit_synthesized(0, 1, &frame).is_err());
    }

    #[test]
    fn test_unrepresentable_output_count_is_rejected() {
        let err = OutputSequencer::new(discard_sink(), usize::MAX, u32::MAX)
            .err()
            .expect("index range must overflow");
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_finish_reports_gaps() {
        let frame = Frame::solid(2, 2, [0, 0, 0]);
        let mut sequencer = OutputSequencer::new(discard_sink(), 3, 2).unwrap();
        sequencer.emit_endpoint(1, None, &frame).unwrap();
        sequencer.emit_closing(None, &frame).unwrap();
        let err = sequencer.finish().err().expect("gaps must be reported");
        assert!(err.to_string().contains("[2, 3, 4]"));
    }

    #[test]
    fn test_full_sequence_in_any_order() {
        let frame = Frame::solid(2, 2, [0, 0, 0]);
        let mut seen = Vec::new();
        let sink = |out: &OutputFrame<'_>| -> Result<()> {
            let original = match out.kind {
                OutputKind::Original { number, .. } => Some(number),
                OutputKind::Synthesized { .. } => None,
            };
            seen.push((out.index, original));
            Ok(())
        };
        let mut sequencer = OutputSequencer::new(sink, 3, 3).unwrap();
        sequencer.emit_closing(None, &frame).unwrap();
        sequencer.emit_synthesized(2, 2, &frame).unwrap();
        sequencer.emit_endpoint(2, None, &frame).unwrap();
        sequencer.emit_synthesized(1, 1, &frame).unwrap();
        sequencer.emit_endpoint(1, None, &frame).unwrap();
        sequencer.emit_synthesized(2, 1, &frame).unwrap();
        sequencer.emit_synthesized(1, 2, &frame).unwrap();
        assert_eq!(sequencer.written(), 7);
        let _sink = sequencer.finish().expect("sequence should be complete");

        seen.sort_by_key(|(index, _)| *index);
        let indices: Vec<u64> = seen.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, (1..=7).collect::<Vec<_>>());
        let originals: Vec<Option<usize>> = seen.iter().map(|(_, original)| *original).collect();
        assert_eq!(
            originals,
            vec![Some(1), None, None, Some(2), None, None, Some(3)]
        );
    }
}
