//! Chunked delivery of FastTransfer buffers.
//!
//! A [`TransferBuffer`] is the append-only output of the encoder plus one
//! [`CutMark`] per atomic unit. [`ChunkCursor`] hands the buffer out in
//! client-sized pieces, never cutting inside the protected head of a unit.
//!
//! Unit `i` spans `[marks[i-1].offset, marks[i].offset)`. A split inside a
//! unit at position `p` is allowed only when the unit's `min_granularity`
//! is non-zero and `p - unit_start >= min_granularity`.

use ics_types::WireError;
use std::convert::Infallible;

/// End of one atomic unit and how much of its head must stay together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutMark {
    /// Offset just past the unit.
    pub offset: usize,
    /// Protected head length; 0 means the unit is indivisible.
    pub min_granularity: usize,
}

const SENTINEL_GRANULARITY: u32 = u32::MAX;

/// Encoded stream plus its cut marks.
#[derive(Debug, Clone, Default)]
pub struct TransferBuffer {
    bytes: Vec<u8>,
    marks: Vec<CutMark>,
}

impl TransferBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one atomic unit and record its cut mark.
    pub fn append_unit(&mut self, unit: &[u8], min_granularity: usize) {
        self.bytes.extend_from_slice(unit);
        self.marks.push(CutMark {
            offset: self.bytes.len(),
            min_granularity,
        });
    }

    /// Append another buffer, shifting its marks.
    pub fn extend(&mut self, other: &TransferBuffer) {
        let base = self.bytes.len();
        self.bytes.extend_from_slice(&other.bytes);
        self.marks.extend(other.marks.iter().map(|m| CutMark {
            offset: base + m.offset,
            min_granularity: m.min_granularity,
        }));
    }

    /// Encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cut marks in offset order.
    pub fn marks(&self) -> &[CutMark] {
        &self.marks
    }

    /// Cut mark recorded for the most recent unit.
    pub fn last_mark(&self) -> Option<CutMark> {
        self.marks.last().copied()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Serialize cut marks as `u32` pairs terminated by `(0, u32::MAX)`.
pub fn marks_to_wire(marks: &[CutMark]) -> Vec<u8> {
    let mut out = Vec::with_capacity((marks.len() + 1) * 8);
    for mark in marks {
        out.extend_from_slice(&(mark.offset as u32).to_le_bytes());
        out.extend_from_slice(&(mark.min_granularity as u32).to_le_bytes());
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&SENTINEL_GRANULARITY.to_le_bytes());
    out
}

/// Parse the sentinel-terminated cut mark table.
pub fn marks_from_wire(bytes: &[u8]) -> Result<Vec<CutMark>, WireError> {
    let mut marks = Vec::new();
    let mut pairs = bytes.chunks_exact(8);
    for pair in pairs.by_ref() {
        let offset = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let granularity = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        if offset == 0 && granularity == SENTINEL_GRANULARITY {
            return Ok(marks);
        }
        marks.push(CutMark {
            offset: offset as usize,
            min_granularity: granularity as usize,
        });
    }
    Err(WireError::Truncated {
        what: "cut mark table",
        needed: bytes.len() - pairs.remainder().len() + 8,
        available: bytes.len(),
    })
}

/// Something that fills a [`TransferBuffer`], possibly on demand.
pub trait Producer {
    /// Error raised while producing more output.
    type Error;

    /// Output materialized so far.
    fn buffer(&self) -> &TransferBuffer;

    /// Whether no more output will ever be produced.
    fn is_exhausted(&self) -> bool;

    /// Produce the next batch. Must grow the buffer or become exhausted.
    fn produce(&mut self) -> Result<(), Self::Error>;
}

/// A fully materialized buffer is an exhausted producer.
impl Producer for TransferBuffer {
    type Error = Infallible;

    fn buffer(&self) -> &TransferBuffer {
        self
    }

    fn is_exhausted(&self) -> bool {
        true
    }

    fn produce(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// TransferStatus values of a GetBuffer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TransferStatus {
    /// The stream failed.
    Error = 0x0000,
    /// More data follows.
    Partial = 0x0001,
    /// The buffer was too small for the next unit.
    NoRoom = 0x0002,
    /// This is the last chunk.
    Done = 0x0003,
}

/// One delivered piece of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes `[position, end)` of the stream.
    pub data: Vec<u8>,
    /// Whether the stream is complete.
    pub status: TransferStatus,
    /// Steps delivered so far.
    pub in_progress_count: u32,
    /// Estimated total steps.
    pub total_step_count: u32,
}

/// Resumable delivery position within a stream.
#[derive(Debug, Clone, Default)]
pub struct ChunkCursor {
    position: usize,
    next_mark: usize,
    steps: u32,
    total_steps: u32,
    progress_margin: u32,
    finished: bool,
}

impl ChunkCursor {
    /// Cursor at the start of a stream.
    pub fn new(progress_margin: u32) -> Self {
        Self {
            progress_margin,
            ..Self::default()
        }
    }

    /// Bytes delivered so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether the final chunk was delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Deliver the next chunk of at most `requested` bytes, unless an
    /// indivisible unit forces over-delivery.
    pub fn next_chunk<P: Producer>(
        &mut self,
        producer: &mut P,
        requested: usize,
    ) -> Result<Chunk, P::Error> {
        if self.finished {
            return Ok(self.chunk(Vec::new(), TransferStatus::Done));
        }

        let requested = requested.max(1);
        let window_end = self.position + requested;
        while !producer.is_exhausted() && producer.buffer().len() < window_end {
            producer.produce()?;
        }

        let buffer = producer.buffer();
        if self.position == 0 && self.steps == 0 {
            let estimate = buffer.len().div_ceil(requested) as u32;
            self.total_steps = estimate.max(1) + self.progress_margin;
        }

        let end = self.cut(buffer, window_end);
        let data = buffer.bytes()[self.position..end].to_vec();
        self.position = end;
        self.steps += 1;
        if self.steps > self.total_steps {
            self.total_steps = self.steps;
        }

        if self.position == buffer.len() && producer.is_exhausted() {
            self.finished = true;
            self.steps = self.total_steps;
            tracing::debug!("transfer complete: {} bytes", self.position);
            return Ok(self.chunk(data, TransferStatus::Done));
        }
        Ok(self.chunk(data, TransferStatus::Partial))
    }

    fn chunk(&self, data: Vec<u8>, status: TransferStatus) -> Chunk {
        Chunk {
            data,
            status,
            in_progress_count: self.steps,
            total_step_count: self.total_steps,
        }
    }

    /// End offset of the next chunk.
    fn cut(&mut self, buffer: &TransferBuffer, window_end: usize) -> usize {
        let marks = buffer.marks();
        let mut end = self.position;
        while self.next_mark < marks.len() && marks[self.next_mark].offset <= window_end {
            end = marks[self.next_mark].offset;
            self.next_mark += 1;
        }

        let Some(straddling) = marks.get(self.next_mark).copied() else {
            // bytes past the last mark carry no constraints
            return end.max(window_end.min(buffer.len()));
        };

        let unit_start = match self.next_mark {
            0 => 0,
            n => marks[n - 1].offset,
        };
        let g = straddling.min_granularity;
        if g > 0 && window_end - unit_start >= g {
            return window_end;
        }
        if end > self.position {
            return end;
        }

        // nothing fits: over-deliver rather than split
        if g > 0 {
            (unit_start + g).min(straddling.offset)
        } else {
            self.next_mark += 1;
            straddling.offset
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer_of(units: &[(usize, usize)]) -> TransferBuffer {
        let mut buf = TransferBuffer::new();
        for (i, &(len, g)) in units.iter().enumerate() {
            buf.append_unit(&vec![i as u8; len], g.min(len));
        }
        buf
    }

    fn drain<P: Producer>(producer: &mut P, size: usize) -> Vec<Chunk>
    where
        P::Error: std::fmt::Debug,
    {
        let mut cursor = ChunkCursor::new(1);
        let mut chunks = Vec::new();
        loop {
            let chunk = cursor.next_chunk(producer, size).unwrap();
            let done = chunk.status == TransferStatus::Done;
            chunks.push(chunk);
            if done {
                return chunks;
            }
            assert!(chunks.len() < 10_000, "runaway transfer");
        }
    }

    #[test]
    fn small_window_does_not_split_an_eight_byte_integer() {
        // tag + i64 property followed by a marker
        let mut buf = buffer_of(&[(12, 0), (4, 0)]);
        let chunks = drain(&mut buf, 4);
        assert_eq!(chunks[0].data.len(), 12);
        assert_eq!(chunks[0].status, TransferStatus::Partial);
        assert_eq!(chunks[1].data.len(), 4);
        assert_eq!(chunks[1].status, TransferStatus::Done);
    }

    #[test]
    fn variable_unit_splits_after_protected_head() {
        let mut buf = buffer_of(&[(40, 16)]);
        let sizes: Vec<usize> = drain(&mut buf, 10).iter().map(|c| c.data.len()).collect();
        // first chunk over-delivers the 16-byte head, then free 10-byte pieces
        assert_eq!(sizes, vec![16, 10, 10, 4]);
    }

    #[test]
    fn several_units_fit_in_one_window() {
        let mut buf = buffer_of(&[(4, 0), (4, 0), (8, 0), (4, 0)]);
        let sizes: Vec<usize> = drain(&mut buf, 16).iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![16, 4]);
    }

    #[test]
    fn done_reports_total_steps_and_redelivery_is_empty() {
        let mut buf = buffer_of(&[(4, 0), (4, 0), (4, 0)]);
        let mut cursor = ChunkCursor::new(1);
        let first = cursor.next_chunk(&mut buf, 4).unwrap();
        assert_eq!(first.total_step_count, 4);
        cursor.next_chunk(&mut buf, 4).unwrap();
        let last = cursor.next_chunk(&mut buf, 4).unwrap();
        assert_eq!(last.status, TransferStatus::Done);
        assert_eq!(last.in_progress_count, last.total_step_count);

        let again = cursor.next_chunk(&mut buf, 4).unwrap();
        assert!(again.data.is_empty());
        assert_eq!(again.status, TransferStatus::Done);
    }

    #[test]
    fn empty_stream_is_done_immediately() {
        let mut buf = TransferBuffer::new();
        let chunks = drain(&mut buf, 100);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.is_empty());
    }

    #[test]
    fn cut_marks_wire_form_round_trips_with_sentinel() {
        let buf = buffer_of(&[(4, 0), (30, 16)]);
        let wire = marks_to_wire(buf.marks());
        assert_eq!(&wire[wire.len() - 8..], &[0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(marks_from_wire(&wire).unwrap(), buf.marks());
        assert!(marks_from_wire(&wire[..wire.len() - 8]).is_err());
    }

    /// Emits one unit per `produce` call.
    struct Staged {
        pending: Vec<(usize, usize)>,
        buffer: TransferBuffer,
        calls: usize,
    }

    impl Producer for Staged {
        type Error = ();

        fn buffer(&self) -> &TransferBuffer {
            &self.buffer
        }

        fn is_exhausted(&self) -> bool {
            self.pending.is_empty()
        }

        fn produce(&mut self) -> Result<(), ()> {
            self.calls += 1;
            let (len, g) = self.pending.remove(0);
            self.buffer.append_unit(&vec![self.calls as u8; len], g.min(len));
            Ok(())
        }
    }

    #[test]
    fn lazy_producer_is_driven_only_as_far_as_needed() {
        let mut staged = Staged {
            pending: vec![(4, 0); 10],
            buffer: TransferBuffer::new(),
            calls: 0,
        };
        let mut cursor = ChunkCursor::new(1);
        let chunk = cursor.next_chunk(&mut staged, 8).unwrap();
        assert_eq!(chunk.data.len(), 8);
        assert_eq!(staged.calls, 2);
        assert_eq!(chunk.status, TransferStatus::Partial);
    }

    fn assert_safe(buf: &TransferBuffer, chunks: &[Chunk]) {
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, buf.bytes());

        let mut boundary = 0;
        for chunk in &chunks[..chunks.len() - 1] {
            boundary += chunk.data.len();
            let mut start = 0;
            for mark in buf.marks() {
                if start < boundary && boundary < mark.offset {
                    assert!(mark.min_granularity > 0, "split indivisible unit at {boundary}");
                    assert!(boundary - start >= mark.min_granularity);
                }
                start = mark.offset;
            }
        }
    }

    proptest! {
        #[test]
        fn chunks_reassemble_and_respect_cut_marks(
            units in prop::collection::vec((1usize..40, 0usize..20), 0..30),
            size in 1usize..64,
        ) {
            let mut buf = buffer_of(&units);
            let chunks = drain(&mut buf, size);
            assert_safe(&buf, &chunks);
        }

        #[test]
        fn lazy_and_eager_production_agree(
            units in prop::collection::vec((1usize..40, 0usize..20), 1..20),
            size in 1usize..64,
        ) {
            let mut eager = buffer_of(&units);
            let eager_chunks = drain(&mut eager, size);

            let mut staged = Staged { pending: units.clone(), buffer: TransferBuffer::new(), calls: 0 };
            let lazy_chunks = drain(&mut staged, size);
            assert_safe(&staged.buffer, &lazy_chunks);
            let joined: Vec<u8> = lazy_chunks.iter().flat_map(|c| c.data.clone()).collect();
            prop_assert_eq!(joined.len(), eager.len());
            prop_assert_eq!(eager_chunks.last().map(|c| c.status), Some(TransferStatus::Done));
        }
    }
}
