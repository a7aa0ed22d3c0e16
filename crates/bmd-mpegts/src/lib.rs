//! MPEG-TS sanitizer.
//!
//! The encoder pads its bulk endpoint with stuffing: null packets
//! (PID 0x1fff) and stretches of zero bytes.  [`TsFilter`] re-aligns the
//! byte stream on 188-byte transport packets, drops the stuffing, and
//! forwards everything else to a [`StreamSink`] as coalesced vectored
//! writes.
//!
//! The filter is purely a byte-stream transformer: it owns the read
//! buffer and the carry state but never touches the USB device or the
//! output file descriptor.  Those live with the caller, which keeps this
//! crate trivially testable on the host.

use std::io::{self, IoSlice, Write};

/// Length of an MPEG transport-stream packet.
pub const PACKET_LEN: usize = 188;

/// MPEG-TS sync byte; every transport packet starts with it.
pub const SYNC_BYTE: u8 = 0x47;

/// Size of the main read region handed to bulk transfers.
const MAIN_LEN: usize = 16 * 1024;

/// Coalesced segments are flushed once this many accumulate.
const MAX_SEGMENTS: usize = 64;

/// An opaque vectored-write target for sanitized transport packets.
///
/// Implementations must either consume every byte of every segment or
/// return an error; short writes are not part of the contract.  A broken
/// downstream pipe surfaces as `io::ErrorKind::BrokenPipe`.
pub trait StreamSink {
    /// Write all the given segments, in order.
    fn write_segments(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()>;
}

/// Adapter making any [`Write`] a [`StreamSink`] with write-all semantics.
pub struct WriteSink<W>(pub W);

impl<W: Write> StreamSink for WriteSink<W> {
    fn write_segments(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()> {
        write_all_segments(&mut self.0, segments)
    }
}

/// Write every byte of `segments` to `w`, preferring one vectored write.
pub fn write_all_segments<W: Write>(
    w: &mut W,
    segments: &[IoSlice<'_>],
) -> io::Result<()> {
    let total: usize = segments.iter().map(|s| s.len()).sum();
    if total == 0 {
        return Ok(());
    }

    let mut written = loop {
        match w.write_vectored(segments) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    if written == total {
        return Ok(());
    }

    // Partial vectored write; finish the remainder segment by segment.
    for seg in segments {
        let seg: &[u8] = seg;
        if written >= seg.len() {
            written -= seg.len();
            continue;
        }
        w.write_all(&seg[written..])?;
        written = 0;
    }
    Ok(())
}

/// Stateful 188-byte packet filter.
///
/// Layout: a single allocation with a [`PACKET_LEN`]-sized carry region in
/// front of the main read region.  Fresh bulk data lands in
/// [`read_buf`](TsFilter::read_buf); a parse pass scans carry + fresh data
/// and the sub-packet tail (at most 187 bytes) is copied back to the end
/// of the carry region so the next pass sees a contiguous stream.
pub struct TsFilter {
    buf: Box<[u8; PACKET_LEN + MAIN_LEN]>,
    /// Bytes of carry currently held before the main region.
    carry: usize,
}

impl TsFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; PACKET_LEN + MAIN_LEN]),
            carry: 0,
        }
    }

    /// The region to read fresh stream bytes into.
    pub fn read_buf(&mut self) -> &mut [u8] {
        &mut self.buf[PACKET_LEN..]
    }

    /// Number of carry bytes held from the previous pass.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.carry
    }

    /// Run one parse pass over `newlen` fresh bytes in the read region.
    ///
    /// Kept packets are forwarded to `sink`, adjacent ones coalesced into
    /// single segments.  A forced flush happens whenever [`MAX_SEGMENTS`]
    /// segments accumulate, and once at the end of the pass.
    ///
    /// On a sink error, the remainder of the pass is still scanned so the
    /// carry state stays consistent, and the first error is returned.
    ///
    /// # Errors
    ///
    /// Propagates the sink's I/O error (broken pipe included).
    pub fn drain<S: StreamSink>(
        &mut self,
        newlen: usize,
        sink: &mut S,
    ) -> io::Result<()> {
        debug_assert!(newlen <= MAIN_LEN);
        let end = PACKET_LEN + newlen.min(MAIN_LEN);
        let mut i = PACKET_LEN - self.carry;

        // (offset, len) pairs into self.buf; kept out of IoSlice form so the
        // scan loop does not hold a borrow across the flush calls.
        let mut segments: Vec<(usize, usize)> = Vec::with_capacity(MAX_SEGMENTS);
        let mut merge = false;
        let mut failure: Option<io::Error> = None;

        while i + PACKET_LEN <= end {
            // Bounds: i + PACKET_LEN <= end <= buf.len() by the loop guard.
            #[allow(clippy::indexing_slicing)]
            let window = &self.buf[i..i + PACKET_LEN];

            if window[..4] == [0, 0, 0, 0] {
                // All-zero stuffing burst; stays packet-aligned.
                i += PACKET_LEN;
                merge = false;
                continue;
            }
            if window[0] != SYNC_BYTE {
                // Lost sync: scan byte-wise for the next candidate.
                #[allow(clippy::indexing_slicing)] // i < end <= buf.len()
                while i < end && self.buf[i] != SYNC_BYTE {
                    i += 1;
                }
                merge = false;
                continue;
            }
            if window[1] == 0x1f && window[2] == 0xff {
                // Null PID 0x1fff.
                i += PACKET_LEN;
                merge = false;
                continue;
            }

            if merge {
                if let Some(last) = segments.last_mut() {
                    last.1 += PACKET_LEN;
                }
            } else {
                if segments.len() == MAX_SEGMENTS {
                    flush(&self.buf[..], &mut segments, sink, &mut failure);
                }
                segments.push((i, PACKET_LEN));
                merge = true;
            }
            i += PACKET_LEN;
        }

        flush(&self.buf[..], &mut segments, sink, &mut failure);

        // Save the sub-packet tail as carry for the next pass.
        let rest = end - i;
        self.buf.copy_within(i..end, PACKET_LEN - rest);
        self.carry = rest;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TsFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit the accumulated segments; the first sink error is kept in
/// `failure` and later segments in the same pass are discarded.
fn flush<S: StreamSink>(
    buf: &[u8],
    segments: &mut Vec<(usize, usize)>,
    sink: &mut S,
    failure: &mut Option<io::Error>,
) {
    if segments.is_empty() {
        return;
    }
    if failure.is_none() {
        // Bounds: every (off, len) was produced from in-range windows.
        #[allow(clippy::indexing_slicing)]
        let slices: Vec<IoSlice<'_>> = segments
            .iter()
            .map(|&(off, len)| IoSlice::new(&buf[off..off + len]))
            .collect();
        if let Err(e) = sink.write_segments(&slices) {
            *failure = Some(e);
        }
    }
    segments.clear();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for readable assertions
mod tests {
    use super::*;

    /// Records every vectored write as its slice lengths plus the bytes.
    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<Vec<usize>>,
        bytes: Vec<u8>,
    }

    impl StreamSink for RecordingSink {
        fn write_segments(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()> {
            self.writes
                .push(segments.iter().map(|s| s.len()).collect());
            for seg in segments {
                self.bytes.extend_from_slice(seg);
            }
            Ok(())
        }
    }

    fn packet(first: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0x55u8; PACKET_LEN];
        p[..4].copy_from_slice(&first);
        p
    }

    fn feed(filter: &mut TsFilter, sink: &mut RecordingSink, data: &[u8]) {
        for chunk in data.chunks(16 * 1024) {
            filter.read_buf()[..chunk.len()].copy_from_slice(chunk);
            filter.drain(chunk.len(), sink).unwrap();
        }
    }

    #[test]
    fn null_packet_is_dropped() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        feed(&mut f, &mut sink, &packet([SYNC_BYTE, 0x1f, 0xff, 0x10]));
        assert!(sink.bytes.is_empty());
        assert!(sink.writes.is_empty());
    }

    #[test]
    fn kept_packet_is_forwarded_whole() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        let p = packet([SYNC_BYTE, 0x00, 0x11, 0x10]);
        feed(&mut f, &mut sink, &p);
        assert_eq!(sink.bytes, p);
        assert_eq!(sink.writes, vec![vec![PACKET_LEN]]);
    }

    #[test]
    fn adjacent_kept_packets_coalesce_into_one_write() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        let mut data = packet([SYNC_BYTE, 0x00, 0x11, 0x10]);
        data.extend(packet([SYNC_BYTE, 0x00, 0x12, 0x10]));
        feed(&mut f, &mut sink, &data);
        assert_eq!(sink.bytes, data);
        // One write, one coalesced 376-byte segment.
        assert_eq!(sink.writes, vec![vec![2 * PACKET_LEN]]);
    }

    #[test]
    fn dropped_packet_splits_segments() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        let keep = packet([SYNC_BYTE, 0x00, 0x11, 0x10]);
        let mut data = keep.clone();
        data.extend(packet([SYNC_BYTE, 0x1f, 0xff, 0x10]));
        data.extend(keep.clone());
        feed(&mut f, &mut sink, &data);
        assert_eq!(sink.bytes.len(), 2 * PACKET_LEN);
        assert_eq!(sink.writes, vec![vec![PACKET_LEN, PACKET_LEN]]);
    }

    #[test]
    fn zero_header_drops_a_whole_packet_not_a_byte() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        // A zero-headed packet containing a decoy sync byte; packet-wise
        // dropping keeps alignment so the next packet survives intact.
        let mut zeros = vec![0u8; PACKET_LEN];
        zeros[5] = SYNC_BYTE;
        let keep = packet([SYNC_BYTE, 0x00, 0x11, 0x10]);
        let mut data = zeros;
        data.extend(keep.clone());
        feed(&mut f, &mut sink, &data);
        assert_eq!(sink.bytes, keep);
    }

    #[test]
    fn resync_scans_to_next_sync_byte() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        let keep = packet([SYNC_BYTE, 0x00, 0x11, 0x10]);
        let mut data = vec![0xaa; 37]; // garbage, no sync byte
        data.extend(keep.clone());
        feed(&mut f, &mut sink, &data);
        assert_eq!(sink.bytes, keep);
    }

    #[test]
    fn tail_is_carried_between_passes() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        let p = packet([SYNC_BYTE, 0x00, 0x11, 0x10]);
        // First pass: only half the packet arrives.
        f.read_buf()[..100].copy_from_slice(&p[..100]);
        f.drain(100, &mut sink).unwrap();
        assert!(sink.bytes.is_empty());
        assert_eq!(f.pending(), 100);
        // Second pass: the rest.
        f.read_buf()[..88].copy_from_slice(&p[100..]);
        f.drain(88, &mut sink).unwrap();
        assert_eq!(sink.bytes, p);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn forced_flush_after_64_segments() {
        let mut f = TsFilter::new();
        let mut sink = RecordingSink::default();
        // 65 kept packets, each followed by one garbage byte so nothing
        // coalesces; the 65th segment forces an intermediate flush.  All
        // of it fits one parse pass (65 * 189 bytes < 16 KiB).
        let mut data = Vec::new();
        for n in 0..65u8 {
            data.extend(packet([SYNC_BYTE, 0x00, n, 0x10]));
            data.push(0xaa);
        }
        feed(&mut f, &mut sink, &data);
        assert_eq!(sink.bytes.len(), 65 * PACKET_LEN);
        assert_eq!(sink.writes.len(), 2);
        assert_eq!(sink.writes[0].len(), 64);
        assert_eq!(sink.writes[1].len(), 1);
    }

    #[test]
    fn write_all_segments_handles_empty() {
        let mut out = Vec::new();
        write_all_segments(&mut out, &[]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn write_sink_forwards_bytes() {
        let mut sink = WriteSink(Vec::new());
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        sink.write_segments(&[IoSlice::new(&a), IoSlice::new(&b)])
            .unwrap();
        assert_eq!(sink.0, vec![1, 2, 3, 4, 5]);
    }
}
