//! # sonar-types
//!
//! Shared wire formats for the sonar tracker pipeline.
//!
//! These types are used by:
//! - `backend-rust`: reassembling and validating echo frames from the serial link
//! - `sonar-simulator`: producing byte-exact frames on the bench without hardware
//!
//! ## Packet layout (TUSS4470 front-end, 250 000 baud 8-N-1)
//!
//! ```text
//! [0xAA] [6 metadata bytes] [1800 × u16 big-endian samples] [XOR checksum]
//! ```
//!
//! Total 3608 bytes. The checksum is XOR over the payload (metadata +
//! samples); the metadata bytes are opaque to the pipeline and forwarded
//! unchanged.
//!
//! ## Invariants
//! - An emitted `Frame` always carries exactly [`SAMPLES_PER_FRAME`] samples.
//! - A checksum mismatch never consumes more than the single header byte,
//!   so a valid frame starting inside a corrupt window is still recovered.
//! - The assembler is the sole owner of its reassembly buffer; callers hand
//!   over chunks and never retain a view into it.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

// ── Packet constants ──────────────────────────────────────────────────────────

/// Start-of-frame marker byte.
pub const FRAME_HEADER: u8 = 0xAA;
/// Opaque metadata bytes following the header.
pub const META_LEN: usize = 6;
/// Echo envelope samples per ping.
pub const SAMPLES_PER_FRAME: usize = 1800;
/// Full packet length: header + metadata + samples + checksum.
pub const PACKET_LEN: usize = 1 + META_LEN + SAMPLES_PER_FRAME * 2 + 1;

/// ADC sample period of the front-end (seconds). Canonical value 13.2 µs.
pub const SAMPLE_TIME_S: f64 = 13.2e-6;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One validated ping: the 1800-sample echo envelope plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic sequence number assigned by the assembler.
    pub seq: u64,
    /// Wall-clock receive timestamp (milliseconds).
    pub timestamp_ms: i64,
    /// Front-end metadata, forwarded unchanged.
    pub meta: [u8; META_LEN],
    /// Echo envelope amplitudes. Always [`SAMPLES_PER_FRAME`] long.
    pub samples: Vec<u16>,
}

/// XOR over the payload (metadata + sample bytes) of a raw packet.
///
/// `packet` must be at least [`PACKET_LEN`] bytes; only `[1, PACKET_LEN - 2]`
/// participate.
pub fn payload_checksum(packet: &[u8]) -> u8 {
    packet[1..PACKET_LEN - 1].iter().fold(0u8, |acc, b| acc ^ b)
}

/// Serialize one frame into the wire layout. Used by the simulator and in
/// round-trip tests; the backend only ever decodes.
pub fn encode_frame(meta: &[u8; META_LEN], samples: &[u16]) -> Vec<u8> {
    assert_eq!(samples.len(), SAMPLES_PER_FRAME);
    let mut out = Vec::with_capacity(PACKET_LEN);
    out.push(FRAME_HEADER);
    out.extend_from_slice(meta);
    for s in samples {
        out.extend_from_slice(&s.to_be_bytes());
    }
    let ck = out[1..].iter().fold(0u8, |acc, b| acc ^ b);
    out.push(ck);
    out
}

// ── Frame assembler ───────────────────────────────────────────────────────────

/// Incremental reassembler over a noisy byte stream.
///
/// Resync loop: hunt for [`FRAME_HEADER`], buffer until a full packet is
/// available, validate the checksum. On mismatch exactly one byte (the
/// presumed header) is discarded and the hunt restarts, so the stream can
/// never lose a good frame to a corrupt window in front of it.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
    next_seq: u64,
    /// Packets rejected on checksum. Never fatal.
    pub checksum_failures: u64,
    /// Bytes dropped while hunting for a header.
    pub discarded_bytes: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete, valid frame from the buffer.
    ///
    /// `now_ms` becomes the receive timestamp of frames completed by this
    /// chunk. Malformed input never blocks progress: the call returns once
    /// fewer than [`PACKET_LEN`] bytes remain past the next header.
    pub fn push(&mut self, chunk: &[u8], now_ms: i64) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            // Hunt: discard everything in front of the first header byte.
            match self.buf.iter().position(|&b| b == FRAME_HEADER) {
                Some(0) => {}
                Some(n) => {
                    self.discarded_bytes += n as u64;
                    self.buf.advance(n);
                }
                None => {
                    self.discarded_bytes += self.buf.len() as u64;
                    self.buf.clear();
                    break;
                }
            }

            // Buffering: wait for a full packet behind the header.
            if self.buf.len() < PACKET_LEN {
                break;
            }

            // Validating.
            let packet = &self.buf[..PACKET_LEN];
            if payload_checksum(packet) == packet[PACKET_LEN - 1] {
                let frame = self.decode(now_ms);
                frames.push(frame);
                self.buf.advance(PACKET_LEN);
            } else {
                // Drop only the header byte; a real frame may start inside
                // what we just mistook for a packet.
                self.checksum_failures += 1;
                self.buf.advance(1);
                self.discarded_bytes += 1;
            }
        }

        frames
    }

    fn decode(&mut self, now_ms: i64) -> Frame {
        let packet = &self.buf[..PACKET_LEN];
        let mut meta = [0u8; META_LEN];
        meta.copy_from_slice(&packet[1..1 + META_LEN]);

        let mut samples = Vec::with_capacity(SAMPLES_PER_FRAME);
        let body = &packet[1 + META_LEN..PACKET_LEN - 1];
        for pair in body.chunks_exact(2) {
            samples.push(u16::from_be_bytes([pair[0], pair[1]]));
        }
        debug_assert_eq!(samples.len(), SAMPLES_PER_FRAME);

        let seq = self.next_seq;
        self.next_seq += 1;
        Frame { seq, timestamp_ms: now_ms, meta, samples }
    }

    /// Bytes currently parked in the reassembly buffer.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ── High-rate depth record ────────────────────────────────────────────────────

/// Encode one record for the binary high-rate channel:
/// `[u16 BE distance mm][u8 peak amplitude]`, both clamped.
pub fn encode_depth_record(distance_mm: u32, peak: u16) -> [u8; 3] {
    let mm = distance_mm.min(u16::MAX as u32) as u16;
    let amp = peak.min(u8::MAX as u16) as u8;
    let be = mm.to_be_bytes();
    [be[0], be[1], amp]
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_peak(at: usize, width: usize, amp: u16) -> Vec<u8> {
        let mut samples = vec![0u16; SAMPLES_PER_FRAME];
        for s in samples.iter_mut().skip(at).take(width) {
            *s = amp;
        }
        encode_frame(&[1, 2, 3, 4, 5, 6], &samples)
    }

    #[test]
    fn roundtrip_single_frame() {
        let packet = frame_with_peak(400, 11, 200);
        assert_eq!(packet.len(), PACKET_LEN);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&packet, 42);
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(f.seq, 0);
        assert_eq!(f.timestamp_ms, 42);
        assert_eq!(f.meta, [1, 2, 3, 4, 5, 6]);
        assert_eq!(f.samples.len(), SAMPLES_PER_FRAME);
        assert_eq!(f.samples[400], 200);
        assert_eq!(f.samples[410], 200);
        assert_eq!(f.samples[411], 0);
        assert_eq!(asm.checksum_failures, 0);
    }

    #[test]
    fn roundtrip_concatenated_stream() {
        let a = frame_with_peak(100, 4, 90);
        let b = frame_with_peak(900, 7, 450);
        let c = frame_with_peak(1500, 2, 70);
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);
        stream.extend_from_slice(&c);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&stream, 0);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].samples[100], 90);
        assert_eq!(frames[1].samples[900], 450);
        assert_eq!(frames[2].samples[1500], 70);
        assert_eq!(frames[2].seq, 2);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn split_delivery_makes_progress() {
        let packet = frame_with_peak(700, 5, 300);
        let mut asm = FrameAssembler::new();
        // Feed one byte shy of a full packet, then the rest.
        assert!(asm.push(&packet[..PACKET_LEN - 1], 0).is_empty());
        let frames = asm.push(&packet[PACKET_LEN - 1..], 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_ms, 1);
    }

    #[test]
    fn garbage_prefix_is_discarded() {
        let packet = frame_with_peak(250, 3, 120);
        let mut stream = vec![0x00, 0xFF, 0x13, 0x37];
        stream.extend_from_slice(&packet);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&stream, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(asm.discarded_bytes, 4);
    }

    #[test]
    fn checksum_resync_recovers_next_frame() {
        // [valid A][0xAA + 100 junk bytes containing a stray 0xAA][valid B]
        let a = frame_with_peak(400, 11, 200);
        let b = frame_with_peak(600, 6, 150);
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.push(FRAME_HEADER);
        let mut junk = vec![0x55u8; 100];
        junk[40] = FRAME_HEADER; // stray header inside the junk window
        stream.extend_from_slice(&junk);
        stream.extend_from_slice(&b);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&stream, 0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples[400], 200);
        assert_eq!(frames[1].samples[600], 150);
        assert!(asm.checksum_failures >= 1);
    }

    #[test]
    fn corrupted_payload_does_not_eat_following_frame() {
        // Flip one sample byte so the checksum fails, then append a good frame.
        let mut bad = frame_with_peak(500, 4, 100);
        bad[1 + META_LEN + 1000] ^= 0x01;
        let good = frame_with_peak(800, 4, 100);
        let mut stream = bad;
        stream.extend_from_slice(&good);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&stream, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples[800], 100);
        assert!(asm.checksum_failures >= 1);
    }

    #[test]
    fn depth_record_encoding_clamps() {
        assert_eq!(encode_depth_record(0x0102, 77), [0x01, 0x02, 77]);
        assert_eq!(encode_depth_record(70_000, 300), [0xFF, 0xFF, 0xFF]);
    }
}
