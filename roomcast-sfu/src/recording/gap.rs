//! Silence insertion for discontinuous Opus streams
//!
//! Browsers stop sending audio while a track is muted or during DTX, which
//! leaves holes in the RTP timeline. Without repair the Ogg file would simply
//! splice the audio on both sides of the hole together, so every later sample
//! of the track would drift earlier in the final mix.

use bytes::Bytes;
use webrtc::rtp::packet::Packet;

/// RTP clock rate of Opus
pub const OPUS_CLOCK_RATE: u32 = 48_000;

/// Ticks per synthetic frame (20 ms)
pub const FRAME_TICKS: u32 = 960;

/// Gaps up to this many ticks (100 ms) are left to the jitter buffer
pub const MIN_GAP_TICKS: u32 = 4_800;

/// Gaps of this many ticks (2 s) or more are treated as a stream reset
pub const MAX_GAP_TICKS: u32 = 96_000;

/// Opus TOC byte plus padding that decodes as one 20 ms silent frame
pub const SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Rewrites one track's packet stream so that short holes become silence
#[derive(Debug, Default)]
pub struct GapFiller {
    /// Timestamp and output sequence number of the newest forwarded packet
    last: Option<(u32, u16)>,
    /// Added to every inbound sequence number
    seq_offset: u16,
    /// Most recent timestamp range covered by synthetic frames, exclusive
    filled: Option<(u32, u32)>,
    inserted: u64,
}

/// `a` is later than `b` in RTP timestamp order
fn ts_after(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

impl GapFiller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of synthetic frames inserted so far
    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    fn in_filled_range(&self, timestamp: u32) -> bool {
        self.filled
            .is_some_and(|(from, to)| ts_after(timestamp, from) && ts_after(to, timestamp))
    }

    /// Feed one inbound packet, returning the packets to hand downstream
    pub fn push(&mut self, mut packet: Packet) -> Vec<Packet> {
        let timestamp = packet.header.timestamp;

        let Some((last_ts, last_seq)) = self.last else {
            self.last = Some((timestamp, packet.header.sequence_number));
            return vec![packet];
        };

        if !ts_after(timestamp, last_ts) {
            if self.in_filled_range(timestamp) {
                return Vec::new();
            }
            packet.header.sequence_number =
                packet.header.sequence_number.wrapping_add(self.seq_offset);
            return vec![packet];
        }

        let gap = timestamp.wrapping_sub(last_ts);
        let mut out = Vec::new();

        if gap > MIN_GAP_TICKS && gap < MAX_GAP_TICKS {
            // Frames k = 1.. while the frame ends no later than the next real packet
            let frames = gap / FRAME_TICKS - 1;
            for k in 1..=frames {
                let mut header = packet.header.clone();
                header.timestamp = last_ts.wrapping_add(k * FRAME_TICKS);
                header.sequence_number = last_seq.wrapping_add(k as u16);
                header.marker = false;
                header.padding = false;
                out.push(Packet {
                    header,
                    payload: Bytes::from_static(&SILENCE_FRAME),
                });
            }
            let next_seq = last_seq.wrapping_add(frames as u16 + 1);
            self.seq_offset = next_seq.wrapping_sub(packet.header.sequence_number);
            self.filled = Some((last_ts, timestamp));
            self.inserted += u64::from(frames);
        }

        packet.header.sequence_number =
            packet.header.sequence_number.wrapping_add(self.seq_offset);
        self.last = Some((timestamp, packet.header.sequence_number));
        out.push(packet);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::rtp_packet;

    fn stamps(packets: &[Packet]) -> Vec<(u16, u32)> {
        packets
            .iter()
            .map(|p| (p.header.sequence_number, p.header.timestamp))
            .collect()
    }

    #[test]
    fn test_contiguous_stream_is_untouched() {
        let mut filler = GapFiller::new();
        let mut out = Vec::new();
        for i in 0..5u16 {
            out.extend(filler.push(rtp_packet(100 + i, 960 * u32::from(i), b"a")));
        }
        assert_eq!(out.len(), 5);
        assert_eq!(out[4].header.sequence_number, 104);
        assert_eq!(filler.inserted(), 0);
    }

    #[test]
    fn test_150ms_gap_is_filled_without_overlap() {
        let mut filler = GapFiller::new();
        filler.push(rtp_packet(10, 1000, b"a"));

        // 150 ms after the previous packet
        let out = filler.push(rtp_packet(11, 1000 + 7200, b"b"));
        let synthetic = &out[..out.len() - 1];
        assert_eq!(synthetic.len(), 6);
        for (k, packet) in synthetic.iter().enumerate() {
            let k = k as u32 + 1;
            assert_eq!(packet.header.timestamp, 1000 + k * FRAME_TICKS);
            assert_eq!(&packet.payload[..], &SILENCE_FRAME[..]);
            assert!(packet.header.timestamp + FRAME_TICKS <= 1000 + 7200);
        }

        let seqs: Vec<u16> = out.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, (11..=17).collect::<Vec<_>>());

        // Later packets keep the new numbering
        let next = filler.push(rtp_packet(12, 1000 + 7200 + 960, b"c"));
        assert_eq!(stamps(&next), vec![(18, 1000 + 8160)]);
    }

    #[test]
    fn test_gap_with_partial_frame() {
        let mut filler = GapFiller::new();
        filler.push(rtp_packet(1, 0, b"a"));
        let out = filler.push(rtp_packet(2, 960 + 7200, b"b"));
        assert_eq!(out.len(), 8);
        assert_eq!(filler.inserted(), 7);
    }

    #[test]
    fn test_small_and_huge_gaps_are_ignored() {
        let mut filler = GapFiller::new();
        filler.push(rtp_packet(1, 0, b"a"));
        assert_eq!(filler.push(rtp_packet(2, MIN_GAP_TICKS, b"b")).len(), 1);
        assert_eq!(
            filler.push(rtp_packet(3, MIN_GAP_TICKS + MAX_GAP_TICKS, b"c")).len(),
            1
        );
        assert_eq!(filler.inserted(), 0);
    }

    #[test]
    fn test_late_packet_inside_filled_range_is_dropped() {
        let mut filler = GapFiller::new();
        filler.push(rtp_packet(1, 0, b"a"));
        filler.push(rtp_packet(5, 9600, b"b"));

        assert!(filler.push(rtp_packet(3, 4800, b"late")).is_empty());

        // Reordered packets outside the filled range still pass
        let out = filler.push(rtp_packet(4, 9600, b"dup"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_timestamp_wraparound() {
        let mut filler = GapFiller::new();
        let start = u32::MAX - 2000;
        filler.push(rtp_packet(1, start, b"a"));
        let out = filler.push(rtp_packet(2, start.wrapping_add(7200), b"b"));
        assert_eq!(out.len(), 7);
        assert_eq!(out[0].header.timestamp, start.wrapping_add(FRAME_TICKS));
    }
}
