//! Link-layer serial stream reassembly.
//!
//! Every frame exchanged with the meter starts with a one byte sequence
//! number (modulo 256), in both directions. Incoming frames may arrive out of
//! order, so payloads that are ahead of the expected sequence number are
//! parked in a reorder buffer until the gap closes.
//!
//! ```
//! use labfeed_rs::serial_reassembly::SerialReassembly;
//!
//! let mut rx = SerialReassembly::new();
//! rx.ingest_frame(&[0x00, b'A']);
//! rx.ingest_frame(&[0x02, b'C']);
//! rx.ingest_frame(&[0x01, b'B']);
//! assert_eq!(rx.contents(), b"ABC");
//! ```

use std::collections::VecDeque;

/// Incoming half of the serial layer.
#[derive(Debug, Default)]
pub struct SerialReassembly {
    /// `None` until the first frame is seen, which is taken as the sync point.
    expected: Option<u8>,
    /// Slot `k` holds the payload for sequence number `expected + 1 + k`.
    reorder: VecDeque<Option<Vec<u8>>>,
    contents: Vec<u8>,
}

impl SerialReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the sync point and drop all buffered data.
    pub fn reset(&mut self) {
        self.expected = None;
        self.reorder.clear();
        self.contents.clear();
    }

    /// Feed one link-layer frame (sequence byte followed by payload).
    ///
    /// Returns `false` only for an empty frame. Duplicate or implausible
    /// sequence numbers are not reported; they end up parked in the
    /// reorder buffer like any other frame that is ahead of the stream.
    pub fn ingest_frame(&mut self, frame: &[u8]) -> bool {
        let Some((&seq, payload)) = frame.split_first() else {
            return false;
        };

        match self.expected {
            None => {
                log::trace!("Serial stream synchronized on sequence {seq}");
                self.contents.extend_from_slice(payload);
                self.expected = Some(seq.wrapping_add(1));
            }
            Some(expected) if expected == seq => {
                self.contents.extend_from_slice(payload);
                let mut expected = seq.wrapping_add(1);

                // The head slot now lines up with the new expected number.
                while let Some(slot) = self.reorder.pop_front() {
                    match slot {
                        Some(parked) => {
                            self.contents.extend_from_slice(&parked);
                            expected = expected.wrapping_add(1);
                        }
                        None => break,
                    }
                }
                self.expected = Some(expected);
            }
            Some(expected) => {
                // ahead is 1..=255, so at most 255 slots can ever exist.
                let ahead = usize::from(seq.wrapping_sub(expected));
                let slot = ahead - 1;
                log::trace!(
                    "Frame {seq} arrived while expecting {expected}, parking in slot {slot}"
                );
                if self.reorder.len() <= slot {
                    self.reorder.resize(slot + 1, None);
                }
                self.reorder[slot] = Some(payload.to_vec());
            }
        }

        true
    }

    /// The in-order reassembled bytes not yet consumed.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Remove `count` bytes from the front of the reassembled stream.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.contents.len());
        self.contents.drain(..count);
    }

    /// The next sequence number the stream is waiting for, if synchronized.
    pub fn expected_sequence_number(&self) -> Option<u8> {
        self.expected
    }

    /// Number of reorder slots currently allocated (parked or placeholder).
    pub fn pending_slots(&self) -> usize {
        self.reorder.len()
    }
}

/// Outgoing half of the serial layer: stamps frames with a sequence number.
#[derive(Debug, Default, Clone)]
pub struct TxSequence {
    next: u8,
}

impl TxSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Take the sequence number for the next outgoing frame.
    pub fn advance(&mut self) -> u8 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn peek(&self) -> u8 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery_concatenates() {
        let mut rx = SerialReassembly::new();
        assert!(rx.ingest_frame(&[0x00, b'A']));
        assert!(rx.ingest_frame(&[0x01, b'B']));
        assert_eq!(rx.contents(), b"AB");
        assert_eq!(rx.expected_sequence_number(), Some(2));
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let mut rx = SerialReassembly::new();
        assert!(!rx.ingest_frame(&[]));
        assert!(rx.contents().is_empty());
        assert_eq!(rx.expected_sequence_number(), None);
    }

    #[test]
    fn test_first_frame_is_sync_point() {
        let mut rx = SerialReassembly::new();
        rx.ingest_frame(&[0x42, 1, 2, 3]);
        assert_eq!(rx.contents(), &[1, 2, 3]);
        assert_eq!(rx.expected_sequence_number(), Some(0x43));
    }

    #[test]
    fn test_swapped_frames_are_reordered() {
        let mut rx = SerialReassembly::new();
        rx.ingest_frame(&[0x00, b'B']);
        rx.ingest_frame(&[0x02, b'D']);
        assert_eq!(rx.contents(), b"B");
        rx.ingest_frame(&[0x01, b'C']);
        assert_eq!(rx.contents(), b"BCD");
        assert_eq!(rx.pending_slots(), 0);
    }

    #[test]
    fn test_single_gap_matches_in_order_result() {
        let frames: [&[u8]; 4] = [&[0, 10, 11], &[1, 20], &[2, 30, 31, 32], &[3, 40]];

        let mut ordered = SerialReassembly::new();
        for frame in frames {
            ordered.ingest_frame(frame);
        }

        let mut shuffled = SerialReassembly::new();
        for index in [0, 2, 1, 3] {
            shuffled.ingest_frame(frames[index]);
        }

        assert_eq!(ordered.contents(), shuffled.contents());
        assert_eq!(shuffled.contents(), &[10, 11, 20, 30, 31, 32, 40]);
    }

    #[test]
    fn test_sequence_wraps_around() {
        let mut rx = SerialReassembly::new();
        rx.ingest_frame(&[0xFE, 1]);
        rx.ingest_frame(&[0x00, 3]);
        rx.ingest_frame(&[0xFF, 2]);
        assert_eq!(rx.contents(), &[1, 2, 3]);
        assert_eq!(rx.expected_sequence_number(), Some(1));
    }

    #[test]
    fn test_multiple_gaps_drain_in_order() {
        let mut rx = SerialReassembly::new();
        rx.ingest_frame(&[0, b'a']);
        rx.ingest_frame(&[4, b'e']);
        rx.ingest_frame(&[2, b'c']);
        assert_eq!(rx.pending_slots(), 3);

        rx.ingest_frame(&[1, b'b']);
        assert_eq!(rx.contents(), b"abc");

        rx.ingest_frame(&[3, b'd']);
        assert_eq!(rx.contents(), b"abcde");
        assert_eq!(rx.expected_sequence_number(), Some(5));
        assert_eq!(rx.pending_slots(), 0);
    }

    #[test]
    fn test_far_ahead_frame_allocates_bounded_slots() {
        let mut rx = SerialReassembly::new();
        rx.ingest_frame(&[0, 0]);
        // A stale duplicate of frame 0 looks 255 frames ahead.
        rx.ingest_frame(&[0, 0]);
        assert_eq!(rx.pending_slots(), 255);
        assert_eq!(rx.contents(), &[0]);
    }

    #[test]
    fn test_consume_and_reset() {
        let mut rx = SerialReassembly::new();
        rx.ingest_frame(&[7, 1, 2, 3, 4]);
        rx.consume(3);
        assert_eq!(rx.contents(), &[4]);
        rx.consume(10);
        assert!(rx.contents().is_empty());

        rx.reset();
        assert_eq!(rx.expected_sequence_number(), None);
    }

    #[test]
    fn test_tx_sequence_wraps() {
        let mut tx = TxSequence::new();
        for expected in 0..=255u8 {
            assert_eq!(tx.advance(), expected);
        }
        assert_eq!(tx.advance(), 0);
    }
}
