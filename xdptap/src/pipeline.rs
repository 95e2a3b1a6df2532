use std::sync::OnceLock;
use std::time::Instant;

use xdptap_common::{decode, Frame};

use crate::ring::Producer;

/// Forwarding decision returned to the ingress path.  Telemetry never drops
/// or redirects traffic, so there is only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
}

/// Per-frame hot path: decode, and if that yields an event, try to publish
/// it.  Neither an undecodable frame nor a full ring changes the verdict.
#[inline]
pub fn handle_frame(frame: &Frame<'_>, events: &Producer) -> Verdict {
    if let Some(event) = decode(frame) {
        // A full ring is counted by the producer; the frame still passes.
        events.submit_event(&event);
    }
    Verdict::Pass
}

/// Monotonic nanoseconds since the first call in this process.
pub fn monotonic_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START.get_or_init(Instant::now).elapsed();
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{self, framed_len};
    use crate::traffic::FrameBuilder;
    use xdptap_common::RECORD_SIZE;

    #[test]
    fn test_decoded_frame_is_published() {
        let (tx, mut rx) = ring::channel(ring::DEFAULT_CAPACITY).unwrap();
        let bytes = FrameBuilder::udp([10, 0, 0, 1], [10, 0, 0, 2], 53, 12345)
            .pad_to(60)
            .build();

        let verdict = handle_frame(&Frame::new(&bytes, 4, 1_000), &tx);
        assert_eq!(verdict, Verdict::Pass);

        let event = rx.poll().unwrap();
        assert_eq!(event.protocol, 17);
        assert_eq!(event.src_port, 53);
        assert_eq!(event.dst_port, 12345);
        assert_eq!(event.pkt_len, 60);
        assert_eq!(event.ifindex, 4);
        assert_eq!(event.timestamp, 1_000);
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn test_undecodable_frame_passes_silently() {
        let (tx, mut rx) = ring::channel(ring::DEFAULT_CAPACITY).unwrap();
        let arp = FrameBuilder::arp().build();

        assert_eq!(handle_frame(&Frame::new(&arp, 1, 0), &tx), Verdict::Pass);
        assert_eq!(handle_frame(&Frame::new(&arp[..10], 1, 0), &tx), Verdict::Pass);
        assert_eq!(rx.poll(), None);
        assert_eq!(tx.dropped(), 0);
    }

    #[test]
    fn test_full_ring_still_passes() {
        let capacity = 256;
        let (tx, mut rx) = ring::channel(capacity).unwrap();
        let bytes = FrameBuilder::tcp([1, 1, 1, 1], [2, 2, 2, 2], 443, 50000).build();
        let fits = capacity / framed_len(RECORD_SIZE);

        for _ in 0..fits + 3 {
            assert_eq!(handle_frame(&Frame::new(&bytes, 1, 0), &tx), Verdict::Pass);
        }
        assert_eq!(tx.dropped(), 3);

        let mut received = 0;
        while let Some(event) = rx.poll() {
            assert_eq!(event.src_port, 443);
            received += 1;
        }
        assert_eq!(received, fits);
    }

    #[test]
    fn test_monotonic_ns_never_goes_back() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
