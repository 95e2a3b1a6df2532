//! Bounded multi-producer / single-consumer byte ring with a two-phase
//! reserve/commit protocol.
//!
//! The layout follows the kernel BPF ring buffer: every record is preceded by
//! an 8-byte header whose first word holds the payload length plus two flag
//! bits, and records are padded to 8 bytes.
//!
//! * `BUSY` is set while a producer is still writing; the consumer stops at a
//!   busy record, so partially written data is never observed.
//! * `DISCARD` marks a record the consumer must skip: an abandoned
//!   reservation, or the filler that keeps a record from straddling the end
//!   of the buffer.
//! * A zero header means "reserved but header not yet written" and is
//!   treated like `BUSY`.  The consumer zeroes every byte it releases, so
//!   stale headers never reappear.
//!
//! Producers claim space by advancing `producer_pos` with a bounded
//! compare-and-swap loop and never wait for the consumer: if the ring lacks
//! room, `reserve` fails immediately and the record is counted as dropped.

use std::cell::UnsafeCell;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use xdptap_common::{XdpEvent, EVENTS_RING_BYTES, RECORD_SIZE};

/// Ring size used by the XDP program and by default in user space.
pub const DEFAULT_CAPACITY: usize = EVENTS_RING_BYTES as usize;

/// Per-record header: length and flags, then a reserved word.
pub const HDR_LEN: usize = 8;

const BUSY_BIT: u32 = 1 << 31;
const DISCARD_BIT: u32 = 1 << 30;
const LEN_MASK: u32 = !(BUSY_BIT | DISCARD_BIT);

/// Compare-and-swap attempts before a contended `reserve` gives up.
const MAX_RESERVE_ATTEMPTS: usize = 64;

/// Bytes a `size`-byte payload occupies in the ring, header included.
pub const fn framed_len(size: usize) -> usize {
    (size + HDR_LEN + 7) & !7
}

/// Smallest accepted capacity: room for two event records.
pub const MIN_CAPACITY: usize = 2 * framed_len(RECORD_SIZE);

#[repr(align(64))]
struct Cursor(AtomicU64);

struct RingQueue {
    data: Box<[UnsafeCell<u64>]>,
    mask: u64,
    producer_pos: Cursor,
    consumer_pos: Cursor,
    dropped: AtomicU64,
}

// Producers only write inside ranges they won through `producer_pos`, the
// consumer only touches ranges below it, and the hand-off is ordered by the
// release/acquire pairs on the record headers and cursors.
unsafe impl Sync for RingQueue {}

impl RingQueue {
    fn new(capacity: usize) -> Self {
        let words = capacity / 8;
        Self {
            data: (0..words).map(|_| UnsafeCell::new(0)).collect(),
            mask: capacity as u64 - 1,
            producer_pos: Cursor(AtomicU64::new(0)),
            consumer_pos: Cursor(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.data.len() * 8
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr()) as *mut u8
    }

    fn offset(&self, pos: u64) -> usize {
        (pos & self.mask) as usize
    }

    fn header(&self, pos: u64) -> &AtomicU32 {
        // Positions are always multiples of 8 and the buffer is u64-aligned.
        unsafe { AtomicU32::from_ptr(self.base().add(self.offset(pos)) as *mut u32) }
    }

    /// Claim `framed_len(size)` contiguous bytes; returns the header position.
    fn reserve(&self, size: usize) -> Option<u64> {
        let pos = self.try_reserve(size);
        if pos.is_none() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        pos
    }

    fn try_reserve(&self, size: usize) -> Option<u64> {
        if size == 0 || size > LEN_MASK as usize {
            return None;
        }
        let len = framed_len(size) as u64;
        let cap = self.capacity() as u64;
        if len > cap {
            return None;
        }

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            // Consumer first: it never passes the producer, so `pos >= cons`.
            let cons = self.consumer_pos.0.load(Ordering::Acquire);
            let pos = self.producer_pos.0.load(Ordering::Relaxed);

            let to_end = cap - (pos & self.mask);
            let pad = if to_end < len { to_end } else { 0 };
            let next = pos + pad + len;
            if next.saturating_sub(cons) > cap {
                return None;
            }

            if self
                .producer_pos
                .0
                .compare_exchange_weak(pos, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if pad > 0 {
                    let filler = (pad as usize - HDR_LEN) as u32;
                    self.header(pos).store(filler | DISCARD_BIT, Ordering::Release);
                }
                let start = pos + pad;
                self.header(start)
                    .store(size as u32 | BUSY_BIT, Ordering::Release);
                return Some(start);
            }
        }
        None
    }

    /// Zero a consumed record and hand its bytes back to producers.
    fn release(&self, pos: u64, total: usize) {
        unsafe { self.base().add(self.offset(pos)).write_bytes(0, total) };
        self.consumer_pos.0.store(pos + total as u64, Ordering::Release);
    }
}

/// Create a ring of `capacity` bytes and return its two ends.
///
/// `capacity` must be a power of two of at least [`MIN_CAPACITY`] bytes.
pub fn channel(capacity: usize) -> anyhow::Result<(Producer, Consumer)> {
    anyhow::ensure!(
        capacity.is_power_of_two(),
        "ring capacity {capacity} is not a power of two"
    );
    anyhow::ensure!(
        capacity >= MIN_CAPACITY,
        "ring capacity {capacity} is below the minimum of {MIN_CAPACITY} bytes"
    );
    anyhow::ensure!(
        capacity <= LEN_MASK as usize + 1,
        "ring capacity {capacity} is too large"
    );

    let ring = Arc::new(RingQueue::new(capacity));
    Ok((Producer { ring: ring.clone() }, Consumer { ring }))
}

/// Write end of the ring.  Cheap to clone; one per ingress context.
#[derive(Clone)]
pub struct Producer {
    ring: Arc<RingQueue>,
}

impl Producer {
    /// Reserve room for a `size`-byte record without blocking.
    ///
    /// Returns `None` when the ring is full, `size` is zero or larger than
    /// the ring, or the reservation keeps losing races with other producers.
    pub fn reserve(&self, size: usize) -> Option<Slot<'_>> {
        let pos = self.ring.reserve(size)?;
        Some(Slot {
            ring: &self.ring,
            pos,
            len: size,
            done: false,
        })
    }

    /// Reserve, copy `record` and commit in one step.
    pub fn output(&self, record: &[u8]) -> bool {
        match self.reserve(record.len()) {
            Some(mut slot) => {
                slot.as_mut_slice().copy_from_slice(record);
                slot.commit();
                true
            }
            None => false,
        }
    }

    /// Publish one event record.  Returns `false` if it was dropped.
    pub fn submit_event(&self, event: &XdpEvent) -> bool {
        self.output(&event.to_bytes())
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Reservations refused since the ring was created.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

/// A reserved, not yet published record.
///
/// Dropping a slot without calling [`Slot::commit`] discards it.
pub struct Slot<'a> {
    ring: &'a RingQueue,
    pos: u64,
    len: usize,
    done: bool,
}

impl Slot<'_> {
    /// The reserved bytes.  Their content is unspecified until written.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.ring.offset(self.pos) + HDR_LEN;
        // The reservation is contiguous and owned by this slot alone.
        unsafe { slice::from_raw_parts_mut(self.ring.base().add(start), self.len) }
    }

    /// Make the record visible to the consumer.
    pub fn commit(mut self) {
        self.finish(self.len as u32);
    }

    /// Give the reservation back without publishing it.  Producers that
    /// reserve first and then find they have nothing to publish call this;
    /// the pipeline always commits, and a dropped slot discards implicitly.
    #[allow(dead_code)]
    pub fn discard(mut self) {
        self.finish(self.len as u32 | DISCARD_BIT);
    }

    fn finish(&mut self, header: u32) {
        self.ring.header(self.pos).store(header, Ordering::Release);
        self.done = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.finish(self.len as u32 | DISCARD_BIT);
        }
    }
}

/// Read end of the ring.  There is exactly one per ring.
pub struct Consumer {
    ring: Arc<RingQueue>,
}

impl Consumer {
    /// Hand the next committed record to `f` and release it.
    ///
    /// Returns `None` if nothing is ready: the ring is empty or the oldest
    /// reservation has not been committed yet.
    pub fn read_next<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let ring = &*self.ring;
        let mut cons = ring.consumer_pos.0.load(Ordering::Relaxed);
        loop {
            let prod = ring.producer_pos.0.load(Ordering::Acquire);
            if cons >= prod {
                return None;
            }

            let hdr = ring.header(cons).load(Ordering::Acquire);
            if hdr == 0 || hdr & BUSY_BIT != 0 {
                return None;
            }
            let len = (hdr & LEN_MASK) as usize;
            let total = framed_len(len);

            if hdr & DISCARD_BIT != 0 {
                ring.release(cons, total);
                cons += total as u64;
                continue;
            }

            let start = ring.offset(cons) + HDR_LEN;
            let record = unsafe { slice::from_raw_parts(ring.base().add(start), len) };
            let out = f(record);
            ring.release(cons, total);
            return Some(out);
        }
    }

    /// Next committed event.  Records too short to be an [`XdpEvent`] are
    /// skipped.
    pub fn poll(&mut self) -> Option<XdpEvent> {
        loop {
            if let Some(event) = self.read_next(XdpEvent::from_bytes)? {
                return Some(event);
            }
        }
    }

    /// Bytes currently reserved or committed but not yet consumed.
    pub fn pending_bytes(&self) -> usize {
        let prod = self.ring.producer_pos.0.load(Ordering::Acquire);
        let cons = self.ring.consumer_pos.0.load(Ordering::Relaxed);
        (prod - cons) as usize
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn event(tag: u32, seq: u32) -> XdpEvent {
        XdpEvent {
            timestamp: (u64::from(tag) << 32) | u64::from(seq),
            ifindex: tag,
            protocol: 17,
            src_ip: tag ^ seq,
            dst_ip: !seq,
            src_port: tag as u16,
            dst_port: seq as u16,
            pkt_len: seq,
            eth_proto: [0x08, 0x00],
            _pad: [0; 6],
        }
    }

    fn assert_intact(e: &XdpEvent) -> (u32, u32) {
        let tag = (e.timestamp >> 32) as u32;
        let seq = e.timestamp as u32;
        assert_eq!(*e, event(tag, seq), "corrupted record");
        (tag, seq)
    }

    #[test]
    fn test_channel_rejects_bad_capacity() {
        assert!(channel(1000).is_err());
        assert!(channel(64).is_err());
        assert!(channel(0).is_err());
        assert!(channel(MIN_CAPACITY.next_power_of_two()).is_ok());
        assert!(channel(DEFAULT_CAPACITY).is_ok());
    }

    #[test]
    fn test_default_capacity_matches_kernel_ring() {
        assert_eq!(DEFAULT_CAPACITY, EVENTS_RING_BYTES as usize);
        let (tx, _rx) = channel(EVENTS_RING_BYTES as usize).unwrap();
        assert_eq!(tx.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_reserve_commit_poll() {
        let (tx, mut rx) = channel(DEFAULT_CAPACITY).unwrap();
        assert_eq!(rx.poll(), None);

        let mut slot = tx.reserve(RECORD_SIZE).unwrap();
        slot.as_mut_slice().copy_from_slice(&event(1, 1).to_bytes());
        // Reserved but not committed: invisible.
        assert_eq!(rx.poll(), None);
        slot.commit();

        assert_eq!(rx.poll(), Some(event(1, 1)));
        assert_eq!(rx.poll(), None);
        assert_eq!(rx.pending_bytes(), 0);
    }

    #[test]
    fn test_uncommitted_record_blocks_later_ones() {
        let (tx, mut rx) = channel(DEFAULT_CAPACITY).unwrap();
        let first = tx.reserve(RECORD_SIZE).unwrap();
        assert!(tx.submit_event(&event(2, 2)));
        assert_eq!(rx.poll(), None);

        drop(first);
        assert_eq!(rx.poll(), Some(event(2, 2)));
    }

    #[test]
    fn test_discard_is_skipped() {
        let (tx, mut rx) = channel(DEFAULT_CAPACITY).unwrap();
        let mut slot = tx.reserve(RECORD_SIZE).unwrap();
        slot.as_mut_slice().copy_from_slice(&event(9, 9).to_bytes());
        slot.discard();
        assert!(tx.submit_event(&event(1, 2)));

        assert_eq!(rx.poll(), Some(event(1, 2)));
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn test_invalid_sizes_are_refused() {
        let (tx, _rx) = channel(256).unwrap();
        assert!(tx.reserve(0).is_none());
        assert!(tx.reserve(256).is_none());
        assert!(tx.reserve(256 - HDR_LEN).is_some());
    }

    #[test]
    fn test_full_ring_drops_newest() {
        let (tx, mut rx) = channel(256).unwrap();
        let per = framed_len(RECORD_SIZE);
        let fits = 256 / per;

        for i in 0..fits as u32 {
            assert!(tx.submit_event(&event(1, i)));
        }
        assert!(tx.reserve(RECORD_SIZE).is_none());
        assert!(!tx.submit_event(&event(1, 99)));
        assert_eq!(tx.dropped(), 2);

        for i in 0..fits as u32 {
            assert_eq!(rx.poll(), Some(event(1, i)));
        }
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn test_wraps_without_splitting_records() {
        let (tx, mut rx) = channel(256).unwrap();
        // 256 is not a multiple of 48, so records regularly hit the end of
        // the buffer and need a filler.
        for i in 0..1000u32 {
            assert!(tx.submit_event(&event(3, i)), "record {i} dropped");
            if i % 3 == 2 {
                for j in i - 2..=i {
                    assert_eq!(rx.poll(), Some(event(3, j)));
                }
            }
        }
        assert_eq!(rx.poll(), Some(event(3, 999)));
        assert_eq!(rx.poll(), None);
        assert_eq!(tx.dropped(), 0);
    }

    #[test]
    fn test_raw_records_of_mixed_sizes() {
        let (tx, mut rx) = channel(512).unwrap();
        for len in 1..=64usize {
            let payload: Vec<u8> = (0..len).map(|b| (b + len) as u8).collect();
            assert!(tx.output(&payload));
            let got = rx.read_next(|r| r.to_vec()).unwrap();
            assert_eq!(got, payload);
        }
    }

    #[test]
    fn test_concurrent_producers_one_record_each() {
        const PRODUCERS: u32 = 16;
        let capacity = (PRODUCERS as usize * framed_len(RECORD_SIZE)).next_power_of_two();
        let (tx, mut rx) = channel(capacity).unwrap();
        let barrier = Arc::new(Barrier::new(PRODUCERS as usize));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|tag| {
                let tx = tx.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut slot = tx.reserve(RECORD_SIZE).expect("ring has room");
                    slot.as_mut_slice().copy_from_slice(&event(tag, 0).to_bytes());
                    slot.commit();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(e) = rx.poll() {
            let (tag, _) = assert_intact(&e);
            assert!(seen.insert(tag), "duplicate record from producer {tag}");
        }
        assert_eq!(seen.len(), PRODUCERS as usize);
        assert_eq!(tx.dropped(), 0);
    }

    #[test]
    fn test_concurrent_producers_with_live_consumer() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 20_000;
        let (tx, mut rx) = channel(1024).unwrap();

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|tag| {
                let tx = tx.clone();
                thread::spawn(move || {
                    (0..PER_PRODUCER)
                        .filter(|seq| tx.submit_event(&event(tag, *seq)))
                        .count()
                })
            })
            .collect();

        let mut last = vec![None::<u32>; PRODUCERS as usize];
        let mut received = 0usize;
        let mut check = |e: XdpEvent| {
            let (tag, seq) = assert_intact(&e);
            let prev = &mut last[tag as usize];
            assert!(prev.map_or(true, |p| p < seq), "producer {tag} out of order");
            *prev = Some(seq);
            received += 1;
        };

        while !handles.iter().all(|h| h.is_finished()) {
            if let Some(e) = rx.poll() {
                check(e);
            }
        }
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        while let Some(e) = rx.poll() {
            check(e);
        }

        assert_eq!(received, admitted);
        assert_eq!(
            admitted as u64 + tx.dropped(),
            u64::from(PRODUCERS * PER_PRODUCER)
        );
    }
}
