//! Fixed-capacity ring buffer with watermark bookkeeping.
//!
//! The producer only ever advances the write cursor and the consumer only
//! ever advances the read cursor. `read == write` means empty, and a write
//! must leave at least one free slot, so the buffer never becomes
//! ambiguous between empty and full.
//!
//! Both cursors are atomics: the producer publishes its cursor with release
//! ordering after filling the slots, and the consumer does the same after
//! draining them. That pairing is the only synchronization between the two
//! sides. [`CircularBuffer::split`] hands each side to its own thread.

use std::fmt;
use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};
use std::sync::Arc;

/// Values a ring buffer slot can hold without locking
pub trait RingElement: Copy + Default + Send + Sync + 'static {
    type Cell: Send + Sync;

    fn into_cell(self) -> Self::Cell;
    fn load(cell: &Self::Cell) -> Self;
    fn store(cell: &Self::Cell, value: Self);
}

macro_rules! integer_element {
    ($($ty:ty => $atomic:ty),* $(,)?) => {
        $(
            impl RingElement for $ty {
                type Cell = $atomic;

                fn into_cell(self) -> $atomic {
                    <$atomic>::new(self)
                }

                fn load(cell: &$atomic) -> Self {
                    cell.load(Ordering::Relaxed)
                }

                fn store(cell: &$atomic, value: Self) {
                    cell.store(value, Ordering::Relaxed);
                }
            }
        )*
    };
}

integer_element!(
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    i16 => AtomicI16,
    i32 => AtomicI32,
);

// floats travel as their bit patterns
impl RingElement for f32 {
    type Cell = AtomicU32;

    fn into_cell(self) -> AtomicU32 {
        AtomicU32::new(self.to_bits())
    }

    fn load(cell: &AtomicU32) -> Self {
        Self::from_bits(cell.load(Ordering::Relaxed))
    }

    fn store(cell: &AtomicU32, value: Self) {
        cell.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl RingElement for f64 {
    type Cell = AtomicU64;

    fn into_cell(self) -> AtomicU64 {
        AtomicU64::new(self.to_bits())
    }

    fn load(cell: &AtomicU64) -> Self {
        Self::from_bits(cell.load(Ordering::Relaxed))
    }

    fn store(cell: &AtomicU64, value: Self) {
        cell.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Elements stored between `from` and `to`, walking forward
fn distance(from: usize, to: usize, len: usize) -> usize {
    (to + len - from) % len
}

/// Slots and cursors shared by both halves
struct Ring<T: RingElement> {
    slots: Box<[T::Cell]>,
    read_idx: AtomicUsize,
    write_idx: AtomicUsize,
    rejected_writes: AtomicU64,
}

impl<T: RingElement> Ring<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "CircularBuffer capacity must be non-zero");
        Self {
            slots: (0..capacity).map(|_| T::default().into_cell()).collect(),
            read_idx: AtomicUsize::new(0),
            write_idx: AtomicUsize::new(0),
            rejected_writes: AtomicU64::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn readable(&self) -> usize {
        let read = self.read_idx.load(Ordering::Acquire);
        let write = self.write_idx.load(Ordering::Acquire);
        distance(read, write, self.capacity())
    }

    fn writable(&self) -> usize {
        self.capacity() - self.readable()
    }

    /// Only the producing side may call this
    fn write(&self, src: &[T]) -> bool {
        let len = self.capacity();
        let n = src.len();
        let write = self.write_idx.load(Ordering::Relaxed);
        let read = self.read_idx.load(Ordering::Acquire);

        if n > len || len - distance(read, write, len) <= n {
            self.rejected_writes.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "Won't write {} elements to ring buffer (W: {}, R: {})",
                n,
                write,
                read
            );
            return false;
        }

        let first = n.min(len - write);
        for (cell, &value) in self.slots[write..write + first].iter().zip(&src[..first]) {
            T::store(cell, value);
        }
        for (cell, &value) in self.slots[..n - first].iter().zip(&src[first..]) {
            T::store(cell, value);
        }

        self.write_idx.store((write + n) % len, Ordering::Release);
        true
    }

    /// Only the consuming side may call this
    fn read(&self, dst: &mut [T]) -> bool {
        let len = self.capacity();
        let n = dst.len();
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);

        if n > len || distance(read, write, len) < n {
            log::trace!(
                "Won't read {} elements from ring buffer (W: {}, R: {})",
                n,
                write,
                read
            );
            return false;
        }

        let first = n.min(len - read);
        let (head, tail) = dst.split_at_mut(first);
        for (out, cell) in head.iter_mut().zip(&self.slots[read..read + first]) {
            *out = T::load(cell);
            T::store(cell, T::default());
        }
        for (out, cell) in tail.iter_mut().zip(&self.slots[..n - first]) {
            *out = T::load(cell);
            T::store(cell, T::default());
        }

        self.read_idx.store((read + n) % len, Ordering::Release);
        true
    }

    fn written_since(&self, last_write_idx: &mut usize) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let amount = distance(*last_write_idx, write, self.capacity());
        *last_write_idx = write;
        amount
    }

    fn read_since(&self, last_read_idx: &mut usize) -> usize {
        let read = self.read_idx.load(Ordering::Acquire);
        let amount = distance(*last_read_idx, read, self.capacity());
        *last_read_idx = read;
        amount
    }

    fn rejected_writes(&self) -> u64 {
        self.rejected_writes.load(Ordering::Relaxed)
    }
}

impl<T: RingElement> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("read_idx", &self.read_idx)
            .field("write_idx", &self.write_idx)
            .finish_non_exhaustive()
    }
}

/// A ring buffer driven from a single thread.
///
/// Both ends are available here; [`split`](Self::split) separates them.
#[derive(Debug)]
pub struct CircularBuffer<T: RingElement> {
    ring: Ring<T>,
    last_write_idx: usize,
    last_read_idx: usize,
}

impl<T: RingElement> CircularBuffer<T> {
    /// Create a buffer holding `capacity` elements, all set to `T::default()`
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
            last_write_idx: 0,
            last_read_idx: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of slots between the write cursor and the read cursor.
    /// Equal cursors count as fully writable.
    pub fn writable(&self) -> usize {
        self.ring.writable()
    }

    /// Number of elements waiting between the read cursor and the write cursor
    pub fn readable(&self) -> usize {
        self.ring.readable()
    }

    /// Copy `src` in at the write cursor.
    ///
    /// Requires strictly more free space than `src.len()`; an exact fit is
    /// rejected. Returns `false` and leaves the buffer untouched otherwise.
    pub fn write(&mut self, src: &[T]) -> bool {
        self.ring.write(src)
    }

    /// Copy `dst.len()` elements out from the read cursor, resetting the
    /// vacated slots to `T::default()`.
    ///
    /// Returns `false` and leaves `dst` untouched when fewer than
    /// `dst.len()` elements are readable.
    pub fn read(&mut self, dst: &mut [T]) -> bool {
        self.ring.read(dst)
    }

    /// Elements written since the previous call
    pub fn amount_written(&mut self) -> usize {
        self.ring.written_since(&mut self.last_write_idx)
    }

    /// Elements read since the previous call
    pub fn amount_read(&mut self) -> usize {
        self.ring.read_since(&mut self.last_read_idx)
    }

    /// Writes refused for lack of space since construction
    pub fn rejected_writes(&self) -> u64 {
        self.ring.rejected_writes()
    }

    /// Separate the writing end from the reading end so each can live on
    /// its own thread. Contents and watermarks carry over.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let ring = Arc::new(self.ring);
        (
            Producer {
                ring: Arc::clone(&ring),
                last_read_idx: self.last_read_idx,
            },
            Consumer {
                ring,
                last_write_idx: self.last_write_idx,
            },
        )
    }
}

/// Writing end of a split [`CircularBuffer`]
#[derive(Debug)]
pub struct Producer<T: RingElement> {
    ring: Arc<Ring<T>>,
    last_read_idx: usize,
}

impl<T: RingElement> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// May lag behind the consumer, never runs ahead of it
    pub fn writable(&self) -> usize {
        self.ring.writable()
    }

    pub fn readable(&self) -> usize {
        self.ring.readable()
    }

    /// Same contract as [`CircularBuffer::write`]
    pub fn write(&mut self, src: &[T]) -> bool {
        self.ring.write(src)
    }

    /// Elements the consumer took since the previous call
    pub fn amount_read(&mut self) -> usize {
        self.ring.read_since(&mut self.last_read_idx)
    }

    pub fn rejected_writes(&self) -> u64 {
        self.ring.rejected_writes()
    }
}

/// Reading end of a split [`CircularBuffer`]
#[derive(Debug)]
pub struct Consumer<T: RingElement> {
    ring: Arc<Ring<T>>,
    last_write_idx: usize,
}

impl<T: RingElement> Consumer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn writable(&self) -> usize {
        self.ring.writable()
    }

    /// May lag behind the producer, never runs ahead of it
    pub fn readable(&self) -> usize {
        self.ring.readable()
    }

    /// Same contract as [`CircularBuffer::read`]
    pub fn read(&mut self, dst: &mut [T]) -> bool {
        self.ring.read(dst)
    }

    /// Elements the producer added since the previous call
    pub fn amount_written(&mut self) -> usize {
        self.ring.written_since(&mut self.last_write_idx)
    }

    pub fn rejected_writes(&self) -> u64 {
        self.ring.rejected_writes()
    }
}
