//! Fixed-capacity ring buffer over caller-owned storage
//!
//! A [`RingBuffer`] never allocates and never owns its storage. You lend it a
//! slice whose length is a power of two, and the ring tracks two free-running
//! `u32` cursors. Only the difference of the cursors is meaningful; both are
//! allowed to wrap.
//!
//! ```
//! use usbd_core::ringbuf::RingBuffer;
//!
//! let mut storage = [0u8; 8];
//! let mut rb = RingBuffer::new(&mut storage).unwrap();
//!
//! assert_eq!(rb.write(b"hello world"), 8); // Truncated to the free space
//! let mut out = [0; 5];
//! assert_eq!(rb.read(&mut out), 5);
//! assert_eq!(&out, b"hello");
//! ```
//!
//! # Producers and consumers
//!
//! The ring has no internal lock. Methods that take `&mut self` are always
//! safe. To use one ring from two execution contexts (an interrupt handler
//! that writes, and a thread that reads) [`split()`](RingBuffer::split) it
//! into a [`Producer`] and a [`Consumer`]. Each half may live in a different
//! context. If two contexts need to *write*, they must share the producer
//! behind a lock of their own.

use core::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

/// Errors when creating a [`RingBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum InitError {
    /// The storage length is not a power of two.
    NotPowerOfTwo(usize),
    /// The storage has fewer than two elements, or more than 2^31.
    BadCapacity(usize),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::NotPowerOfTwo(len) => write!(f, "capacity {len} is not a power of two"),
            InitError::BadCapacity(len) => write!(f, "capacity {len} is out of range"),
        }
    }
}

/// Largest supported capacity
///
/// Keeps `write - read` representable next to the full condition.
const MAX_CAPACITY: usize = 1 << 31;

/// A single-producer, single-consumer ring buffer
pub struct RingBuffer<'a, T> {
    /// Write cursor. Only the writer stores to this.
    head: AtomicU32,
    /// Read cursor. Only the reader stores to this.
    tail: AtomicU32,
    mask: u32,
    buffer: NonNull<T>,
    _storage: PhantomData<&'a mut [T]>,
}

// Safety: the ring behaves like a `&mut [T]`. Shared access only exposes
// cursor loads and `peek`, which reads slots that no writer may touch.
unsafe impl<T: Send> Send for RingBuffer<'_, T> {}
unsafe impl<T: Send> Sync for RingBuffer<'_, T> {}

impl<'a, T: Copy> RingBuffer<'a, T> {
    /// Create a ring buffer over `storage`
    ///
    /// Returns an error if the length of `storage` is not a power of two,
    /// or if it's less than two. The ring starts empty; the contents of
    /// `storage` are ignored.
    pub fn new(storage: &'a mut [T]) -> Result<Self, InitError> {
        let len = storage.len();
        if len < 2 || len > MAX_CAPACITY {
            return Err(InitError::BadCapacity(len));
        }
        if !len.is_power_of_two() {
            return Err(InitError::NotPowerOfTwo(len));
        }
        Ok(RingBuffer {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            mask: (len - 1) as u32,
            // Safety: slices are never null.
            buffer: unsafe { NonNull::new_unchecked(storage.as_mut_ptr()) },
            _storage: PhantomData,
        })
    }

    /// Returns the number of elements the ring can hold
    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Returns the number of elements available to read
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    /// Returns the number of elements that may be written without truncation
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Discard all contents
    ///
    /// This only rewinds the cursors.
    pub fn reset(&mut self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }

    /// Write as much of `data` as fits
    ///
    /// Returns the number of elements written. A return value smaller than
    /// `data.len()` means that the ring filled up; the rest was not written.
    pub fn write(&mut self, data: &[T]) -> usize {
        // Safety: &mut self, so we're the only writer.
        unsafe { self.enqueue(data) }
    }

    /// Read up to `out.len()` elements
    ///
    /// Returns the number of elements read.
    pub fn read(&mut self, out: &mut [T]) -> usize {
        // Safety: &mut self, so we're the only reader.
        unsafe { self.dequeue(out) }
    }

    /// Copy up to `out.len()` elements without consuming them
    pub fn peek(&self, out: &mut [T]) -> usize {
        self.copy_out(out)
    }

    /// Write one element, returning `false` if the ring is full
    pub fn push(&mut self, item: T) -> bool {
        self.write(core::slice::from_ref(&item)) == 1
    }

    /// Read one element
    pub fn pop(&mut self) -> Option<T> {
        // Safety: &mut self, so we're the only reader.
        unsafe { self.dequeue_one() }
    }

    /// Return the oldest element without consuming it
    pub fn peek_one(&self) -> Option<T> {
        let mut item = None;
        if !self.is_empty() {
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: the slot at tail holds written data, since the ring isn't empty.
            item = Some(unsafe { self.slot(tail).read() });
        }
        item
    }

    /// Discard up to `count` of the oldest elements
    ///
    /// Returns the number of elements discarded.
    pub fn skip(&mut self, count: usize) -> usize {
        // Safety: &mut self, so we're the only reader.
        unsafe { self.advance_tail(count) }
    }

    /// Write `data`, evicting the oldest elements if there isn't enough space
    ///
    /// Unlike [`write()`](RingBuffer::write), this never truncates the new data.
    /// If `data` is longer than the whole ring, only its newest
    /// [`capacity()`](RingBuffer::capacity) elements are kept. Returns the number
    /// of elements from `data` that are now stored.
    ///
    /// This moves the read cursor, so it's only available on the whole ring,
    /// and not on a [`Producer`].
    pub fn write_overwrite(&mut self, data: &[T]) -> usize {
        let capacity = self.capacity();
        let data = &data[data.len().saturating_sub(capacity)..];
        let free = self.free_space();
        if data.len() > free {
            self.skip(data.len() - free);
        }
        self.write(data)
    }

    /// Acquire the largest contiguous run of free slots
    ///
    /// Use this for zero-copy writes, like a DMA transfer that cannot wrap
    /// around the end of the storage. Commit the elements you wrote with
    /// [`linear_write_done()`](RingBuffer::linear_write_done). An empty slice
    /// means that the ring is full.
    pub fn linear_write_setup(&mut self) -> &mut [T] {
        let (offset, len) = self.linear_write_span();
        // Safety: &mut self, so no one else observes the free slots. The span
        // is in bounds of the storage.
        unsafe { core::slice::from_raw_parts_mut(self.buffer.as_ptr().add(offset), len) }
    }

    /// Commit `count` elements written through
    /// [`linear_write_setup()`](RingBuffer::linear_write_setup)
    ///
    /// `count` is clamped to the contiguous run. Returns the committed count.
    pub fn linear_write_done(&mut self, count: usize) -> usize {
        // Safety: &mut self, so we're the only writer.
        unsafe { self.commit_linear_write(count) }
    }

    /// Acquire the largest contiguous run of readable elements
    ///
    /// Release the elements you consumed with
    /// [`linear_read_done()`](RingBuffer::linear_read_done).
    pub fn linear_read_setup(&mut self) -> &[T] {
        let (offset, len) = self.linear_read_span();
        // Safety: span is in bounds, and covers written slots.
        unsafe { core::slice::from_raw_parts(self.buffer.as_ptr().add(offset), len) }
    }

    /// Release `count` elements read through [`linear_read_setup()`](RingBuffer::linear_read_setup)
    ///
    /// `count` is clamped to the contiguous run. Returns the released count.
    pub fn linear_read_done(&mut self, count: usize) -> usize {
        let (_, len) = self.linear_read_span();
        // Safety: &mut self, so we're the only reader.
        unsafe { self.advance_tail(count.min(len)) }
    }

    /// Split the ring into a producer and a consumer
    ///
    /// The halves may be sent to different execution contexts.
    pub fn split(&mut self) -> (Producer<'_, 'a, T>, Consumer<'_, 'a, T>) {
        let ring: &RingBuffer<'a, T> = self;
        (Producer { ring }, Consumer { ring })
    }

    //
    // Role-specific primitives. Callers promise to be the only writer
    // (enqueue, commit) or the only reader (dequeue, advance_tail).
    //

    /// Pointer to the slot for `cursor`
    fn slot(&self, cursor: u32) -> *mut T {
        // Safety: masked index is always in bounds.
        unsafe { self.buffer.as_ptr().add((cursor & self.mask) as usize) }
    }

    /// # Safety
    ///
    /// Caller must be the only writer.
    pub(crate) unsafe fn enqueue(&self, data: &[T]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = self.capacity() - head.wrapping_sub(tail) as usize;
        let count = data.len().min(free);

        let offset = (head & self.mask) as usize;
        let first = count.min(self.capacity() - offset);
        ptr::copy_nonoverlapping(data.as_ptr(), self.buffer.as_ptr().add(offset), first);
        ptr::copy_nonoverlapping(data.as_ptr().add(first), self.buffer.as_ptr(), count - first);

        self.head.store(head.wrapping_add(count as u32), Ordering::Release);
        count
    }

    /// # Safety
    ///
    /// Caller must be the only writer.
    pub(crate) unsafe fn enqueue_one(&self, item: T) -> bool {
        self.enqueue(core::slice::from_ref(&item)) == 1
    }

    /// # Safety
    ///
    /// Caller must be the only reader.
    pub(crate) unsafe fn dequeue(&self, out: &mut [T]) -> usize {
        let count = self.copy_out(out);
        self.advance_tail(count)
    }

    /// # Safety
    ///
    /// Caller must be the only reader.
    pub(crate) unsafe fn dequeue_one(&self) -> Option<T> {
        let item = self.peek_one()?;
        self.advance_tail(1);
        Some(item)
    }

    /// # Safety
    ///
    /// Caller must be the only reader.
    unsafe fn advance_tail(&self, count: usize) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let count = count.min(head.wrapping_sub(tail) as usize);
        self.tail.store(tail.wrapping_add(count as u32), Ordering::Release);
        count
    }

    /// # Safety
    ///
    /// Caller must be the only writer.
    unsafe fn commit_linear_write(&self, count: usize) -> usize {
        let (_, len) = self.linear_write_span();
        let count = count.min(len);
        let head = self.head.load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(count as u32), Ordering::Release);
        count
    }

    fn copy_out(&self, out: &mut [T]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let count = out.len().min(head.wrapping_sub(tail) as usize);

        let offset = (tail & self.mask) as usize;
        let first = count.min(self.capacity() - offset);
        // Safety: copying written slots into a distinct output buffer.
        unsafe {
            ptr::copy_nonoverlapping(self.buffer.as_ptr().add(offset), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(
                self.buffer.as_ptr(),
                out.as_mut_ptr().add(first),
                count - first,
            );
        }
        count
    }

    /// Offset and length of the contiguous free run
    fn linear_write_span(&self) -> (usize, usize) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = self.capacity() - head.wrapping_sub(tail) as usize;
        let offset = (head & self.mask) as usize;
        (offset, free.min(self.capacity() - offset))
    }

    /// Offset and length of the contiguous readable run
    fn linear_read_span(&self) -> (usize, usize) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let used = head.wrapping_sub(tail) as usize;
        let offset = (tail & self.mask) as usize;
        (offset, used.min(self.capacity() - offset))
    }
}

/// The writing half of a split [`RingBuffer`]
pub struct Producer<'r, 'a, T> {
    ring: &'r RingBuffer<'a, T>,
}

impl<T: Copy> Producer<'_, '_, T> {
    /// See [`RingBuffer::write`]
    pub fn write(&mut self, data: &[T]) -> usize {
        // Safety: there's only one producer per split.
        unsafe { self.ring.enqueue(data) }
    }

    /// See [`RingBuffer::push`]
    pub fn push(&mut self, item: T) -> bool {
        // Safety: there's only one producer per split.
        unsafe { self.ring.enqueue_one(item) }
    }

    pub fn free_space(&self) -> usize {
        self.ring.free_space()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// See [`RingBuffer::linear_write_setup`]
    pub fn linear_write_setup(&mut self) -> &mut [T] {
        let (offset, len) = self.ring.linear_write_span();
        // Safety: only the producer observes free slots, and the consumer
        // never reads past head. We're the only producer.
        unsafe { core::slice::from_raw_parts_mut(self.ring.buffer.as_ptr().add(offset), len) }
    }

    /// See [`RingBuffer::linear_write_done`]
    pub fn linear_write_done(&mut self, count: usize) -> usize {
        // Safety: there's only one producer per split.
        unsafe { self.ring.commit_linear_write(count) }
    }
}

/// The reading half of a split [`RingBuffer`]
pub struct Consumer<'r, 'a, T> {
    ring: &'r RingBuffer<'a, T>,
}

impl<T: Copy> Consumer<'_, '_, T> {
    /// See [`RingBuffer::read`]
    pub fn read(&mut self, out: &mut [T]) -> usize {
        // Safety: there's only one consumer per split.
        unsafe { self.ring.dequeue(out) }
    }

    /// See [`RingBuffer::pop`]
    pub fn pop(&mut self) -> Option<T> {
        // Safety: there's only one consumer per split.
        unsafe { self.ring.dequeue_one() }
    }

    /// See [`RingBuffer::peek`]
    pub fn peek(&self, out: &mut [T]) -> usize {
        self.ring.copy_out(out)
    }

    /// See [`RingBuffer::skip`]
    pub fn skip(&mut self, count: usize) -> usize {
        // Safety: there's only one consumer per split.
        unsafe { self.ring.advance_tail(count) }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// See [`RingBuffer::linear_read_setup`]
    pub fn linear_read_setup(&mut self) -> &[T] {
        let (offset, len) = self.ring.linear_read_span();
        // Safety: the producer never writes slots between tail and head.
        unsafe { core::slice::from_raw_parts(self.ring.buffer.as_ptr().add(offset), len) }
    }

    /// See [`RingBuffer::linear_read_done`]
    pub fn linear_read_done(&mut self, count: usize) -> usize {
        let (_, len) = self.ring.linear_read_span();
        // Safety: there's only one consumer per split.
        unsafe { self.ring.advance_tail(count.min(len)) }
    }
}
