//! Fixed-size block pool
//!
//! A `BlockPool` hands out fixed-size blocks carved from caller-owned
//! memory. A producer (usually an interrupt handler) allocates a block, fills
//! it, and sends it. A consumer thread receives the block, processes it, and
//! frees it. Every block is in exactly one of three places:
//!
//! - the *free* ring, ready for [`alloc()`](BlockPool::alloc);
//! - a live [`Block`] handle, *in flight*;
//! - the *ready* ring, counted by the semaphore, waiting for
//!   [`recv()`](BlockPool::recv).
//!
//! `alloc()`, `free()`, and `send()` never block. `recv()` is the only call
//! that waits.
//!
//! To use the pool from two execution contexts, [`split()`](BlockPool::split)
//! it into a [`PoolProducer`] and a [`PoolConsumer`]. Each of the two index
//! rings then has exactly one writer and one reader.
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "std")] {
//! use usbd_core::{
//!     mempool::{BlockPool, PoolSlots},
//!     osal::{StdSemaphore, Timeout},
//! };
//!
//! let mut memory = [0u8; 4 * 64];
//! let mut slots = PoolSlots::<4>::new();
//! let pool: BlockPool<StdSemaphore> =
//!     BlockPool::new(&mut memory, 64, 4, &mut slots).unwrap();
//!
//! let mut block = pool.alloc().unwrap();
//! block[0] = 0xAB;
//! pool.send(block).unwrap();
//!
//! let block = pool.recv(Timeout::NoWait).unwrap();
//! assert_eq!(block[0], 0xAB);
//! pool.free(block).unwrap();
//! # }
//! ```

use crate::{
    osal::{Semaphore, Timeout},
    ringbuf::{InitError, RingBuffer},
};
use core::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

/// Block pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The pool was created with zero blocks.
    NoBlocks,
    /// The block count exceeds the capacity of the [`PoolSlots`].
    TooManyBlocks { count: usize, max: usize },
    /// The block size is zero, or not a multiple of four.
    InvalidBlockSize(usize),
    /// The block memory is smaller than `block_size * block_count`.
    ShortBuffer,
    /// The [`PoolSlots`] capacity is not a usable ring size.
    Ring(InitError),
    /// The OS couldn't create the semaphore.
    Semaphore,
    /// `recv()` waited without seeing a block.
    TimedOut,
    /// An index ring was full. This indicates a block that was
    /// counted twice.
    QueueFull,
    /// The block doesn't belong to this pool.
    ForeignBlock,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoBlocks => f.write_str("pool has no blocks"),
            Error::TooManyBlocks { count, max } => {
                write!(f, "{count} blocks exceed the slot capacity of {max}")
            }
            Error::InvalidBlockSize(size) => {
                write!(f, "block size {size} is not a non-zero multiple of 4")
            }
            Error::ShortBuffer => f.write_str("block memory is too small"),
            Error::Ring(err) => write!(f, "index ring: {err}"),
            Error::Semaphore => f.write_str("could not create semaphore"),
            Error::TimedOut => f.write_str("timed out waiting for a block"),
            Error::QueueFull => f.write_str("index ring is full"),
            Error::ForeignBlock => f.write_str("block belongs to another pool"),
        }
    }
}

impl From<InitError> for Error {
    fn from(err: InitError) -> Self {
        Error::Ring(err)
    }
}

/// Index storage for a [`BlockPool`]
///
/// `N` is the maximum number of blocks, and it must be a power of two.
/// Allocate this in a static, or on a stack that outlives the pool.
pub struct PoolSlots<const N: usize> {
    free: [usize; N],
    ready: [usize; N],
}

impl<const N: usize> PoolSlots<N> {
    /// Allocate space for the pool's free and ready rings
    pub const fn new() -> Self {
        PoolSlots {
            free: [0; N],
            ready: [0; N],
        }
    }
}

impl<const N: usize> Default for PoolSlots<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-flight block
///
/// You own the block's bytes until you `send()` or `free()` it. Blocks can't
/// be cloned, so a block can't be returned to the pool twice. Dropping a
/// block without returning it leaks the block until the pool is
/// [`reset()`](BlockPool::reset).
pub struct Block<'p> {
    index: usize,
    data: NonNull<u8>,
    len: usize,
    _pool: PhantomData<&'p [u8]>,
}

// Safety: a block is the only handle to its bytes. See `alloc()` and
// `recv()`, which are the only places where a block is created.
unsafe impl Send for Block<'_> {}
unsafe impl Sync for Block<'_> {}

impl Block<'_> {
    /// The block's position in the pool memory
    pub fn index(&self) -> usize {
        self.index
    }

    /// A pointer to the first byte of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for Block<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // Safety: the block spans `len` bytes of the pool memory, and no
        // other handle refers to those bytes.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl DerefMut for Block<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: see deref().
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl fmt::Debug for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// A fixed-size block pool
///
/// `S` is the semaphore that counts ready blocks. See the [module
/// documentation](crate::mempool) for the block lifecycle.
///
/// The pool's `&self` methods are safe to call from one execution context
/// at a time, so the pool is `Send`, but not `Sync`. Use
/// [`split()`](BlockPool::split) to share it between a producer and a
/// consumer.
pub struct BlockPool<'a, S> {
    free: RingBuffer<'a, usize>,
    ready: RingBuffer<'a, usize>,
    available: S,
    base: NonNull<u8>,
    block_size: usize,
    block_count: usize,
    _memory: PhantomData<&'a mut [u8]>,
}

// Safety: the pool exclusively borrows its block memory and index storage
// for 'a. Moving it to another context moves all of that access with it.
unsafe impl<S: Send> Send for BlockPool<'_, S> {}

impl<'a, S: Semaphore> BlockPool<'a, S> {
    /// Create a pool of `block_count` blocks, each `block_size` bytes
    ///
    /// The blocks are carved from the front of `memory`. All blocks start
    /// out free.
    pub fn new<const N: usize>(
        memory: &'a mut [u8],
        block_size: usize,
        block_count: usize,
        slots: &'a mut PoolSlots<N>,
    ) -> Result<Self, Error> {
        if block_count == 0 {
            return Err(Error::NoBlocks);
        }
        if block_count > N {
            return Err(Error::TooManyBlocks {
                count: block_count,
                max: N,
            });
        }
        if block_size == 0 || block_size % 4 != 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        match block_size.checked_mul(block_count) {
            Some(needed) if needed <= memory.len() => {}
            _ => return Err(Error::ShortBuffer),
        }

        let free = RingBuffer::new(&mut slots.free)?;
        let ready = RingBuffer::new(&mut slots.ready)?;
        // block_count <= N <= the largest ring capacity, which fits in u32.
        let available = S::create(0, block_count as u32).ok_or(Error::Semaphore)?;

        let mut pool = BlockPool {
            free,
            ready,
            available,
            base: NonNull::from(memory).cast(),
            block_size,
            block_count,
            _memory: PhantomData,
        };
        pool.seed();
        debug!("POOL CREATE {} x {}", block_count, block_size);
        Ok(pool)
    }

    /// Every block goes back on the free ring.
    fn seed(&mut self) {
        self.free.reset();
        self.ready.reset();
        self.available.reset();
        for index in 0..self.block_count {
            self.free.push(index);
        }
    }

    /// The size of each block, in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The number of blocks managed by the pool
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// The number of blocks available to `alloc()`
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// The number of blocks waiting for `recv()`
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// The number of blocks held by `Block` handles
    pub fn in_flight(&self) -> usize {
        self.block_count
            .saturating_sub(self.free_count() + self.ready_count())
    }

    /// Allocate a free block
    ///
    /// Returns `None` if every block is ready or in flight. This never blocks.
    pub fn alloc(&self) -> Option<Block<'_>> {
        // Safety: the pool isn't Sync, so this is the only reader of the
        // free ring.
        unsafe { self.take_free() }
    }

    /// Return a block to the free ring
    pub fn free(&self, block: Block<'_>) -> Result<(), Error> {
        // Safety: the pool isn't Sync, so this is the only writer of the
        // free ring.
        unsafe { self.put_free(block) }
    }

    /// Hand a filled block to the consumer
    ///
    /// This never blocks.
    pub fn send(&self, block: Block<'_>) -> Result<(), Error> {
        // Safety: the pool isn't Sync, so this is the only writer of the
        // ready ring.
        unsafe { self.put_ready(block) }
    }

    /// Receive a block sent by the producer, waiting up to `timeout`
    ///
    /// On timeout, returns [`Error::TimedOut`] and leaves the pool unchanged.
    pub fn recv(&self, timeout: Timeout) -> Result<Block<'_>, Error> {
        // Safety: the pool isn't Sync, so this is the only reader of the
        // ready ring.
        unsafe { self.take_ready(timeout) }
    }

    /// Force every block back to the free ring
    ///
    /// Ready blocks and pending semaphore counts are discarded. Since blocks
    /// borrow the pool, no handle can survive a reset.
    pub fn reset(&mut self) {
        self.seed();
        debug!("POOL RESET");
    }

    /// Split the pool into a producer and a consumer
    ///
    /// The two halves may run in different execution contexts, like an
    /// interrupt handler and a thread.
    pub fn split(&mut self) -> (PoolProducer<'_, 'a, S>, PoolConsumer<'_, 'a, S>) {
        let pool: &BlockPool<'a, S> = self;
        (PoolProducer { pool }, PoolConsumer { pool })
    }

    fn block(&self, index: usize) -> Block<'_> {
        // Safety: index < block_count, and the memory spans
        // block_size * block_count bytes. Checked in new().
        let data =
            unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.block_size)) };
        Block {
            index,
            data,
            len: self.block_size,
            _pool: PhantomData,
        }
    }

    fn owns(&self, block: &Block<'_>) -> bool {
        block.index < self.block_count
            && block.len == self.block_size
            && block.as_ptr() == self.block(block.index).as_ptr()
    }

    /// # Safety
    ///
    /// Caller must be the only reader of the free ring.
    unsafe fn take_free(&self) -> Option<Block<'_>> {
        let index = self.free.dequeue_one()?;
        trace!("POOL ALLOC {}", index);
        Some(self.block(index))
    }

    /// # Safety
    ///
    /// Caller must be the only writer of the free ring.
    unsafe fn put_free(&self, block: Block<'_>) -> Result<(), Error> {
        if !self.owns(&block) {
            warn!("POOL FREE FOREIGN BLOCK");
            return Err(Error::ForeignBlock);
        }
        trace!("POOL FREE {}", block.index);
        if self.free.enqueue_one(block.index) {
            Ok(())
        } else {
            Err(Error::QueueFull)
        }
    }

    /// # Safety
    ///
    /// Caller must be the only writer of the ready ring.
    unsafe fn put_ready(&self, block: Block<'_>) -> Result<(), Error> {
        if !self.owns(&block) {
            warn!("POOL SEND FOREIGN BLOCK");
            return Err(Error::ForeignBlock);
        }
        trace!("POOL SEND {}", block.index);
        if !self.ready.enqueue_one(block.index) {
            return Err(Error::QueueFull);
        }
        // The index is visible before the count, so a successful take()
        // always finds it.
        self.available.give();
        Ok(())
    }

    /// # Safety
    ///
    /// Caller must be the only reader of the ready ring.
    unsafe fn take_ready(&self, timeout: Timeout) -> Result<Block<'_>, Error> {
        self.available.take(timeout).map_err(|_| Error::TimedOut)?;
        match self.ready.dequeue_one() {
            Some(index) => {
                trace!("POOL RECV {}", index);
                Ok(self.block(index))
            }
            None => {
                error!("POOL SEMAPHORE WITHOUT READY BLOCK");
                Err(Error::TimedOut)
            }
        }
    }
}

/// The producing half of a [`BlockPool`]
///
/// Allocates and sends blocks. Create this with [`BlockPool::split()`].
pub struct PoolProducer<'p, 'a, S> {
    pool: &'p BlockPool<'a, S>,
}

// Safety: the producer is the only reader of the free ring, and the only
// writer of the ready ring. The semaphore is shared, so it must be Sync.
unsafe impl<S: Sync> Send for PoolProducer<'_, '_, S> {}

impl<'p, S: Semaphore> PoolProducer<'p, '_, S> {
    /// Allocate a free block; see [`BlockPool::alloc()`]
    pub fn alloc(&mut self) -> Option<Block<'p>> {
        // Safety: see the Send implementation.
        unsafe { self.pool.take_free() }
    }

    /// Send a filled block; see [`BlockPool::send()`]
    pub fn send(&mut self, block: Block<'p>) -> Result<(), Error> {
        // Safety: see the Send implementation.
        unsafe { self.pool.put_ready(block) }
    }

    /// The size of each block, in bytes
    pub fn block_size(&self) -> usize {
        self.pool.block_size
    }
}

/// The consuming half of a [`BlockPool`]
///
/// Receives and frees blocks. Create this with [`BlockPool::split()`].
pub struct PoolConsumer<'p, 'a, S> {
    pool: &'p BlockPool<'a, S>,
}

// Safety: the consumer is the only reader of the ready ring, and the only
// writer of the free ring. The semaphore is shared, so it must be Sync.
unsafe impl<S: Sync> Send for PoolConsumer<'_, '_, S> {}

impl<'p, S: Semaphore> PoolConsumer<'p, '_, S> {
    /// Wait for a block; see [`BlockPool::recv()`]
    pub fn recv(&mut self, timeout: Timeout) -> Result<Block<'p>, Error> {
        // Safety: see the Send implementation.
        unsafe { self.pool.take_ready(timeout) }
    }

    /// Return a block to the pool; see [`BlockPool::free()`]
    pub fn free(&mut self, block: Block<'p>) -> Result<(), Error> {
        // Safety: see the Send implementation.
        unsafe { self.pool.put_free(block) }
    }

    /// The number of blocks waiting for `recv()`
    pub fn ready_count(&self) -> usize {
        self.pool.ready_count()
    }
}
