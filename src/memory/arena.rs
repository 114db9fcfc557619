use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;

use crate::errors::PoolError;
use crate::memory::pool::{ObjectPool, Pool};

/// Exclusive lease over one fixed-size slot of the arena.
///
/// Segments are split off a single allocation, so two live segments can never
/// alias. The slot keeps its length for its whole life.
pub struct Segment {
    offset: usize,
    buf: BytesMut,
}

impl Segment {
    /// Byte offset of this slot inside the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Segment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Total arena size in bytes, or `None` when it cannot be allocated.
pub fn arena_len(segment_count: usize, segment_size: usize) -> Option<usize> {
    segment_count
        .checked_mul(segment_size)
        .filter(|&len| len <= isize::MAX as usize)
}

/// Carve `segment_count` slots of `segment_size` bytes out of one arena.
///
/// The returned factory hands out the next unused slot on each call and fails
/// with [`PoolError::Capacity`] once every slot has been handed out.
pub fn segment_factory(
    segment_count: usize,
    segment_size: usize,
) -> Result<impl FnMut() -> Result<Segment, PoolError> + Send + 'static, PoolError> {
    let len = arena_len(segment_count, segment_size).ok_or(PoolError::Oversized {
        segment_count,
        segment_size,
    })?;
    let mut arena = BytesMut::zeroed(len);
    let mut cursor = 0;
    Ok(move || {
        if cursor >= segment_count {
            return Err(PoolError::Capacity {
                capacity: segment_count,
            });
        }
        let segment = Segment {
            offset: cursor * segment_size,
            buf: arena.split_to(segment_size),
        };
        cursor += 1;
        Ok(segment)
    })
}

/// Fixed-arena buffer pool.
///
/// Every slot is carved at construction; afterwards segments are only
/// recycled through the reuse stack. Asking for more than `capacity()`
/// outstanding segments is a sizing fault and returns
/// [`PoolError::Capacity`].
pub struct BufferPool {
    segments: ObjectPool<Segment>,
    segment_count: usize,
    segment_size: usize,
    leased: usize,
}

impl BufferPool {
    pub fn new(segment_count: usize, segment_size: usize) -> Result<Self, PoolError> {
        let segments = ObjectPool::with_initial_size(
            segment_factory(segment_count, segment_size)?,
            segment_count,
        )?;
        Ok(Self {
            segments,
            segment_count,
            segment_size,
            leased: 0,
        })
    }

    /// Total number of segments in the arena.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segment_count
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Segments sitting in the reuse stack.
    #[inline]
    pub fn available(&self) -> usize {
        self.segments.size()
    }

    /// Segments currently leased out.
    #[inline]
    pub fn leased(&self) -> usize {
        self.leased
    }
}

impl Pool<Segment> for BufferPool {
    fn acquire(&mut self) -> Result<Segment, PoolError> {
        let segment = self.segments.acquire()?;
        self.leased += 1;
        Ok(segment)
    }

    fn release(&mut self, segment: Segment) {
        debug_assert_eq!(segment.len(), self.segment_size, "foreign segment");
        self.leased = self.leased.saturating_sub(1);
        self.segments.release(segment);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.segment_count)
            .field("segment_size", &self.segment_size)
            .field("leased", &self.leased)
            .finish()
    }
}
