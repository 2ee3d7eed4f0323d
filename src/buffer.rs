//! Buffer pool with explicit ownership tokens.
//!
//! Every mapped buffer is either queued with the driver or held by exactly
//! one consumer. A consumer reads a buffer through [`RawBuffer`], which
//! borrows the pool, and gives it back by turning it into a [`BufferToken`]
//! and passing that to [`BufferPool::release`]. The token cannot be cloned,
//! so a buffer cannot be returned twice, and the borrow ends before the
//! release, so a buffer cannot be read after it went back to the driver.

use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{BufferQueue, CameraDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Mapped but not yet handed to the driver.
    Mapped,
    Queued,
    Held,
}

/// Proof of holding one buffer. Consumed by [`BufferPool::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a held buffer must be released back to the pool"]
pub struct BufferToken {
    index: usize,
}

impl BufferToken {
    /// Slot index of the held buffer.
    pub const fn index(&self) -> usize {
        self.index
    }
}

/// A filled buffer on loan from the pool.
#[derive(Debug)]
pub struct RawBuffer<'a> {
    token: BufferToken,
    data: &'a [u8],
    sequence: u32,
}

impl RawBuffer<'_> {
    /// Bytes the driver wrote.
    pub const fn data(&self) -> &[u8] {
        self.data
    }

    /// Filled length in bytes.
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the driver wrote nothing.
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Driver frame sequence number.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Stop reading the buffer and keep only the right to release it.
    pub fn into_token(self) -> BufferToken {
        self.token
    }
}

/// Fixed set of driver buffers for one streaming session.
pub struct BufferPool<Q: BufferQueue> {
    queue: Q,
    slots: Vec<Slot>,
}

impl<Q: BufferQueue> BufferPool<Q> {
    /// Wrap a queue whose buffers are already mapped.
    pub fn new(queue: Q) -> Result<Self> {
        let count = queue.buffer_count();
        if count < 2 {
            return Err(CameraError::Allocation(format!(
                "driver granted {count} buffers, need at least 2"
            )));
        }
        Ok(Self {
            queue,
            slots: vec![Slot::Mapped; count],
        })
    }

    /// Number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of buffers currently held by consumers.
    pub fn held(&self) -> usize {
        self.slots.iter().filter(|slot| **slot == Slot::Held).count()
    }

    /// Bound how long [`BufferPool::acquire`] waits.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.queue.set_timeout(timeout);
    }

    /// Queue every buffer with the driver and start streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.slots.iter().any(|slot| *slot != Slot::Mapped) {
            return Err(CameraError::BufferOwnership(
                "pool already started".to_owned(),
            ));
        }
        self.queue.stream_on()?;
        self.slots.fill(Slot::Queued);
        Ok(())
    }

    /// Wait for the next filled buffer and take ownership of it.
    pub fn acquire(&mut self) -> Result<RawBuffer<'_>> {
        let filled = self.queue.dequeue()?;
        let slot = self.slots.get_mut(filled.index).ok_or_else(|| {
            CameraError::BufferOwnership(format!("driver returned unknown buffer {}", filled.index))
        })?;
        if *slot != Slot::Queued {
            return Err(CameraError::BufferOwnership(format!(
                "driver returned buffer {} which was {slot:?}",
                filled.index
            )));
        }
        *slot = Slot::Held;

        Ok(RawBuffer {
            token: BufferToken {
                index: filled.index,
            },
            data: filled.data,
            sequence: filled.sequence,
        })
    }

    /// Return a consumed buffer to the driver's free queue.
    pub fn release(&mut self, token: BufferToken) -> Result<()> {
        let index = token.index;
        match self.slots.get(index) {
            Some(Slot::Held) => {}
            other => {
                return Err(CameraError::BufferOwnership(format!(
                    "released buffer {index} which was {other:?}"
                )))
            }
        }
        self.queue.enqueue(index)?;
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::Queued;
        }
        Ok(())
    }

    /// Stop streaming and unmap every buffer.
    ///
    /// Takes the pool by value, so no [`RawBuffer`] can outlive it.
    pub fn teardown(mut self) -> Result<()> {
        let held = self.held();
        let stopped = self.queue.stream_off();
        drop(self.queue);
        if held > 0 {
            log::warn!("buffer pool torn down with {held} buffers still held");
        }
        stopped
    }
}

/// Map `count` buffers on `device` and wrap them in a pool.
///
/// On failure the partially built queue is dropped, which unmaps whatever
/// the driver had granted.
pub fn allocate<D: CameraDevice>(device: &mut D, count: u32) -> Result<BufferPool<D::Queue<'_>>> {
    let queue = device
        .request_buffers(count)
        .map_err(|err| match err {
            CameraError::Allocation(_) | CameraError::DeviceBusy(_) => err,
            other => CameraError::Allocation(other.to_string()),
        })?;
    BufferPool::new(queue)
}
