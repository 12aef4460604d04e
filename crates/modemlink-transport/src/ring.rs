//! Circular byte queues living in the shared region.
//!
//! `head` is written only by the producer and `tail` only by the consumer.
//! One slot is always left empty so `head == tail` means empty.

use std::sync::atomic::{fence, Ordering};

use crate::error::{Result, TransportError};
use crate::layout::QueueDesc;
use crate::region::SharedMemory;

/// Bytes queued between `tail` and `head`.
pub fn usage(qsize: u32, head: u32, tail: u32) -> u32 {
    if head >= tail {
        head - tail
    } else {
        qsize - tail + head
    }
}

/// Bytes a producer may still write.
pub fn space(qsize: u32, head: u32, tail: u32) -> u32 {
    qsize - 1 - usage(qsize, head, tail)
}

/// Advance a pointer by `len` bytes.
pub fn new_pointer(qsize: u32, p: u32, len: u32) -> u32 {
    ((u64::from(p) + u64::from(len)) % u64::from(qsize)) as u32
}

/// Lengths of the "up to the end" and "from the start" sub-copies.
fn split(qsize: u32, at: u32, len: usize) -> (usize, usize) {
    let to_end = (qsize - at) as usize;
    if len <= to_end {
        (len, 0)
    } else {
        (to_end, len - to_end)
    }
}

/// One direction of a queue pair, viewed through the shared region.
pub struct RingBuffer<'a> {
    mem: &'a dyn SharedMemory,
    desc: QueueDesc,
    name: &'static str,
}

impl<'a> RingBuffer<'a> {
    pub fn new(mem: &'a dyn SharedMemory, desc: QueueDesc, name: &'static str) -> Self {
        Self { mem, desc, name }
    }

    pub fn capacity(&self) -> u32 {
        self.desc.size
    }

    /// Current `(head, tail)`, rejecting values outside `[0, size)`.
    pub fn pointers(&self) -> Result<(u32, u32)> {
        let head = self.mem.read_u32(self.desc.head)?;
        let tail = self.mem.read_u32(self.desc.tail)?;
        fence(Ordering::Acquire);
        if head >= self.desc.size || tail >= self.desc.size {
            return Err(TransportError::CorruptQueue {
                queue: self.name,
                head,
                tail,
                size: self.desc.size,
            });
        }
        Ok((head, tail))
    }

    pub fn usage(&self) -> Result<u32> {
        let (head, tail) = self.pointers()?;
        Ok(usage(self.desc.size, head, tail))
    }

    pub fn space(&self) -> Result<u32> {
        let (head, tail) = self.pointers()?;
        Ok(space(self.desc.size, head, tail))
    }

    /// Copy `src` in at `head`, wrapping as needed. Returns the new head
    /// without publishing it.
    pub fn write(&self, head: u32, src: &[u8]) -> Result<u32> {
        if head >= self.desc.size || src.len() >= self.desc.size as usize {
            return Err(TransportError::OutOfBounds {
                offset: head as usize,
                len: src.len(),
                size: self.desc.size as usize,
            });
        }
        let (first, second) = split(self.desc.size, head, src.len());
        self.mem
            .write_bytes(self.desc.buf + head as usize, &src[..first])?;
        if second > 0 {
            self.mem.write_bytes(self.desc.buf, &src[first..])?;
        }
        Ok(new_pointer(self.desc.size, head, src.len() as u32))
    }

    /// Copy `dst.len()` bytes out from `tail`, wrapping as needed. Returns
    /// the new tail without publishing it.
    pub fn read(&self, tail: u32, dst: &mut [u8]) -> Result<u32> {
        if tail >= self.desc.size || dst.len() >= self.desc.size as usize {
            return Err(TransportError::OutOfBounds {
                offset: tail as usize,
                len: dst.len(),
                size: self.desc.size as usize,
            });
        }
        let (first, second) = split(self.desc.size, tail, dst.len());
        self.mem
            .read_bytes(self.desc.buf + tail as usize, &mut dst[..first])?;
        if second > 0 {
            self.mem.read_bytes(self.desc.buf, &mut dst[first..])?;
        }
        Ok(new_pointer(self.desc.size, tail, dst.len() as u32))
    }

    /// Producer side: append `src` and publish the new head.
    ///
    /// Leaves the ring untouched and returns `Backpressure` when `src` does
    /// not fit.
    pub fn push(&self, src: &[u8]) -> Result<u32> {
        let (head, tail) = self.pointers()?;
        let free = space(self.desc.size, head, tail);
        if src.len() > free as usize {
            return Err(TransportError::Backpressure {
                queue: self.name,
                needed: src.len(),
                free: free as usize,
            });
        }
        let head = self.write(head, src)?;
        fence(Ordering::Release);
        self.mem.write_u32(self.desc.head, head)?;
        Ok(head)
    }

    /// Consumer side: take everything queued and publish the new tail.
    ///
    /// Appends to `dst` and returns the byte count; zero when empty.
    pub fn pop_all(&self, dst: &mut Vec<u8>) -> Result<usize> {
        let (head, tail) = self.pointers()?;
        let len = usage(self.desc.size, head, tail) as usize;
        if len == 0 {
            return Ok(0);
        }
        let start = dst.len();
        dst.resize(start + len, 0);
        let tail = self.read(tail, &mut dst[start..])?;
        fence(Ordering::Release);
        self.mem.write_u32(self.desc.tail, tail)?;
        Ok(len)
    }

    /// Zero both pointers.
    pub fn clear(&self) -> Result<()> {
        self.mem.write_u32(self.desc.head, 0)?;
        self.mem.write_u32(self.desc.tail, 0)
    }
}

impl std::fmt::Debug for RingBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn desc(size: u32) -> QueueDesc {
        QueueDesc {
            head: 0,
            tail: 4,
            buf: 8,
            size,
        }
    }

    #[test]
    fn space_plus_usage_is_capacity_minus_one() {
        for qsize in 2..=17u32 {
            for head in 0..qsize {
                for tail in 0..qsize {
                    assert_eq!(
                        space(qsize, head, tail) + usage(qsize, head, tail),
                        qsize - 1,
                        "qsize {qsize} head {head} tail {tail}"
                    );
                }
            }
        }
    }

    #[test]
    fn pointer_arithmetic_wraps() {
        assert_eq!(new_pointer(64, 60, 10), 6);
        assert_eq!(new_pointer(64, 0, 63), 63);
        assert_eq!(new_pointer(u32::MAX, u32::MAX - 1, 5), 4);
        assert_eq!(usage(64, 6, 60), 10);
    }

    #[test]
    fn wrapped_write_reads_back() {
        let qsize = 16u32;
        let region = HeapRegion::new(8 + qsize as usize);
        let ring = RingBuffer::new(&region, desc(qsize), "test");
        let payload: Vec<u8> = (1..=10).collect();

        for k in 1..payload.len() as u32 {
            let start = qsize - k;
            let end = ring.write(start, &payload).unwrap();
            assert_eq!(end, new_pointer(qsize, start, 10));

            let mut out = vec![0u8; payload.len()];
            let tail = ring.read(start, &mut out).unwrap();
            assert_eq!(tail, end);
            assert_eq!(out, payload, "split at k={k}");
        }
    }

    #[test]
    fn push_refuses_overflow_without_moving_head() {
        let region = HeapRegion::new(8 + 64);
        let ring = RingBuffer::new(&region, desc(64), "tx");
        ring.push(&[0xAB; 40]).unwrap();

        let err = ring.push(&[0xCD; 30]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Backpressure {
                needed: 30,
                free: 23,
                ..
            }
        ));
        assert_eq!(ring.pointers().unwrap(), (40, 0));

        let mut drained = Vec::new();
        assert_eq!(ring.pop_all(&mut drained).unwrap(), 40);
        ring.push(&[0xCD; 30]).unwrap();
        assert_eq!(ring.pointers().unwrap(), (6, 40));
    }

    #[test]
    fn pop_all_on_empty_is_noop() {
        let region = HeapRegion::new(8 + 32);
        let ring = RingBuffer::new(&region, desc(32), "rx");
        let mut out = Vec::new();
        assert_eq!(ring.pop_all(&mut out).unwrap(), 0);
        assert!(out.is_empty());
        assert_eq!(ring.pointers().unwrap(), (0, 0));
    }

    #[test]
    fn out_of_range_pointer_reports_corruption() {
        let region = HeapRegion::new(8 + 32);
        region.write_u32(0, 32).unwrap();
        let ring = RingBuffer::new(&region, desc(32), "rx");
        let err = ring.usage().unwrap_err();
        assert!(matches!(
            err,
            TransportError::CorruptQueue {
                head: 32,
                tail: 0,
                size: 32,
                ..
            }
        ));
    }

    #[test]
    fn oversized_copy_rejected() {
        let region = HeapRegion::new(8 + 8);
        let ring = RingBuffer::new(&region, desc(8), "tx");
        assert!(ring.write(0, &[0; 8]).is_err());
        assert!(ring.read(9, &mut [0; 1]).is_err());
    }
}
