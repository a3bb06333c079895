//! Bounded buffers carried by every session context.

use std::collections::VecDeque;

use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A bounded byte FIFO. Contents are zeroized when cleared or dropped.
#[derive(Debug)]
pub struct ByteBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl ByteBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left before the buffer is full.
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Append all of `bytes`, or nothing if they do not fit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.free() {
            return Err(Error::Internal("buffer overflow"));
        }
        self.data.extend(bytes);
        Ok(())
    }

    /// The buffered bytes as one contiguous slice, oldest first.
    pub fn peek(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }

    /// Drop the oldest `n` bytes (or everything, if fewer are buffered).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        for b in self.data.range_mut(..n) {
            *b = 0;
        }
        self.data.drain(..n);
    }

    /// Move up to `out.len()` of the oldest bytes into `out`.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        for (dst, src) in out.iter_mut().zip(self.data.iter()) {
            *dst = *src;
        }
        self.consume(n);
        n
    }

    /// Remove and return up to `max` of the oldest bytes.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        let out: Vec<u8> = self.data.iter().take(n).copied().collect();
        self.consume(n);
        out
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        let (a, b) = self.data.as_mut_slices();
        a.zeroize();
        b.zeroize();
        self.data.clear();
    }
}

impl Drop for ByteBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A bounded queue of whole datagrams, sent one per writable event.
#[derive(Debug)]
pub struct DatagramQueue {
    queue: VecDeque<Vec<u8>>,
    max_datagrams: usize,
}

impl DatagramQueue {
    /// Create an empty queue holding at most `max_datagrams` datagrams.
    pub fn new(max_datagrams: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_datagrams,
        }
    }

    /// Datagrams waiting to be sent.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is waiting to be sent.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a datagram for sending.
    pub fn push(&mut self, datagram: Vec<u8>) -> Result<()> {
        if self.queue.len() >= self.max_datagrams {
            return Err(Error::Internal("outbound datagram queue full"));
        }
        self.queue.push_back(datagram);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    /// Put back a datagram that could not be sent yet.
    pub(crate) fn requeue(&mut self, datagram: Vec<u8>) {
        self.queue.push_front(datagram);
    }

    /// Discard every queued datagram.
    pub fn clear(&mut self) {
        for mut d in self.queue.drain(..) {
            d.zeroize();
        }
    }
}

impl Drop for DatagramQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_all_or_nothing() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.write(b"abc").expect("fits");
        assert!(matches!(buf.write(b"de"), Err(Error::Internal(_))));
        assert_eq!(buf.len(), 3);
        buf.write(b"d").expect("fits exactly");
        assert_eq!(buf.free(), 0);
    }

    #[test]
    fn partial_consume_keeps_the_tail() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.write(b"hello").expect("write");
        buf.consume(2);
        assert_eq!(buf.peek(), b"llo");
        buf.write(b"!!").expect("write");
        let mut out = [0u8; 3];
        assert_eq!(buf.read_into(&mut out), 3);
        assert_eq!(&out, b"llo");
        assert_eq!(buf.take(10), b"!!".to_vec());
        assert!(buf.is_empty());
    }

    #[test]
    fn requeued_datagram_goes_first() {
        let mut q = DatagramQueue::new(2);
        q.push(vec![1]).expect("push");
        q.push(vec![2]).expect("push");
        assert!(q.push(vec![3]).is_err());
        let first = q.pop().expect("first");
        q.requeue(first);
        assert_eq!(q.pop(), Some(vec![1]));
        assert_eq!(q.pop(), Some(vec![2]));
        assert!(q.is_empty());
    }
}
