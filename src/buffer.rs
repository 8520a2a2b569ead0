//! C5: fixed-capacity ring buffer with one writer and many independently
//! paced readers.
//!
//! Generalizes the teacher's `server::buffer::BufferState` (one
//! `VecDeque<Bytes>` shared by a single manual `Stream` impl — single-reader
//! by construction, since each stream-proxy request spawned its own FFmpeg
//! child) into a genuine multi-reader segment log: a shared
//! `VecDeque<Bytes>` plus a monotonically increasing `base_seq`/`next_seq`
//! pair, with each reader holding its own cursor and [`Waker`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_util::Stream;

struct Segment {
    seq: u64,
    bytes: Bytes,
}

struct RingState {
    segments: VecDeque<Segment>,
    next_seq: u64,
    base_seq: u64,
    buffered_bytes: usize,
    capacity_bytes: usize,
    closed: bool,
    readers: Vec<ReaderSlot>,
}

struct ReaderSlot {
    id: u64,
    waker: Option<Waker>,
}

/// Shared writer handle. One per channel; the ChannelStream's FFmpeg reader
/// task owns this.
pub struct RingBuffer {
    state: Mutex<RingState>,
    next_reader_id: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RingState {
                segments: VecDeque::new(),
                next_seq: 0,
                base_seq: 0,
                buffered_bytes: 0,
                capacity_bytes,
                closed: false,
                readers: Vec::new(),
            }),
            next_reader_id: AtomicU64::new(0),
        })
    }

    /// Append a chunk from the producer. Never blocks; evicts from the
    /// front once `capacity_bytes` is exceeded, advancing `base_seq` past
    /// any reader still parked on the evicted range (closed as
    /// `SlowReader` the next time it polls).
    pub fn push(self: &Arc<Self>, bytes: Bytes) {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.buffered_bytes += bytes.len();
        state.segments.push_back(Segment { seq, bytes });

        while state.buffered_bytes > state.capacity_bytes {
            if let Some(evicted) = state.segments.pop_front() {
                state.buffered_bytes = state.buffered_bytes.saturating_sub(evicted.bytes.len());
                state.base_seq = evicted.seq + 1;
            } else {
                break;
            }
        }

        for reader in state.readers.iter_mut() {
            if let Some(waker) = reader.waker.take() {
                waker.wake();
            }
        }
    }

    /// Mark the buffer closed: no more bytes will be pushed. Readers drain
    /// what remains, then observe EOF.
    pub fn close(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        for reader in state.readers.iter_mut() {
            if let Some(waker) = reader.waker.take() {
                waker.wake();
            }
        }
    }

    /// Subscribe a new reader, starting from the current write position (it
    /// does not see bytes written before it subscribed).
    pub fn subscribe(self: &Arc<Self>) -> RingReader {
        let mut state = self.state.lock().unwrap();
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let start_seq = state.next_seq;
        state.readers.push(ReaderSlot { id, waker: None });
        RingReader {
            ring: self.clone(),
            id,
            read_seq: start_seq,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Why a subscriber's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The ring fell behind this reader beyond its capacity window.
    SlowReader,
    /// The writer closed the buffer and all remaining bytes were drained.
    Eof,
}

pub struct RingReader {
    ring: Arc<RingBuffer>,
    id: u64,
    read_seq: u64,
    dropped: Arc<AtomicBool>,
}

impl RingReader {
    pub fn is_slow_reader_dropped(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for RingReader {
    type Item = Result<Bytes, CloseReason>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut state = this.ring.state.lock().unwrap();

        if this.read_seq < state.base_seq {
            this.dropped.store(true, Ordering::Relaxed);
            state.readers.retain(|r| r.id != this.id);
            return Poll::Ready(Some(Err(CloseReason::SlowReader)));
        }

        let offset = (this.read_seq - state.base_seq) as usize;
        if let Some(segment) = state.segments.get(offset) {
            this.read_seq += 1;
            return Poll::Ready(Some(Ok(segment.bytes.clone())));
        }

        if state.closed {
            state.readers.retain(|r| r.id != this.id);
            return Poll::Ready(None);
        }

        if let Some(reader) = state.readers.iter_mut().find(|r| r.id == this.id) {
            reader.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        let mut state = self.ring.state.lock().unwrap();
        state.readers.retain(|r| r.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn a_reader_sees_only_bytes_pushed_after_it_subscribed() {
        let ring = RingBuffer::new(1024 * 1024);
        ring.push(Bytes::from_static(b"before"));
        let mut reader = ring.subscribe();
        ring.push(Bytes::from_static(b"after"));
        ring.close();

        let chunk = reader.next().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"after"));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn two_readers_receive_identical_byte_order() {
        let ring = RingBuffer::new(1024 * 1024);
        let mut r1 = ring.subscribe();
        let mut r2 = ring.subscribe();
        ring.push(Bytes::from_static(b"a"));
        ring.push(Bytes::from_static(b"b"));
        ring.close();

        let mut out1 = Vec::new();
        while let Some(Ok(chunk)) = r1.next().await {
            out1.push(chunk);
        }
        let mut out2 = Vec::new();
        while let Some(Ok(chunk)) = r2.next().await {
            out2.push(chunk);
        }
        assert_eq!(out1, out2);
        assert_eq!(out1, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn a_lagging_reader_is_dropped_once_evicted() {
        let ring = RingBuffer::new(4);
        let mut slow = ring.subscribe();
        ring.push(Bytes::from_static(b"1234"));
        ring.push(Bytes::from_static(b"5678")); // evicts the first segment
        ring.push(Bytes::from_static(b"9abc")); // evicts the second

        let result = slow.next().await.unwrap();
        assert_eq!(result, Err(CloseReason::SlowReader));
        assert!(slow.is_slow_reader_dropped());
    }

    #[tokio::test]
    async fn writer_never_blocks_on_a_reader_that_never_polls() {
        let ring = RingBuffer::new(1024);
        let _reader = ring.subscribe();
        for _ in 0..100 {
            ring.push(Bytes::from_static(b"x"));
        }
    }
}
