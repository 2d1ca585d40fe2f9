//! Bounded cross-context channel with drop-on-full semantics.
//!
//! The channel is a fixed-capacity FIFO shared by one producer worker and
//! one consumer worker running on different execution contexts. It is
//! internally synchronized, so neither side takes an external lock.
//!
//! # Backpressure
//!
//! `send` never blocks. When the channel is full the message is handed back
//! inside [`ChannelError::Full`] and counted as a drop; the caller is
//! expected to log it. There is no retry and no blocking fallback.
//!
//! # Receiving
//!
//! `receive` blocks for at most the given timeout. An empty poll returns
//! `None`, which is an expected outcome: it lets an idle consumer keep
//! heartbeating its watchdog.

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::CachePadded;
use rtcore_common::config::DEFAULT_CHANNEL_CAPACITY;
use rtcore_common::error::{RtError, RtResult};
use rtcore_common::time::Timestamp;
use serde::Serialize;
use static_assertions::const_assert;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const_assert!(DEFAULT_CHANNEL_CAPACITY > 0);

/// Timestamped message carried from producer to consumer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Message<P> {
    /// Time the producer built the message.
    pub sent_at: Timestamp,
    /// Per-producer sequence number, strictly increasing.
    pub seq: u64,
    /// Application payload.
    pub payload: P,
}

/// Reasons a send can fail. The rejected value is returned to the caller.
///
/// Backpressure is the only failure: every handle keeps both queue ends
/// alive, so the channel cannot disconnect.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError<T> {
    /// Channel at capacity; the value was dropped.
    #[error("channel full, message dropped")]
    Full(T),
}

impl<T> ChannelError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            ChannelError::Full(value) => value,
        }
    }
}

/// Shared state behind every channel handle.
///
/// Holds both ends of the queue for as long as any handle exists.
struct Shared<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    /// Values accepted by `send`.
    accepted: CachePadded<AtomicU64>,
    /// Values rejected because the channel was full.
    dropped: CachePadded<AtomicU64>,
}

/// Bounded multi-context FIFO.
///
/// Handles are cheap to clone; all clones refer to the same queue.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create a channel holding at most `capacity` values.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Init`] for a zero capacity.
    pub fn bounded(capacity: usize) -> RtResult<Self> {
        if capacity == 0 {
            return Err(RtError::Init("channel capacity must be at least 1".into()));
        }
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                tx,
                rx,
                capacity,
                accepted: CachePadded::new(AtomicU64::new(0)),
                dropped: CachePadded::new(AtomicU64::new(0)),
            }),
        })
    }

    /// Enqueue without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Full`] with the value when at capacity.
    pub fn send(&self, value: T) -> Result<(), ChannelError<T>> {
        match self.shared.tx.try_send(value) {
            Ok(()) => {
                self.shared.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ChannelError::Full(e.into_inner()))
            }
        }
    }

    /// Wait up to `timeout` for the oldest value.
    pub fn receive(&self, timeout: Duration) -> Option<T> {
        self.shared.rx.recv_timeout(timeout).ok()
    }

    /// Take the oldest value if one is ready.
    pub fn try_receive(&self) -> Option<T> {
        self.shared.rx.try_recv().ok()
    }

    /// Values currently queued.
    pub fn len(&self) -> usize {
        self.shared.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.shared.rx.is_empty()
    }

    /// Whether the next send would be dropped.
    pub fn is_full(&self) -> bool {
        self.shared.tx.is_full()
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Total values accepted since creation.
    pub fn accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Total values dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Sending side of a message channel, owned by the producer worker.
///
/// Assigns sequence numbers. A dropped message still consumes its number,
/// so gaps seen by the consumer correspond exactly to drops.
#[derive(Debug)]
pub struct Producer<P> {
    channel: Channel<Message<P>>,
    next_seq: u64,
    dropped: u64,
}

impl<P> Producer<P> {
    /// Wrap a channel handle.
    pub fn new(channel: Channel<Message<P>>) -> Self {
        Self {
            channel,
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Build a message stamped `sent_at` and try to enqueue it.
    ///
    /// Returns the sequence number on success.
    ///
    /// # Errors
    ///
    /// Returns the rejected message when the channel is full.
    pub fn publish(&mut self, sent_at: Timestamp, payload: P) -> Result<u64, ChannelError<Message<P>>> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let message = Message {
            sent_at,
            seq,
            payload,
        };
        self.channel.send(message).map(|()| seq).inspect_err(|_| {
            self.dropped += 1;
        })
    }

    /// Sequence number the next message will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Messages this producer has had dropped.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Underlying channel.
    pub fn channel(&self) -> &Channel<Message<P>> {
        &self.channel
    }
}

/// Receiving side of a message channel, owned by the consumer worker.
#[derive(Debug)]
pub struct Consumer<P> {
    channel: Channel<Message<P>>,
    received: u64,
}

impl<P> Consumer<P> {
    /// Wrap a channel handle.
    pub fn new(channel: Channel<Message<P>>) -> Self {
        Self {
            channel,
            received: 0,
        }
    }

    /// Wait up to `timeout` for the next message.
    pub fn receive(&mut self, timeout: Duration) -> Option<Message<P>> {
        let message = self.channel.receive(timeout);
        if message.is_some() {
            self.received += 1;
        }
        message
    }

    /// Take the next message if one is already queued.
    pub fn try_receive(&mut self) -> Option<Message<P>> {
        let message = self.channel.try_receive();
        if message.is_some() {
            self.received += 1;
        }
        message
    }

    /// Messages taken so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Messages waiting in the channel.
    pub fn backlog(&self) -> usize {
        self.channel.len()
    }

    /// Underlying channel.
    pub fn channel(&self) -> &Channel<Message<P>> {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn ts(us: u64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = Channel::<u32>::bounded(0);
        assert!(matches!(result, Err(RtError::Init(_))));
    }

    #[test]
    fn test_overflow_drops_exactly_one() {
        let channel = Channel::bounded(DEFAULT_CHANNEL_CAPACITY).unwrap();
        let mut producer = Producer::new(channel.clone());

        let mut drops = 0;
        for i in 0..=DEFAULT_CHANNEL_CAPACITY as u64 {
            if let Err(e) = producer.publish(ts(i), i) {
                assert_eq!(e.into_inner().seq, i);
                drops += 1;
            }
        }

        assert_eq!(drops, 1);
        assert_eq!(producer.dropped(), 1);
        assert_eq!(channel.dropped(), 1);
        assert_eq!(channel.len(), DEFAULT_CHANNEL_CAPACITY);
        assert!(channel.is_full());

        let mut consumer = Consumer::new(channel);
        let seqs: Vec<u64> = std::iter::from_fn(|| consumer.try_receive())
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, (0..DEFAULT_CHANNEL_CAPACITY as u64).collect::<Vec<_>>());
        assert_eq!(consumer.received(), DEFAULT_CHANNEL_CAPACITY as u64);
    }

    #[test]
    fn test_lone_handle_only_ever_fills() {
        let channel = Channel::bounded(1).unwrap();
        let mut producer = Producer::new(channel);

        // No consumer handle was ever created; sends still only hit backpressure
        assert_eq!(producer.publish(ts(0), 1u8).unwrap(), 0);
        let ChannelError::Full(rejected) = producer.publish(ts(1), 2u8).unwrap_err();
        assert_eq!(rejected.payload, 2);
        assert_eq!(producer.channel().try_receive().unwrap().payload, 1);
        assert!(producer.channel().receive(Duration::from_millis(1)).is_none());
        assert_eq!(producer.publish(ts(2), 3u8).unwrap(), 2);
    }

    #[test]
    fn test_sequence_numbers_survive_drops() {
        let channel = Channel::bounded(1).unwrap();
        let mut producer = Producer::new(channel.clone());
        let mut consumer = Consumer::new(channel);

        assert_eq!(producer.publish(ts(0), 'a').unwrap(), 0);
        assert!(producer.publish(ts(1), 'b').is_err());
        assert_eq!(consumer.try_receive().unwrap().payload, 'a');
        assert_eq!(producer.publish(ts(2), 'c').unwrap(), 2);
        assert_eq!(producer.next_seq(), 3);
    }

    #[test]
    fn test_receive_timeout_is_empty_poll() {
        let channel = Channel::<Message<u8>>::bounded(4).unwrap();
        let mut consumer = Consumer::new(channel);

        let start = Instant::now();
        assert!(consumer.receive(Duration::from_millis(10)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(consumer.received(), 0);
    }

    #[test]
    fn test_receive_returns_queued_message_immediately() {
        let channel = Channel::bounded(4).unwrap();
        let mut producer = Producer::new(channel.clone());
        let mut consumer = Consumer::new(channel);

        producer.publish(ts(42), 7u16).unwrap();
        let message = consumer.receive(Duration::from_secs(5)).unwrap();
        assert_eq!(message.sent_at, ts(42));
        assert_eq!(message.payload, 7);
        assert_eq!(consumer.backlog(), 0);
    }

    #[test]
    fn test_cross_thread_fifo() {
        let channel = Channel::bounded(8).unwrap();
        let mut producer = Producer::new(channel.clone());
        let mut consumer = Consumer::new(channel.clone());

        let handle = std::thread::spawn(move || {
            let mut accepted = Vec::new();
            for i in 0..1_000u64 {
                if let Ok(seq) = producer.publish(ts(i), i) {
                    accepted.push(seq);
                }
                if i % 16 == 0 {
                    std::thread::yield_now();
                }
            }
            accepted
        });

        let mut received = Vec::new();
        let accepted = loop {
            if let Some(message) = consumer.receive(Duration::from_millis(1)) {
                received.push(message.seq);
            } else if handle.is_finished() {
                break handle.join().unwrap();
            }
        };
        received.extend(std::iter::from_fn(|| consumer.try_receive()).map(|m| m.seq));

        assert_eq!(received, accepted);
        assert_eq!(channel.accepted() + channel.dropped(), 1_000);
    }
}
