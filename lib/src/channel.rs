// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Create a bounded queue for pushing updates to a single client connection.
///
/// Sending never waits for the receiver: a full queue rejects the message.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let channel = Arc::new(Channel {
        queue: xutex::AsyncMutex::new(VecDeque::with_capacity(capacity)),
        notify: tokio::sync::Notify::const_new(),
        closed: AtomicBool::new(false),
        capacity: capacity.max(1),
    });

    (Sender(channel.clone()), Receiver(channel))
}

struct Channel<T> {
    pub(self) queue: xutex::AsyncMutex<VecDeque<T>>,
    pub(self) notify: tokio::sync::Notify,
    pub(self) closed: AtomicBool,
    pub(self) capacity: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    /// The receiver has too many undelivered messages.
    Full(T),
    /// The receiver was dropped.
    Closed(T),
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("receiver is lagging behind"),
            Self::Closed(_) => f.write_str("receiver is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for SendError<T> {}

pub struct Sender<T>(Arc<Channel<T>>);

impl<T> Sender<T> {
    /// # Errors
    ///
    /// Returns the message if the queue is full or the receiver is gone.
    pub async fn send(&self, message: T) -> Result<(), SendError<T>> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed(message));
        }

        {
            let mut queue = self.0.queue.lock().await;
            if queue.len() >= self.0.capacity {
                return Err(SendError::Full(message));
            }
            queue.push_back(message);
        }

        self.0.notify.notify_one();
        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.notify.notify_one();
    }
}

pub struct Receiver<T>(Arc<Channel<T>>);

impl<T> Receiver<T> {
    /// Returns a value until the sender is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.0.queue.lock().await.pop_front() {
                return Some(value);
            }

            if self.0.closed.load(Ordering::SeqCst) {
                return None;
            }

            self.0.notify.notified().await;
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let (tx, mut rx) = channel(2);

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(tx.send(3).await, Err(SendError::Full(3)));

        assert_eq!(rx.recv().await, Some(1));
        tx.send(4).await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(4));

        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_sender_drains_then_ends() {
        let (tx, mut rx) = channel(4);

        tx.send("a").await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_receiver_closes_the_sender() {
        let (tx, rx) = channel(4);
        drop(rx);

        assert_eq!(tx.send(7).await, Err(SendError::Closed(7)));
    }
}
