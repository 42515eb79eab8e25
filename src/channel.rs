// Copyright 2020 Joyent, Inc.

//! Queues between the tasks of a service. Unbounded unless a bound is
//! configured, in which case senders wait for room.

use tokio::sync::mpsc;

use crate::error::Error;

pub(crate) enum Sender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

pub(crate) enum Receiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

pub(crate) fn channel<T>(bound: Option<usize>) -> (Sender<T>, Receiver<T>) {
    match bound {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity);
            (Sender::Bounded(tx), Receiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Sender::Unbounded(tx), Receiver::Unbounded(rx))
        }
    }
}

impl<T> Sender<T> {
    pub(crate) async fn send(&self, item: T) -> Result<(), Error> {
        match self {
            Sender::Bounded(tx) => tx.send(item).await,
            Sender::Unbounded(tx) => tx.send(item),
        }
        .map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Sender::Bounded(tx) => tx.is_closed(),
            Sender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        match self {
            Sender::Bounded(tx) => Sender::Bounded(tx.clone()),
            Sender::Unbounded(tx) => Sender::Unbounded(tx.clone()),
        }
    }
}

impl<T> Receiver<T> {
    pub(crate) async fn recv(&mut self) -> Option<T> {
        match self {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn unbounded_senders_never_wait() {
        let (tx, mut rx) = channel(None);
        for i in 0..1000 {
            tx.send(i).await.unwrap();
        }
        assert_eq!(rx.recv().await, Some(0));
    }

    #[tokio::test]
    async fn bounded_senders_wait_for_room() {
        let (tx, mut rx) = channel(Some(1));
        tx.send(1).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), tx.send(2)).await;
        assert!(blocked.is_err());
        assert_eq!(rx.recv().await, Some(1));
        tx.send(3).await.unwrap();
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn sends_fail_once_the_receiver_is_gone() {
        let (tx, rx) = channel::<u8>(Some(4));
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.send(1).await, Err(Error::ConnectionClosed)));
    }
}
