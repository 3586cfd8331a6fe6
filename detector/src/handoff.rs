//! Rendezvous channel between the capture and detection tasks.
//!
//! `send` completes only once the receiver has taken the item, so the sender
//! is never more than one item ahead. Closing through a [`Closer`] wakes both
//! ends; items still in the slot are dropped.

use tokio::sync::{mpsc, oneshot, watch};

struct Parcel<T> {
    item: T,
    taken: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handoff closed")]
pub struct Closed;

pub struct Sender<T> {
    slot: mpsc::Sender<Parcel<T>>,
    closed: watch::Receiver<bool>,
}

pub struct Receiver<T> {
    slot: mpsc::Receiver<Parcel<T>>,
    closed: watch::Receiver<bool>,
}

/// Close signal shared by the owner and both ends.
#[derive(Clone)]
pub struct Closer {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

pub fn channel<T>() -> (Sender<T>, Receiver<T>, Closer) {
    let (slot_tx, slot_rx) = mpsc::channel(1);
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        Sender {
            slot: slot_tx,
            closed: closed_rx.clone(),
        },
        Receiver {
            slot: slot_rx,
            closed: closed_rx,
        },
        Closer {
            tx: std::sync::Arc::new(closed_tx),
        },
    )
}

impl Closer {
    /// Close the handoff. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once the close flag is set or every [`Closer`] is gone.
async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl<T> Sender<T> {
    /// Hand `item` to the receiver and wait until it has been taken.
    pub async fn send(&mut self, item: T) -> Result<(), Closed> {
        if *self.closed.borrow() {
            return Err(Closed);
        }
        let (taken_tx, taken_rx) = oneshot::channel();
        let parcel = Parcel {
            item,
            taken: taken_tx,
        };

        tokio::select! {
            biased;
            _ = closed_signal(&mut self.closed) => return Err(Closed),
            sent = self.slot.send(parcel) => sent.map_err(|_| Closed)?,
        }

        tokio::select! {
            biased;
            _ = closed_signal(&mut self.closed) => Err(Closed),
            taken = taken_rx => taken.map_err(|_| Closed),
        }
    }
}

impl<T> Receiver<T> {
    /// Wait for the next item. Returns `None` once the handoff is closed or
    /// the sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        let parcel = tokio::select! {
            biased;
            _ = closed_signal(&mut self.closed) => {
                self.slot.close();
                return None;
            }
            parcel = self.slot.recv() => parcel?,
        };
        // The sender may have given up already; the item is ours regardless.
        let _ = parcel.taken.send(());
        Some(parcel.item)
    }
}
