//! Single-shot completions and standing event feeds handed back to callers

use futures::Stream;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::{mpsc, oneshot};

use crate::core::{
    error::{CentralError, CentralResult, TransportResult},
    types::CharacteristicId,
};

/// Sending half of a pending operation
pub(crate) type Responder<T> = oneshot::Sender<CentralResult<T>>;

/// Resolve every waiter of a pending operation with the same result
pub(crate) fn resolve_all<T: Clone>(waiters: Vec<Responder<T>>, result: CentralResult<T>) {
    for waiter in waiters {
        // Caller may have dropped its completion; nothing to deliver then
        let _ = waiter.send(result.clone());
    }
}

/// Result of a request that completes later, after the transport reports back.
///
/// Resolves to [`CentralError::LinkLost`] if the pending operation is released
/// without an answer.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<CentralResult<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Responder<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for Completion<T> {
    type Output = CentralResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CentralError::LinkLost)))
    }
}

/// Outcome of every connection attempt made for one `connect` call.
///
/// The first item answers the initial attempt; each auto-reconnect attempt
/// yields one more. The stream ends once no further attempt will be made:
/// after a failed attempt, a drop without auto-reconnect, or a newer
/// `connect` replacing the peripheral.
#[derive(Debug)]
pub struct ConnectOutcomes {
    rx: mpsc::UnboundedReceiver<bool>,
}

impl ConnectOutcomes {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<bool>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next attempt to resolve
    pub async fn next_outcome(&mut self) -> Option<bool> {
        self.rx.recv().await
    }
}

impl Stream for ConnectOutcomes {
    type Item = bool;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<bool>> {
        self.rx.poll_recv(cx)
    }
}

/// Value changes pushed for a subscribed characteristic
#[derive(Debug)]
pub struct Notifications {
    characteristic: CharacteristicId,
    rx: mpsc::UnboundedReceiver<TransportResult<Vec<u8>>>,
}

impl Notifications {
    pub(crate) fn channel(
        characteristic: CharacteristicId,
    ) -> (mpsc::UnboundedSender<TransportResult<Vec<u8>>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { characteristic, rx })
    }

    pub fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }
}

impl Stream for Notifications {
    type Item = TransportResult<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
