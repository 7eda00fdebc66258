#![forbid(unsafe_code)]

//! Awaitable "next flush" handle.
//!
//! A request can own a [`Release`] that runs when it is dropped, so a
//! listener installed only to resolve it goes away with it.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::release::Release;

/// Frozen list of keys delivered by one flush, in the order they entered the
/// frame.
pub type Keys = Rc<[String]>;

/// Resolves with the keys of the next flush, or `None` when nothing was
/// pending at request time or the controller dropped the request.
#[must_use = "an update request does nothing unless awaited"]
#[derive(Debug)]
pub struct UpdateRequest {
    state: State,
    cancel: Option<Release>,
}

#[derive(Debug)]
enum State {
    Settled(Option<Keys>),
    Waiting(oneshot::Receiver<Keys>),
}

impl UpdateRequest {
    /// Request that resolves when the returned sender fires.
    pub fn channel() -> (oneshot::Sender<Keys>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: State::Waiting(rx),
                cancel: None,
            },
        )
    }

    /// Request that is already resolved.
    pub fn settled(keys: Option<Keys>) -> Self {
        Self {
            state: State::Settled(keys),
            cancel: None,
        }
    }

    /// Release `handle` when this request is dropped, resolved or not.
    pub fn release_on_drop(mut self, handle: Release) -> Self {
        self.cancel = Some(handle);
        self
    }
}

impl Drop for UpdateRequest {
    fn drop(&mut self) {
        if let Some(handle) = self.cancel.take() {
            handle.release();
        }
    }
}

impl Future for UpdateRequest {
    type Output = Option<Keys>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Settled(keys) => Poll::Ready(keys.take()),
            State::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(keys)) => Poll::Ready(Some(keys)),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn settled_resolves_immediately() {
        assert_eq!(block_on(UpdateRequest::settled(None)), None);
    }

    #[test]
    fn channel_resolves_with_keys() {
        let (tx, request) = UpdateRequest::channel();
        let keys: Keys = Rc::from(vec!["a".to_owned()]);
        let _ = tx.send(keys);
        assert_eq!(
            block_on(request).as_deref(),
            Some(&["a".to_owned()][..])
        );
    }

    #[test]
    fn drop_runs_attached_release() {
        let (_tx, request) = UpdateRequest::channel();
        let handle = Release::new(|| {});
        let request = request.release_on_drop(handle.clone());
        assert!(!handle.is_released());
        drop(request);
        assert!(handle.is_released());
    }

    #[test]
    fn resolved_request_still_releases_on_drop() {
        let (tx, request) = UpdateRequest::channel();
        let handle = Release::new(|| {});
        let mut request = Box::pin(request.release_on_drop(handle.clone()));
        let _ = tx.send(Rc::from(vec!["a".to_owned()]));
        assert!(block_on(request.as_mut()).is_some());
        drop(request);
        assert!(handle.is_released());
    }

    #[test]
    fn dropped_sender_resolves_none() {
        let (tx, request) = UpdateRequest::channel();
        drop(tx);
        assert_eq!(block_on(request), None);
    }
}
