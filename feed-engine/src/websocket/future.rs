//! Shared completion handle resolved by message hash

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Result, StreamError};

type Outcome<T> = Option<Result<T>>;

/// A pending reply that settles once
///
/// Clones share the same slot: settling any clone settles all of them, which
/// is how several message hashes can alias one request.
#[derive(Debug)]
pub struct MessageFuture<T> {
    slot: Arc<watch::Sender<Outcome<T>>>,
}

impl<T> Clone for MessageFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MessageFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> MessageFuture<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Settle with a value; returns false if already settled
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error; returns false if already settled
    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Whether two handles share a slot
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.slot.subscribe();
        // the sender lives as long as `self`, so this only fails if it is dropped
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| StreamError::ConnectionClosed("future dropped".to_string()))?;
        settled
            .clone()
            .unwrap_or_else(|| Err(StreamError::ConnectionClosed("future dropped".to_string())))
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for MessageFuture<T> {
    type Output = Result<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_all_clones() {
        let future: MessageFuture<u32> = MessageFuture::new();
        let alias = future.clone();
        let waiter = tokio::spawn(alias.clone().into_future());
        assert!(future.resolve(7));
        assert_eq!(waiter.await.ok().and_then(|r| r.ok()), Some(7));
        assert_eq!(alias.wait().await, Ok(7));
        assert!(future.same(&alias));
    }

    #[tokio::test]
    async fn test_settles_once() {
        let future: MessageFuture<u32> = MessageFuture::new();
        assert!(future.reject(StreamError::NotConnected("x".into())));
        assert!(!future.resolve(1));
        assert_eq!(future.await, Err(StreamError::NotConnected("x".into())));
    }

    #[test]
    fn test_resolved_before_wait() {
        let future: MessageFuture<&'static str> = MessageFuture::new();
        future.resolve("done");
        assert!(future.is_settled());
        assert_eq!(tokio_test::block_on(future.wait()), Ok("done"));
    }
}
