//! Forward references to content identities that are only known after
//! persistence.
//!
//! Each in-flight unit carries a [`ContentPromise`]; the matching
//! [`ContentHandle`] is parked in the run's [`FutureBook`] for whoever
//! needs the persisted identity. The promise is fulfilled exactly once,
//! by the content-saver stage, as soon as the row is durable; the final
//! resolution stage claims the handle to account for the record. Dropping
//! an unfulfilled promise (skip, cancellation) resolves the handle to
//! [`MigrationError::Cancelled`] instead of blocking forever.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{MigrationError, Result};

/// The fulfilling half of a content future.
#[derive(Debug)]
pub struct ContentPromise(oneshot::Sender<String>);

impl ContentPromise {
    /// Fulfill the future with the persisted content unit id. Consumes the
    /// promise; a handle that was already dropped is not an error.
    pub fn fulfill(self, content_unit_id: String) {
        let _ = self.0.send(content_unit_id);
    }
}

/// The waiting half of a content future.
#[derive(Debug)]
pub struct ContentHandle(oneshot::Receiver<String>);

impl ContentHandle {
    /// Wait for the persisted identity. Fails with `Cancelled` if the
    /// promise was dropped before fulfillment.
    pub async fn get(self) -> Result<String> {
        self.0.await.map_err(|_| MigrationError::Cancelled)
    }
}

/// Create a linked promise/handle pair.
pub fn content_future() -> (ContentPromise, ContentHandle) {
    let (tx, rx) = oneshot::channel();
    (ContentPromise(tx), ContentHandle(rx))
}

/// Run-scoped registry of outstanding handles, keyed by content type and
/// legacy id. The generation stage registers a handle per legacy record;
/// the resolution stage claims it once the record's units have drained.
/// Handles are single-consumer: `claim` removes them, so a record that
/// fanned out into several units resolves exactly once.
#[derive(Debug, Default)]
pub struct FutureBook {
    inner: Mutex<HashMap<String, ContentHandle>>,
}

impl FutureBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, content_type_id: &str, legacy_id: &str, handle: ContentHandle) {
        let mut inner = self.inner.lock().expect("future book lock poisoned");
        inner.insert(format!("{content_type_id}:{legacy_id}"), handle);
    }

    pub fn claim(&self, content_type_id: &str, legacy_id: &str) -> Option<ContentHandle> {
        let mut inner = self.inner.lock().expect("future book lock poisoned");
        inner.remove(&format!("{content_type_id}:{legacy_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfilled_handle_returns_the_id() {
        let (promise, handle) = content_future();
        promise.fulfill("unit-1".to_string());
        assert_eq!(handle.get().await.unwrap(), "unit-1");
    }

    #[tokio::test]
    async fn dropped_promise_resolves_to_cancelled() {
        let (promise, handle) = content_future();
        drop(promise);
        assert!(matches!(
            handle.get().await,
            Err(MigrationError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn book_claim_is_single_consumer() {
        let book = FutureBook::new();
        let (promise, handle) = content_future();
        book.register("package", "abc", handle);
        promise.fulfill("unit-9".to_string());

        let claimed = book.claim("package", "abc").expect("handle registered");
        assert_eq!(claimed.get().await.unwrap(), "unit-9");
        assert!(book.claim("package", "abc").is_none());
    }
}
