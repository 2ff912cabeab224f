//! Booking core: availability slots, the meeting-request state machine, and
//! the read-side projections over both.

mod error;
mod queries;
mod requests;
mod slots;

pub use error::{EngineError, ErrorKind};
pub use slots::OpenSlots;

use std::future::Future;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::directory::Directory;
use crate::store::Store;

/// Cheap to clone; every clone shares the same store, directory and clock.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            directory,
            clock,
        }
    }

    pub fn with_system_clock(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
        Self::new(store, directory, Arc::new(SystemClock))
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run a mutation on its own task so that dropping the caller's future
    /// cannot stop it between a claim and its follow-up write or rollback.
    async fn detached<F, Fut, T>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce(Engine) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.clone()))
            .await
            .map_err(|e| EngineError::Aborted(e.to_string()))?
    }
}
