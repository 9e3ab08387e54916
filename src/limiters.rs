use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;

/// Caps the number of logical calls a pipeline runs at once.
#[derive(Clone, Debug)]
pub(crate) struct CallLimiter {
    semaphore: Arc<Semaphore>,
}

impl CallLimiter {
    pub(crate) fn new(max_in_flight: Option<usize>) -> Option<Self> {
        max_in_flight.map(|limit| Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        })
    }

    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConcurrencyLimitClosed)
    }

    pub(crate) fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
