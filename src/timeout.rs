//! Bounded collaborator calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{Collaborator, CollaboratorError, ConfigError, StoreError};

/// Caps how long any single collaborator call may stall an admission check.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeout {
    duration: Duration,
}

impl CallTimeout {
    /// Create a timeout; zero and `Duration::MAX` are rejected.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration == Duration::ZERO || duration == Duration::MAX {
            return Err(ConfigError::InvalidDuration { field: "store_timeout", value: duration });
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Await `call`, mapping both its error and an elapsed deadline to
    /// [`CollaboratorError`] tagged with `collaborator`.
    pub async fn call<T, Fut>(
        &self,
        collaborator: Collaborator,
        call: Fut,
    ) -> Result<T, CollaboratorError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.duration, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CollaboratorError::Failed { collaborator, source }),
            Err(_) => Err(CollaboratorError::Timeout { collaborator, after: self.duration }),
        }
    }
}
