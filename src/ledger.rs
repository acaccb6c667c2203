//! Durable request history.
//!
//! Every admitted request is appended as a [`RequestEvent`]; window checks count
//! rows by identity, endpoint and age.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;

/// One admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestEvent {
    pub identity: String,
    pub endpoint: String,
    /// Epoch milliseconds; non-decreasing within one process.
    pub timestamp: u64,
    /// Informational only.
    pub user_agent: Option<String>,
}

/// Which identities a count covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Every identity.
    All,
    /// One identity key.
    Identity(&'a str),
}

impl Scope<'_> {
    pub fn matches(&self, identity: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Identity(expected) => *expected == identity,
        }
    }
}

/// Durable, queryable log of admitted requests.
#[async_trait]
pub trait RequestLedger: Send + Sync {
    async fn append(&self, event: RequestEvent) -> Result<(), StoreError>;

    /// Rows matching `scope` and `endpoint` (all endpoints if `None`) with
    /// `timestamp >= since`.
    async fn count_since(
        &self,
        scope: Scope<'_>,
        endpoint: Option<&str>,
        since: u64,
    ) -> Result<u64, StoreError>;

    /// Delete rows with `timestamp < cutoff`; returns how many were removed.
    async fn purge_older_than(&self, cutoff: u64) -> Result<u64, StoreError>;
}

/// Reference ledger keeping rows in memory in append order.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<VecDeque<RequestEvent>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row in append order.
    pub fn rows(&self) -> Vec<RequestEvent> {
        self.rows.lock().map(|rows| rows.iter().cloned().collect()).unwrap_or_default()
    }
}

#[async_trait]
impl RequestLedger for InMemoryLedger {
    async fn append(&self, event: RequestEvent) -> Result<(), StoreError> {
        self.rows.lock().map_err(|_| "ledger lock poisoned")?.push_back(event);
        Ok(())
    }

    async fn count_since(
        &self,
        scope: Scope<'_>,
        endpoint: Option<&str>,
        since: u64,
    ) -> Result<u64, StoreError> {
        let rows = self.rows.lock().map_err(|_| "ledger lock poisoned")?;
        let count = rows
            .iter()
            .filter(|row| row.timestamp >= since)
            .filter(|row| scope.matches(&row.identity))
            .filter(|row| endpoint.map_or(true, |e| e == row.endpoint))
            .count();
        Ok(count as u64)
    }

    async fn purge_older_than(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| "ledger lock poisoned")?;
        let before = rows.len();
        rows.retain(|row| row.timestamp >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
