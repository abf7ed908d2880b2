//! In-memory fakes for the gateway and queue traits (testing only)
//!
//! Provides `FakeGateway` and `MemoryWorkQueue`, which satisfy the trait
//! contracts without any network access and record every call they get.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::error::{AuditError, Result};
use crate::query::{Query, QueryGateway, QueryResponse};
use crate::requeue::{RequeueMessage, WorkQueue};

type Responder = Box<dyn Fn(&Query) -> Result<QueryResponse> + Send + Sync>;

// ---------------------------------------------------------------------------
// FakeGateway
// ---------------------------------------------------------------------------

/// Query gateway answering from a closure and logging each query.
pub struct FakeGateway {
    responder: Responder,
    log: Mutex<Vec<Query>>,
}

impl FakeGateway {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Query) -> Result<QueryResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            log: Mutex::new(Vec::new()),
        }
    }

    /// A gateway whose every call fails with HTTP 500.
    pub fn unavailable() -> Self {
        Self::new(|_| {
            Err(AuditError::Status {
                endpoint: "fake://query".to_string(),
                status: 500,
                body: "unavailable".to_string(),
            })
        })
    }

    /// Queries received so far, in order.
    pub fn queries(&self) -> Vec<Query> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryGateway for FakeGateway {
    async fn execute(&self, query: &Query) -> Result<QueryResponse> {
        self.log.lock().unwrap().push(query.clone());
        (self.responder)(query)
    }
}

// ---------------------------------------------------------------------------
// MemoryWorkQueue
// ---------------------------------------------------------------------------

/// Work queue recording each `extend` call's batch.
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    calls: Mutex<Vec<Vec<RequeueMessage>>>,
    fail: bool,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that records the call and then reports failure.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Batches received so far, one entry per `extend` call.
    pub fn calls(&self) -> Vec<Vec<RequeueMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Every key received, across all calls.
    pub fn keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|m| m.key.clone())
            .collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn extend(&self, messages: Vec<RequeueMessage>) -> Result<()> {
        self.calls.lock().unwrap().push(messages);
        if self.fail {
            return Err(AuditError::Queue("memory queue set to fail".to_string()));
        }
        Ok(())
    }
}
