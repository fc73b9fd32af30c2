use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{DecisionContext, ReasoningService, VerifyRequest};
use crate::device::Screenshot;
use crate::errors::ReasoningError;

/// Running totals of calls made through a [`MeteredReasoning`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Every attempt, retries included
    pub calls: u32,
    pub rate_limited: u32,
}

impl CallCounts {
    /// Calls made between `earlier` and `self`.
    pub fn since(&self, earlier: CallCounts) -> CallCounts {
        CallCounts {
            calls: self.calls.saturating_sub(earlier.calls),
            rate_limited: self.rate_limited.saturating_sub(earlier.rate_limited),
        }
    }
}

/// Counts calls to the wrapped service and how many came back rate limited.
pub struct MeteredReasoning {
    inner: Arc<dyn ReasoningService>,
    calls: AtomicU32,
    rate_limited: AtomicU32,
}

impl MeteredReasoning {
    pub fn new(inner: Arc<dyn ReasoningService>) -> Self {
        Self {
            inner,
            calls: AtomicU32::new(0),
            rate_limited: AtomicU32::new(0),
        }
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            calls: self.calls.load(Ordering::SeqCst),
            rate_limited: self.rate_limited.load(Ordering::SeqCst),
        }
    }

    fn tally<T>(&self, outcome: Result<T, ReasoningError>) -> Result<T, ReasoningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Err(ReasoningError::RateLimited { .. }) = &outcome {
            self.rate_limited.fetch_add(1, Ordering::SeqCst);
        }
        outcome
    }
}

#[async_trait]
impl ReasoningService for MeteredReasoning {
    async fn describe(&self, screenshot: &Screenshot, query: &str) -> Result<String, ReasoningError> {
        self.tally(self.inner.describe(screenshot, query).await)
    }

    async fn decide(&self, context: &DecisionContext) -> Result<String, ReasoningError> {
        self.tally(self.inner.decide(context).await)
    }

    async fn verify(&self, request: &VerifyRequest) -> Result<String, ReasoningError> {
        self.tally(self.inner.verify(request).await)
    }
}
