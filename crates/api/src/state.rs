//! Application state

use std::sync::Arc;

use leadgen_billing::{BillingService, InvariantChecker};
use leadgen_shared::DedupCache;

use crate::config::ApiTokens;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Best-effort replay cache for delivery bodies
    pub dedup: DedupCache,
    pub tokens: ApiTokens,
    /// Only present when backed by Postgres
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>, dedup: DedupCache, tokens: ApiTokens) -> Self {
        Self {
            billing,
            dedup,
            tokens,
            invariants: None,
        }
    }

    pub fn with_invariants(mut self, checker: InvariantChecker) -> Self {
        self.invariants = Some(Arc::new(checker));
        self
    }
}
