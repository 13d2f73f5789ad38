//! Request and response filters.
//!
//! A [`Filter`] may hook the request before the handler runs, the reply after
//! it returns, or both. Filters run in descending priority; equal priorities
//! keep registration order.

use std::sync::Arc;

use crate::context::RequestView;
use crate::exception::FilterError;
use crate::resource::Reply;

/// Hooks around handler invocation. Both hooks default to no-ops.
pub trait Filter: Send + Sync {
    /// Inspect the request before the handler runs. An error aborts it.
    fn on_request(&self, _request: &RequestView<'_>) -> Result<(), FilterError> {
        Ok(())
    }

    /// Inspect or rewrite the reply after the handler returns.
    fn on_response(
        &self,
        _request: &RequestView<'_>,
        _reply: &mut Reply,
    ) -> Result<(), FilterError> {
        Ok(())
    }
}

#[derive(Clone)]
struct Entry {
    priority: i32,
    filter: Arc<dyn Filter>,
}

/// Filters ordered by priority.
#[derive(Default, Clone)]
pub struct FilterChain {
    entries: Vec<Entry>,
}

impl FilterChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter. Higher priorities run first.
    pub fn add(&mut self, priority: i32, filter: Arc<dyn Filter>) {
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, Entry { priority, filter });
    }

    /// Run every request hook, stopping at the first error.
    pub fn run_request(&self, request: &RequestView<'_>) -> Result<(), FilterError> {
        for entry in &self.entries {
            entry.filter.on_request(request)?;
        }
        Ok(())
    }

    /// Run every response hook, stopping at the first error.
    pub fn run_response(
        &self,
        request: &RequestView<'_>,
        reply: &mut Reply,
    ) -> Result<(), FilterError> {
        for entry in &self.entries {
            entry.filter.on_response(request, reply)?;
        }
        Ok(())
    }

    /// Number of filters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
