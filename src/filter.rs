//! Filter chain driving sideline windows.
//!
//! A chain maps sideline request identifiers to filter steps. `filter`
//! returning `true` means the message is *excluded* (diverted away): the
//! default stream carries one step per active sideline so matching traffic is
//! withheld from it, while each sideline source carries the negation of its
//! own step so it emits only the matching traffic.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::types::{Message, SidelineRequestId};

/// A predicate over a message. Returning `true` excludes the message from the
/// stream the chain guards.
pub trait FilterChainStep: Send + Sync + fmt::Debug {
    fn filter(&self, message: &Message) -> bool;
}

/// Inverts another step's result, enabling "everything except X" windows.
#[derive(Debug, Clone)]
pub struct NegatingFilterChainStep {
    inner: Arc<dyn FilterChainStep>,
}

impl NegatingFilterChainStep {
    pub fn new(inner: Arc<dyn FilterChainStep>) -> Self {
        Self { inner }
    }
}

impl FilterChainStep for NegatingFilterChainStep {
    fn filter(&self, message: &Message) -> bool {
        !self.inner.filter(message)
    }
}

/// An ordered, keyed set of filter steps. Steps can be added and removed
/// while producers are concurrently evaluating the chain.
#[derive(Debug, Default)]
pub struct FilterChain {
    steps: DashMap<SidelineRequestId, Arc<dyn FilterChainStep>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under a request identifier. Re-registering the same
    /// identifier overwrites its step. Returns the chain for composition.
    pub fn add_step(&self, request_id: SidelineRequestId, step: Arc<dyn FilterChainStep>) -> &Self {
        self.steps.insert(request_id, step);
        self
    }

    pub fn remove_step(&self, request_id: &SidelineRequestId) -> Option<Arc<dyn FilterChainStep>> {
        self.steps.remove(request_id).map(|(_, step)| step)
    }

    pub fn has_step(&self, request_id: &SidelineRequestId) -> bool {
        self.steps.contains_key(request_id)
    }

    /// `true` if the message is excluded: any registered step matching
    /// excludes it. A chain with zero steps filters nothing.
    pub fn filter(&self, message: &Message) -> bool {
        self.steps.iter().any(|step| step.value().filter(message))
    }

    /// Identifiers of the registered steps, for diagnostics.
    pub fn step_identifiers(&self) -> Vec<SidelineRequestId> {
        self.steps.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{number_message, NumberFilter};

    #[test]
    fn test_chain_excludes_on_any_matching_step() {
        let chain = FilterChain::new();
        chain
            .add_step(SidelineRequestId::new(), Arc::new(NumberFilter::new(2)))
            .add_step(SidelineRequestId::new(), Arc::new(NumberFilter::new(4)))
            .add_step(SidelineRequestId::new(), Arc::new(NumberFilter::new(5)));

        assert!(chain.filter(&number_message(2)));
        assert!(chain.filter(&number_message(4)));
        assert!(chain.filter(&number_message(5)));

        assert!(!chain.filter(&number_message(1)));
        assert!(!chain.filter(&number_message(3)));
    }

    #[test]
    fn test_negating_chain() {
        let chain = FilterChain::new();
        chain.add_step(
            SidelineRequestId::new(),
            Arc::new(NegatingFilterChainStep::new(Arc::new(NumberFilter::new(2)))),
        );

        assert!(chain.filter(&number_message(1)));
        assert!(!chain.filter(&number_message(2)));
    }

    #[test]
    fn test_empty_chain_filters_nothing() {
        let chain = FilterChain::new();

        assert!(!chain.filter(&number_message(1)));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_remove_step() {
        let chain = FilterChain::new();
        let request_id = SidelineRequestId::new();
        chain.add_step(request_id, Arc::new(NumberFilter::new(7)));

        assert!(chain.filter(&number_message(7)));
        assert!(chain.has_step(&request_id));

        let removed = chain.remove_step(&request_id);
        assert!(removed.is_some());
        assert!(!chain.filter(&number_message(7)));
        assert!(!chain.has_step(&request_id));
    }

    #[test]
    fn test_reregistering_overwrites() {
        let chain = FilterChain::new();
        let request_id = SidelineRequestId::new();

        chain.add_step(request_id, Arc::new(NumberFilter::new(1)));
        chain.add_step(request_id, Arc::new(NumberFilter::new(2)));

        assert_eq!(chain.len(), 1);
        assert!(!chain.filter(&number_message(1)));
        assert!(chain.filter(&number_message(2)));
    }
}
