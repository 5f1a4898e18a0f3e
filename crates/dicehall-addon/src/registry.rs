//! The filter registry: an ordered chain of optional policy checks.
//!
//! Each registered [`FilterDescriptor`] pairs a filter with its
//! [`FilterPolicy`]. Evaluation is bounded by the policy's timeout; a filter
//! that times out or errors never fails the request, it resolves to the
//! policy's [`OnError`] mode instead:
//!
//! ```text
//!   filter ok ─────────────→ its verdict
//!   timeout / error ─┬─ noop  → allowed, diagnostic recorded
//!                    └─ block → rejected "policy_failure:<id>"
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use dicehall_protocol::{ChatChannel, ParticipantId, SessionId};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::{FilterError, FilterPolicy, OnError};

/// Everything a filter may look at for one gated action.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub session_id: SessionId,
    pub sender: ParticipantId,
    pub channel: ChatChannel,
    pub body: String,
    /// The sender is seated as an observer.
    pub sender_is_observer: bool,
    pub sender_muted: bool,
    pub sender_banned: bool,
    /// Participants the sender has blocked.
    pub sender_blocks: BTreeSet<ParticipantId>,
    /// Participants the direct-message recipient has blocked.
    pub recipient_blocks: BTreeSet<ParticipantId>,
}

/// A filter's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
    /// The rejection should count as a conduct strike.
    pub strike: bool,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            strike: false,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            strike: false,
        }
    }

    pub fn with_strike(mut self) -> Self {
        self.strike = true;
        self
    }
}

/// An optional policy check.
pub trait Filter: Send + Sync + 'static {
    fn evaluate<'a>(&'a self, ctx: &'a FilterContext) -> BoxFuture<'a, Result<Verdict, FilterError>>;
}

/// A registered filter.
#[derive(Clone)]
pub struct FilterDescriptor {
    pub id: String,
    pub policy: FilterPolicy,
    pub filter: Arc<dyn Filter>,
}

impl FilterDescriptor {
    pub fn new(id: impl Into<String>, policy: FilterPolicy, filter: impl Filter) -> Self {
        Self {
            id: id.into(),
            policy: policy.validated(),
            filter: Arc::new(filter),
        }
    }
}

impl std::fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// A filter failure and how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub filter_id: String,
    pub error: FilterError,
    pub resolution: OnError,
}

/// The combined outcome of one or more filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Filter that rejected, if any.
    pub rejected_by: Option<String>,
    pub strike: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            rejected_by: None,
            strike: false,
            diagnostics: Vec::new(),
        }
    }
}

/// Ordered filter chain.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: Vec<FilterDescriptor>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter to the chain.
    ///
    /// # Errors
    /// [`FilterError::DuplicateFilter`] if the id is taken.
    pub fn register(&mut self, descriptor: FilterDescriptor) -> Result<(), FilterError> {
        if self.filters.iter().any(|f| f.id == descriptor.id) {
            return Err(FilterError::DuplicateFilter(descriptor.id));
        }
        debug!(filter = %descriptor.id, policy = ?descriptor.policy, "filter registered");
        self.filters.push(descriptor);
        Ok(())
    }

    /// Replaces a filter's policy.
    pub fn set_policy(&mut self, id: &str, policy: FilterPolicy) -> Result<(), FilterError> {
        let descriptor = self
            .filters
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| FilterError::UnknownFilter(id.to_string()))?;
        descriptor.policy = policy.validated();
        Ok(())
    }

    pub fn policy(&self, id: &str) -> Option<&FilterPolicy> {
        self.filters.iter().find(|f| f.id == id).map(|f| &f.policy)
    }

    /// Registered ids in chain order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|f| f.id.as_str())
    }

    /// Runs one filter under its policy. Disabled filters allow.
    ///
    /// # Errors
    /// Only [`FilterError::UnknownFilter`]; evaluation failures are resolved
    /// into the decision.
    pub async fn evaluate(&self, id: &str, ctx: &FilterContext) -> Result<Decision, FilterError> {
        let descriptor = self
            .filters
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| FilterError::UnknownFilter(id.to_string()))?;

        let mut decision = Decision::allowed();
        if descriptor.policy.enabled {
            run_one(descriptor, ctx, &mut decision).await;
        }
        Ok(decision)
    }

    /// Runs every enabled filter in order. The first rejection wins.
    pub async fn evaluate_chain(&self, ctx: &FilterContext) -> Decision {
        let mut decision = Decision::allowed();
        for descriptor in self.filters.iter().filter(|f| f.policy.enabled) {
            if !run_one(descriptor, ctx, &mut decision).await {
                break;
            }
        }
        decision
    }
}

/// Runs `descriptor` and folds the result into `decision`.
/// Returns `false` if the chain should stop.
async fn run_one(descriptor: &FilterDescriptor, ctx: &FilterContext, decision: &mut Decision) -> bool {
    let policy = &descriptor.policy;
    let result = match tokio::time::timeout(policy.timeout, descriptor.filter.evaluate(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(FilterError::Timeout {
            filter: descriptor.id.clone(),
            budget: policy.timeout,
        }),
    };

    match result {
        Ok(verdict) if verdict.allowed => true,
        Ok(verdict) => {
            debug!(
                filter = %descriptor.id,
                session = %ctx.session_id,
                sender = %ctx.sender,
                reason = ?verdict.reason,
                "filter rejected"
            );
            decision.allowed = false;
            decision.reason = verdict.reason;
            decision.rejected_by = Some(descriptor.id.clone());
            decision.strike = verdict.strike;
            false
        }
        Err(error) => {
            warn!(
                filter = %descriptor.id,
                session = %ctx.session_id,
                on_error = %policy.on_error,
                error = %error,
                "filter failed"
            );
            decision.diagnostics.push(Diagnostic {
                filter_id: descriptor.id.clone(),
                error,
                resolution: policy.on_error,
            });
            match policy.on_error {
                OnError::Noop => true,
                OnError::Block => {
                    decision.allowed = false;
                    decision.reason = Some(format!("policy_failure:{}", descriptor.id));
                    decision.rejected_by = Some(descriptor.id.clone());
                    false
                }
            }
        }
    }
}
