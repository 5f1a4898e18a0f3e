//! The shipped filters and the default chain.

use dicehall_protocol::ChatChannel;
use futures_util::future::BoxFuture;

use crate::{Filter, FilterContext, FilterDescriptor, FilterError, FilterPolicy, FilterRegistry, Verdict};

pub const CHAT_CONDUCT: &str = "chat-conduct";
pub const SENDER_RESTRICTION: &str = "sender-restriction";
pub const BLOCK_RELATIONSHIP: &str = "block-relationship";

/// Longest accepted chat body, in characters.
pub const MAX_BODY_CHARS: usize = 500;

/// Policies for the shipped filters.
#[derive(Debug, Clone)]
pub struct AddonConfig {
    pub chat_conduct: FilterPolicy,
    pub sender_restriction: FilterPolicy,
    pub block_relationship: FilterPolicy,
    /// Lowercase words the conduct filter rejects.
    pub deny_list: Vec<String>,
}

impl Default for AddonConfig {
    fn default() -> Self {
        Self {
            chat_conduct: FilterPolicy::default(),
            sender_restriction: FilterPolicy::default(),
            block_relationship: FilterPolicy::default(),
            deny_list: ["cheater", "idiot", "loser", "scam"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl FilterRegistry {
    /// Registry with the shipped chain: sender restriction, block
    /// relationship, then chat conduct.
    pub fn with_defaults(config: &AddonConfig) -> Self {
        let mut registry = Self::new();
        let defaults = [
            FilterDescriptor::new(SENDER_RESTRICTION, config.sender_restriction.clone(), SenderRestrictionFilter),
            FilterDescriptor::new(BLOCK_RELATIONSHIP, config.block_relationship.clone(), BlockRelationshipFilter),
            FilterDescriptor::new(
                CHAT_CONDUCT,
                config.chat_conduct.clone(),
                ChatConductFilter::new(config.deny_list.clone()),
            ),
        ];
        for descriptor in defaults {
            // Ids above are distinct constants.
            let _ = registry.register(descriptor);
        }
        registry
    }
}

// ---------------------------------------------------------------------------
// chat-conduct
// ---------------------------------------------------------------------------

/// Rejects empty, oversized and deny-listed messages. Deny-list hits carry
/// a conduct strike.
#[derive(Debug, Clone)]
pub struct ChatConductFilter {
    deny_list: Vec<String>,
}

impl ChatConductFilter {
    pub fn new(deny_list: Vec<String>) -> Self {
        Self {
            deny_list: deny_list.into_iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    fn check(&self, body: &str) -> Verdict {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Verdict::reject("empty_message");
        }
        if trimmed.chars().count() > MAX_BODY_CHARS {
            return Verdict::reject("message_too_long");
        }
        let lowered = trimmed.to_lowercase();
        let hit = lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| self.deny_list.iter().any(|denied| denied == word));
        if hit {
            return Verdict::reject("conduct_violation").with_strike();
        }
        Verdict::allow()
    }
}

impl Filter for ChatConductFilter {
    fn evaluate<'a>(&'a self, ctx: &'a FilterContext) -> BoxFuture<'a, Result<Verdict, FilterError>> {
        Box::pin(async move { Ok(self.check(&ctx.body)) })
    }
}

// ---------------------------------------------------------------------------
// sender-restriction
// ---------------------------------------------------------------------------

/// Rejects banned or muted senders, and direct messages from observers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderRestrictionFilter;

impl Filter for SenderRestrictionFilter {
    fn evaluate<'a>(&'a self, ctx: &'a FilterContext) -> BoxFuture<'a, Result<Verdict, FilterError>> {
        Box::pin(async move {
            let verdict = if ctx.sender_banned {
                Verdict::reject("sender_banned")
            } else if ctx.sender_muted {
                Verdict::reject("sender_muted")
            } else if ctx.sender_is_observer && matches!(ctx.channel, ChatChannel::Direct(_)) {
                Verdict::reject("observer_direct_message")
            } else {
                Verdict::allow()
            };
            Ok(verdict)
        })
    }
}

// ---------------------------------------------------------------------------
// block-relationship
// ---------------------------------------------------------------------------

/// Rejects direct messages across a block in either direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockRelationshipFilter;

impl Filter for BlockRelationshipFilter {
    fn evaluate<'a>(&'a self, ctx: &'a FilterContext) -> BoxFuture<'a, Result<Verdict, FilterError>> {
        Box::pin(async move {
            let ChatChannel::Direct(to) = ctx.channel else {
                return Ok(Verdict::allow());
            };
            let verdict = if ctx.recipient_blocks.contains(&ctx.sender) {
                Verdict::reject("blocked_by_recipient")
            } else if ctx.sender_blocks.contains(&to) {
                Verdict::reject("recipient_blocked")
            } else {
                Verdict::allow()
            };
            Ok(verdict)
        })
    }
}
