//! Optional policy filters for Dicehall.
//!
//! Moderation and social checks run as a [`FilterRegistry`] chain. They are
//! optional by construction: a broken or slow filter resolves to its
//! configured [`OnError`] mode and never fails the request outright.
//!
//! Shipped filters (all fail open by default):
//! - `sender-restriction`: muted/banned senders, observer direct messages
//! - `block-relationship`: direct messages across a block
//! - `chat-conduct`: empty/oversized/deny-listed messages

mod error;
mod filters;
mod policy;
mod registry;

pub use error::FilterError;
pub use filters::{
    AddonConfig, BLOCK_RELATIONSHIP, BlockRelationshipFilter, CHAT_CONDUCT, ChatConductFilter,
    MAX_BODY_CHARS, SENDER_RESTRICTION, SenderRestrictionFilter,
};
pub use policy::{FilterPolicy, OnError};
pub use registry::{Decision, Diagnostic, Filter, FilterContext, FilterDescriptor, FilterRegistry, Verdict};
