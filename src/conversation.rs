//! Conversation context management: token estimation and trimming of the
//! prompt history to a budget.

pub mod context;
pub mod tokens;

pub use context::{BuiltContext, ContextBuilder, trim_to_budget};
pub use tokens::{TiktokenCounter, TokenCounter};
