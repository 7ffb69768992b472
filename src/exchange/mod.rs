//! Durable, ordered, pull-based message exchange.

mod mailbox;
mod message;

pub use mailbox::MessageExchange;
pub use message::{Message, MessageKind, Recipient};
