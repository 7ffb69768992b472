//! Multi-party contract negotiation over shared interfaces.

mod contract;
mod negotiator;

pub use contract::{
    Contract, ContractKind, ContractStatus, NegotiationAction, NegotiationEntry, Verdict,
};
pub use negotiator::Negotiator;
