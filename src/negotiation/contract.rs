//! Contract model: a negotiated interface agreement with an append-only
//! negotiation log.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Interface,
    Api,
    Component,
    DataModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Proposed,
    Negotiating,
    Agreed,
    Implemented,
    Verified,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Negotiating => "negotiating",
            Self::Agreed => "agreed",
            Self::Implemented => "implemented",
            Self::Verified => "verified",
        }
    }
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationAction {
    Propose,
    CounterPropose,
    Accept,
    Mediate,
    Implement,
    Verify,
}

impl NegotiationAction {
    /// Actions that establish a new canonical payload.
    pub fn carries_payload(&self) -> bool {
        matches!(self, Self::Propose | Self::CounterPropose | Self::Mediate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Partial,
    Fail,
}

/// One entry in a contract's append-only negotiation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationEntry {
    pub actor: String,
    pub action: NegotiationAction,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consenting_parties: Vec<String>,
}

impl NegotiationEntry {
    pub fn new(actor: impl Into<String>, action: NegotiationAction) -> Self {
        Self {
            actor: actor.into(),
            action,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
            verdict: None,
            location: None,
            consenting_parties: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub name: String,
    pub kind: ContractKind,
    pub proposer: String,
    pub status: ContractStatus,
    pub log: Vec<NegotiationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_quality: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Contract {
    pub fn new(
        name: impl Into<String>,
        kind: ContractKind,
        proposer: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let proposer = proposer.into();
        let entry =
            NegotiationEntry::new(proposer.clone(), NegotiationAction::Propose).with_payload(payload);
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            proposer,
            status: ContractStatus::Proposed,
            log: vec![entry],
            implementation_quality: None,
            created_at: Utc::now(),
        }
    }

    /// The canonical payload: the payload of the most recent
    /// propose / counter-propose / mediate entry.
    pub fn current_payload(&self) -> Option<&serde_json::Value> {
        self.log
            .iter()
            .rev()
            .find(|e| e.action.carries_payload())
            .map(|e| &e.payload)
    }

    /// Every party that has put forward a payload (proposed or countered).
    pub fn negotiating_parties(&self) -> BTreeSet<&str> {
        self.log
            .iter()
            .filter(|e| {
                matches!(
                    e.action,
                    NegotiationAction::Propose | NegotiationAction::CounterPropose
                )
            })
            .map(|e| e.actor.as_str())
            .collect()
    }

    /// Whether every negotiating party stands behind the latest payload.
    /// The author of that payload counts as accepting it; everyone else
    /// needs an explicit accept entry after it.
    pub fn all_parties_accepted(&self) -> bool {
        let Some(payload_idx) = self
            .log
            .iter()
            .rposition(|e| e.action.carries_payload())
        else {
            return false;
        };

        let author = self.log[payload_idx].actor.as_str();
        let accepted_after: BTreeSet<&str> = self.log[payload_idx + 1..]
            .iter()
            .filter(|e| e.action == NegotiationAction::Accept)
            .map(|e| e.actor.as_str())
            .collect();

        self.negotiating_parties()
            .iter()
            .all(|party| *party == author || accepted_after.contains(party))
    }

    /// Timestamp of the newest log entry; stall detection reads this.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.log
            .last()
            .map(|e| e.timestamp)
            .unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_contract_starts_proposed() {
        let contract = Contract::new("UserData", ContractKind::DataModel, "w1", json!({"v": 1}));

        assert_eq!(contract.status, ContractStatus::Proposed);
        assert_eq!(contract.log.len(), 1);
        assert_eq!(contract.current_payload(), Some(&json!({"v": 1})));
    }

    #[test]
    fn test_canonical_payload_follows_latest() {
        let mut contract =
            Contract::new("UserData", ContractKind::DataModel, "w1", json!({"v": 1}));
        contract.log.push(
            NegotiationEntry::new("w2", NegotiationAction::CounterPropose)
                .with_payload(json!({"v": 2})),
        );
        contract
            .log
            .push(NegotiationEntry::new("w1", NegotiationAction::Accept));

        assert_eq!(contract.current_payload(), Some(&json!({"v": 2})));
    }

    #[test]
    fn test_acceptance_counts_payload_author() {
        let mut contract =
            Contract::new("UserData", ContractKind::DataModel, "w1", json!({"v": 1}));
        // Single proposer: their own proposal counts, nothing else needed
        // from them, but no other party has weighed in either.
        assert!(contract.all_parties_accepted());

        contract.log.push(
            NegotiationEntry::new("w2", NegotiationAction::CounterPropose)
                .with_payload(json!({"v": 2})),
        );
        assert!(!contract.all_parties_accepted());

        contract
            .log
            .push(NegotiationEntry::new("w1", NegotiationAction::Accept));
        assert!(contract.all_parties_accepted());
    }
}
