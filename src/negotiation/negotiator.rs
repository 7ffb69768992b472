//! The negotiation state machine.
//!
//! Transitions are monotonic forward (Negotiating may loop on itself);
//! Verified never regresses. A transition attempted from an invalid state
//! is rejected with `InvalidContractState` and appends nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::contract::{
    Contract, ContractKind, ContractStatus, NegotiationAction, NegotiationEntry, Verdict,
};
use crate::error::{ForemanError, Result};
use crate::store::AtomicWriter;

pub struct Negotiator {
    contracts: RwLock<HashMap<String, Contract>>,
    dir: PathBuf,
    writer: AtomicWriter,
}

impl Negotiator {
    pub fn new(dir: impl AsRef<Path>, writer: AtomicWriter) -> Self {
        Self {
            contracts: RwLock::new(HashMap::new()),
            dir: dir.as_ref().to_path_buf(),
            writer,
        }
    }

    /// Restores contracts from the store directory.
    pub async fn load(dir: impl AsRef<Path>, writer: AtomicWriter) -> Result<Self> {
        let negotiator = Self::new(dir, writer);

        if negotiator.dir.exists() {
            let mut entries = tokio::fs::read_dir(&negotiator.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "yaml") {
                    match tokio::fs::read_to_string(&path).await {
                        Ok(content) => match serde_yaml_bw::from_str::<Contract>(&content) {
                            Ok(contract) => {
                                negotiator
                                    .contracts
                                    .write()
                                    .insert(contract.id.clone(), contract);
                            }
                            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable contract"),
                        },
                        Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable contract"),
                    }
                }
            }
            let count = negotiator.contracts.read().len();
            if count > 0 {
                info!(contracts = count, "Contracts restored");
            }
        }

        Ok(negotiator)
    }

    async fn persist(&self, contract_id: &str) -> Result<()> {
        let contract = self
            .get(contract_id)
            .ok_or_else(|| ForemanError::ContractNotFound(contract_id.to_string()))?;
        let content = serde_yaml_bw::to_string(&contract)?;
        let path = self.dir.join(format!("{}.yaml", contract_id));
        self.writer.write(&path, &content).await
    }

    pub async fn propose(
        &self,
        name: &str,
        kind: ContractKind,
        proposer: &str,
        payload: serde_json::Value,
    ) -> Result<String> {
        let contract = Contract::new(name, kind, proposer, payload);
        let id = contract.id.clone();

        self.contracts.write().insert(id.clone(), contract);
        info!(contract_id = %id, name, proposer, "Contract proposed");

        self.persist(&id).await?;
        Ok(id)
    }

    pub async fn counter_propose(
        &self,
        contract_id: &str,
        actor: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        {
            let mut contracts = self.contracts.write();
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| ForemanError::ContractNotFound(contract_id.to_string()))?;

            Self::require_status(
                contract,
                "counter_propose",
                &[ContractStatus::Proposed, ContractStatus::Negotiating],
            )?;

            contract.status = ContractStatus::Negotiating;
            contract.log.push(
                NegotiationEntry::new(actor, NegotiationAction::CounterPropose)
                    .with_payload(payload),
            );
            debug!(contract_id, actor, "Counter-proposal recorded");
        }

        self.persist(contract_id).await
    }

    /// Records an acceptance. The contract reaches Agreed only when every
    /// party that has proposed or countered stands behind the latest
    /// payload; otherwise the acceptance is non-terminal.
    pub async fn accept(&self, contract_id: &str, actor: &str) -> Result<ContractStatus> {
        let status = {
            let mut contracts = self.contracts.write();
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| ForemanError::ContractNotFound(contract_id.to_string()))?;

            Self::require_status(
                contract,
                "accept",
                &[ContractStatus::Proposed, ContractStatus::Negotiating],
            )?;

            contract
                .log
                .push(NegotiationEntry::new(actor, NegotiationAction::Accept));

            contract.status = if contract.all_parties_accepted() {
                info!(contract_id, "Contract agreed");
                ContractStatus::Agreed
            } else {
                debug!(contract_id, actor, "Acceptance recorded, parties outstanding");
                ContractStatus::Negotiating
            };
            contract.status
        };

        self.persist(contract_id).await?;
        Ok(status)
    }

    /// Mediator override: moves straight to Agreed with a synthesized
    /// payload, bypassing further accept rounds. Used to break deadlocks.
    pub async fn mediate(
        &self,
        contract_id: &str,
        mediator: &str,
        payload: serde_json::Value,
        consenting_parties: Vec<String>,
    ) -> Result<()> {
        {
            let mut contracts = self.contracts.write();
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| ForemanError::ContractNotFound(contract_id.to_string()))?;

            Self::require_status(
                contract,
                "mediate",
                &[ContractStatus::Proposed, ContractStatus::Negotiating],
            )?;

            let mut entry =
                NegotiationEntry::new(mediator, NegotiationAction::Mediate).with_payload(payload);
            entry.consenting_parties = consenting_parties;
            contract.log.push(entry);
            contract.status = ContractStatus::Agreed;
            info!(contract_id, mediator, "Contract mediated to agreement");
        }

        self.persist(contract_id).await
    }

    pub async fn mark_implemented(
        &self,
        contract_id: &str,
        actor: &str,
        location: &str,
        quality: f64,
    ) -> Result<()> {
        {
            let mut contracts = self.contracts.write();
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| ForemanError::ContractNotFound(contract_id.to_string()))?;

            Self::require_status(contract, "mark_implemented", &[ContractStatus::Agreed])?;

            let quality = quality.clamp(0.0, 1.0);
            let mut entry = NegotiationEntry::new(actor, NegotiationAction::Implement);
            entry.location = Some(location.to_string());
            contract.log.push(entry);
            contract.status = ContractStatus::Implemented;
            contract.implementation_quality = Some(quality);
            info!(contract_id, actor, quality, "Contract implemented");
        }

        self.persist(contract_id).await
    }

    /// Verification is only meaningful against an implementation. On a
    /// pass the contract is Verified; partial or failing findings leave it
    /// Implemented with the findings on the log — the mismatch stays
    /// visible instead of erasing the attempt.
    pub async fn verify(
        &self,
        contract_id: &str,
        verifier: &str,
        verdict: Verdict,
        findings: serde_json::Value,
    ) -> Result<ContractStatus> {
        let status = {
            let mut contracts = self.contracts.write();
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| ForemanError::ContractNotFound(contract_id.to_string()))?;

            Self::require_status(contract, "verify", &[ContractStatus::Implemented])?;

            let mut entry =
                NegotiationEntry::new(verifier, NegotiationAction::Verify).with_payload(findings);
            entry.verdict = Some(verdict);
            contract.log.push(entry);

            match verdict {
                Verdict::Pass => {
                    contract.status = ContractStatus::Verified;
                    info!(contract_id, verifier, "Contract verified");
                }
                Verdict::Partial | Verdict::Fail => {
                    warn!(contract_id, verifier, verdict = ?verdict, "Verification findings recorded, contract stays implemented");
                }
            }
            contract.status
        };

        self.persist(contract_id).await?;
        Ok(status)
    }

    pub fn get(&self, contract_id: &str) -> Option<Contract> {
        self.contracts.read().get(contract_id).cloned()
    }

    pub fn list(&self) -> Vec<Contract> {
        let mut contracts: Vec<_> = self.contracts.read().values().cloned().collect();
        contracts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        contracts
    }

    /// Negotiating contracts with no log entry inside the stall window.
    pub fn stalled(&self, window: Duration, now: DateTime<Utc>) -> Vec<Contract> {
        self.contracts
            .read()
            .values()
            .filter(|c| c.status == ContractStatus::Negotiating)
            .filter(|c| now - c.last_activity() > window)
            .cloned()
            .collect()
    }

    fn require_status(
        contract: &Contract,
        action: &str,
        allowed: &[ContractStatus],
    ) -> Result<()> {
        if allowed.contains(&contract.status) {
            Ok(())
        } else {
            Err(ForemanError::InvalidContractState {
                contract_id: contract.id.clone(),
                action: action.to_string(),
                expected: allowed
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("|"),
                actual: contract.status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_negotiator() -> (TempDir, Negotiator) {
        let dir = TempDir::new().unwrap();
        let negotiator = Negotiator::new(dir.path().join("contracts"), AtomicWriter::default());
        (dir, negotiator)
    }

    #[tokio::test]
    async fn test_counter_then_accept_reaches_agreed() {
        let (_dir, negotiator) = temp_negotiator();

        let id = negotiator
            .propose("UserData", ContractKind::DataModel, "w1", json!({"v": 1}))
            .await
            .unwrap();
        negotiator
            .counter_propose(&id, "w2", json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(negotiator.get(&id).unwrap().status, ContractStatus::Negotiating);

        // w2 authored the latest payload; w1 still has to accept it.
        let status = negotiator.accept(&id, "w2").await.unwrap();
        assert_eq!(status, ContractStatus::Negotiating);

        let status = negotiator.accept(&id, "w1").await.unwrap();
        assert_eq!(status, ContractStatus::Agreed);
        assert_eq!(
            negotiator.get(&id).unwrap().current_payload(),
            Some(&json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn test_mediation_overrides_disagreement() {
        let (_dir, negotiator) = temp_negotiator();

        let id = negotiator
            .propose("UserData", ContractKind::DataModel, "w1", json!({"v": 1}))
            .await
            .unwrap();
        negotiator
            .counter_propose(&id, "w2", json!({"v": 2}))
            .await
            .unwrap();

        negotiator
            .mediate(
                &id,
                "coordinator",
                json!({"v": 3}),
                vec!["w1".to_string(), "w2".to_string()],
            )
            .await
            .unwrap();

        let contract = negotiator.get(&id).unwrap();
        assert_eq!(contract.status, ContractStatus::Agreed);
        assert_eq!(contract.current_payload(), Some(&json!({"v": 3})));
        let last = contract.log.last().unwrap();
        assert_eq!(last.consenting_parties, ["w1", "w2"]);
    }

    #[tokio::test]
    async fn test_verify_fail_leaves_implemented() {
        let (_dir, negotiator) = temp_negotiator();

        let id = negotiator
            .propose("UserData", ContractKind::DataModel, "w1", json!({"v": 1}))
            .await
            .unwrap();
        negotiator.accept(&id, "w2").await.unwrap();
        negotiator
            .mark_implemented(&id, "w2", "src/models/user.rs", 0.6)
            .await
            .unwrap();

        let status = negotiator
            .verify(&id, "verifier", Verdict::Fail, json!({"missing": "email field"}))
            .await
            .unwrap();
        assert_eq!(status, ContractStatus::Implemented);

        let contract = negotiator.get(&id).unwrap();
        assert_eq!(contract.status, ContractStatus::Implemented);
        assert_eq!(contract.log.last().unwrap().verdict, Some(Verdict::Fail));

        // A later passing verification still gets it to Verified.
        let status = negotiator
            .verify(&id, "verifier", Verdict::Pass, json!({}))
            .await
            .unwrap();
        assert_eq!(status, ContractStatus::Verified);
    }

    #[tokio::test]
    async fn test_invalid_transition_appends_nothing() {
        let (_dir, negotiator) = temp_negotiator();

        let id = negotiator
            .propose("UserData", ContractKind::DataModel, "w1", json!({"v": 1}))
            .await
            .unwrap();
        let log_len = negotiator.get(&id).unwrap().log.len();

        let err = negotiator
            .verify(&id, "verifier", Verdict::Pass, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidContractState { .. }));
        assert_eq!(negotiator.get(&id).unwrap().log.len(), log_len);
        assert_eq!(negotiator.get(&id).unwrap().status, ContractStatus::Proposed);
    }

    #[tokio::test]
    async fn test_verified_never_regresses() {
        let (_dir, negotiator) = temp_negotiator();

        let id = negotiator
            .propose("API", ContractKind::Api, "w1", json!({}))
            .await
            .unwrap();
        negotiator.accept(&id, "w2").await.unwrap();
        negotiator.mark_implemented(&id, "w1", "src/api.rs", 0.9).await.unwrap();
        negotiator.verify(&id, "v", Verdict::Pass, json!({})).await.unwrap();

        assert!(negotiator.counter_propose(&id, "w2", json!({})).await.is_err());
        assert!(negotiator.accept(&id, "w2").await.is_err());
        assert!(negotiator.verify(&id, "v", Verdict::Fail, json!({})).await.is_err());
        assert_eq!(negotiator.get(&id).unwrap().status, ContractStatus::Verified);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("contracts");

        let id = {
            let negotiator = Negotiator::new(&store_dir, AtomicWriter::default());
            negotiator
                .propose("UserData", ContractKind::DataModel, "w1", json!({"v": 1}))
                .await
                .unwrap()
        };

        let restored = Negotiator::load(&store_dir, AtomicWriter::default())
            .await
            .unwrap();
        let contract = restored.get(&id).unwrap();
        assert_eq!(contract.name, "UserData");
        assert_eq!(contract.status, ContractStatus::Proposed);
    }
}
