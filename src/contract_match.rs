//! Contract reconciliation.
//!
//! Finds the stored contract a row refers to by, in order, the unique key
//! hash, the normalized policy number within the customer, and the stable
//! hash within the customer. The content hash then separates a no-op
//! re-upload from a real change. A policy number that already belongs to a
//! different customer stops everything before any lookup.

use serde::{Deserialize, Serialize};

use crate::db::{ContractIdentity, CrmDb, DbError};
use crate::hashing::{contract_hashes, ContractHashes};
use crate::reason::HoldReason;
use crate::types::ContractDraft;

/// What reconciling one contract row does (or would do) to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ContractAction {
    Insert,
    #[serde(rename_all = "camelCase")]
    Update { contract_id: i64 },
    #[serde(rename_all = "camelCase")]
    Same { contract_id: i64 },
    #[serde(rename = "ambig")]
    Ambiguous { reason: HoldReason, detail: String },
    Fail { message: String },
}

impl ContractAction {
    pub fn code(&self) -> &'static str {
        match self {
            ContractAction::Insert => "insert",
            ContractAction::Update { .. } => "update",
            ContractAction::Same { .. } => "same",
            ContractAction::Ambiguous { .. } => "ambig",
            ContractAction::Fail { .. } => "fail",
        }
    }

    /// Insert, update and same all leave the contract settled.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ContractAction::Insert | ContractAction::Update { .. } | ContractAction::Same { .. }
        )
    }
}

/// Result of [`ContractReconciler::reconcile`]: the action taken and the
/// contract row it landed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciled {
    pub action: ContractAction,
    pub contract_id: Option<i64>,
}

impl Reconciled {
    fn without_row(action: ContractAction) -> Self {
        Self {
            action,
            contract_id: None,
        }
    }
}

pub struct ContractReconciler<'a> {
    db: &'a CrmDb,
}

impl<'a> ContractReconciler<'a> {
    pub fn new(db: &'a CrmDb) -> Self {
        Self { db }
    }

    /// Classify without writing.
    ///
    /// `customer_id` is `None` for a customer that does not exist yet; only
    /// the cross-customer policy check can say anything about such a row.
    pub fn classify(
        &self,
        customer_id: Option<i64>,
        draft: &ContractDraft,
    ) -> Result<ContractAction, DbError> {
        if let Some(action) = self.check_policy_owner(customer_id, draft)? {
            return Ok(action);
        }
        let customer_id = match customer_id {
            Some(id) => id,
            None => return Ok(ContractAction::Insert),
        };
        let hashes = contract_hashes(customer_id, draft);
        self.find_match(customer_id, draft, &hashes)
    }

    /// Classify and perform the write. Runs inside the caller's transaction.
    pub fn reconcile(&self, customer_id: i64, draft: &ContractDraft) -> Result<Reconciled, DbError> {
        if self.db.get_customer(customer_id)?.is_none() {
            return Ok(Reconciled::without_row(ContractAction::Fail {
                message: format!("customer {} does not exist", customer_id),
            }));
        }
        if let Some(action) = self.check_policy_owner(Some(customer_id), draft)? {
            return Ok(Reconciled::without_row(action));
        }

        let hashes = contract_hashes(customer_id, draft);
        let action = self.find_match(customer_id, draft, &hashes)?;
        match action {
            ContractAction::Insert => self.insert(customer_id, draft, &hashes),
            ContractAction::Update { contract_id } => {
                self.update(contract_id, draft, &hashes)?;
                Ok(Reconciled {
                    action,
                    contract_id: Some(contract_id),
                })
            }
            ContractAction::Same { contract_id } => Ok(Reconciled {
                action,
                contract_id: Some(contract_id),
            }),
            ContractAction::Ambiguous { .. } | ContractAction::Fail { .. } => {
                Ok(Reconciled::without_row(action))
            }
        }
    }

    fn check_policy_owner(
        &self,
        customer_id: Option<i64>,
        draft: &ContractDraft,
    ) -> Result<Option<ContractAction>, DbError> {
        let others = self
            .db
            .policy_on_other_customers(customer_id, &draft.policy_no_norm)?;
        if others.is_empty() {
            return Ok(None);
        }
        let owners: Vec<String> = others.iter().map(|c| c.customer_id.to_string()).collect();
        Ok(Some(ContractAction::Ambiguous {
            reason: HoldReason::PolicyNoOtherCustomer,
            detail: format!(
                "policy {} already on customer {}",
                draft.policy_no_norm,
                owners.join(", ")
            ),
        }))
    }

    fn find_match(
        &self,
        customer_id: i64,
        draft: &ContractDraft,
        hashes: &ContractHashes,
    ) -> Result<ContractAction, DbError> {
        if let Some(found) = self.db.contract_by_key_hash(&hashes.key_hash)? {
            return Ok(settle(&found, hashes));
        }

        // Several rows with this policy number and none identical: let the
        // stable hash decide
        let by_policy = self
            .db
            .contracts_by_policy(customer_id, &draft.policy_no_norm)?;
        if let Some(found) = by_policy.iter().find(|c| c.content_hash == hashes.content_hash) {
            return Ok(settle(found, hashes));
        }
        if by_policy.len() == 1 {
            return Ok(settle(&by_policy[0], hashes));
        }

        let by_stable = self
            .db
            .contracts_by_stable_hash(customer_id, &hashes.stable_hash)?;
        if let Some(found) = by_stable.iter().find(|c| c.content_hash == hashes.content_hash) {
            return Ok(settle(found, hashes));
        }
        match by_stable.len() {
            0 => Ok(ContractAction::Insert),
            1 => Ok(settle(&by_stable[0], hashes)),
            n => {
                let numbered = by_stable.iter().any(|c| !c.policy_no_norm.is_empty());
                if draft.policy_no_norm.is_empty() && !numbered {
                    // Lowest id wins; the rows are indistinguishable
                    Ok(settle(&by_stable[0], hashes))
                } else {
                    Ok(ContractAction::Ambiguous {
                        reason: HoldReason::ContractAmbiguous,
                        detail: format!("{} contracts share the stable identity", n),
                    })
                }
            }
        }
    }

    fn insert(
        &self,
        customer_id: i64,
        draft: &ContractDraft,
        hashes: &ContractHashes,
    ) -> Result<Reconciled, DbError> {
        match self.db.insert_contract(customer_id, draft, hashes) {
            Ok(id) => Ok(Reconciled {
                action: ContractAction::Insert,
                contract_id: Some(id),
            }),
            Err(e) if e.is_constraint_violation() => {
                log::warn!("Contract insert collided on key; re-reading existing row");
                match self.db.contract_by_key_hash(&hashes.key_hash)? {
                    Some(found) => {
                        let action = settle(&found, hashes);
                        if let ContractAction::Update { contract_id } = action {
                            self.db.update_contract(contract_id, draft, hashes, false)?;
                        }
                        Ok(Reconciled {
                            action,
                            contract_id: Some(found.id),
                        })
                    }
                    None => Ok(Reconciled::without_row(ContractAction::Fail {
                        message: e.to_string(),
                    })),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn update(&self, id: i64, draft: &ContractDraft, hashes: &ContractHashes) -> Result<(), DbError> {
        match self.db.update_contract(id, draft, hashes, true) {
            Err(e) if e.is_constraint_violation() => {
                log::debug!("Contract {} keeps its key; new key belongs to another row", id);
                self.db.update_contract(id, draft, hashes, false)
            }
            other => other,
        }
    }
}

fn settle(found: &ContractIdentity, hashes: &ContractHashes) -> ContractAction {
    if found.content_hash == hashes.content_hash {
        ContractAction::Same {
            contract_id: found.id,
        }
    } else {
        ContractAction::Update {
            contract_id: found.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::CustomerFields;
    use crate::types::{FinancialRecord, PartyType, Policyholder, PrimaryRole};

    fn fin(policy: Option<&str>) -> FinancialRecord {
        FinancialRecord {
            company: Some("삼성생명".into()),
            product_name: Some("종신보험".into()),
            policy_no: policy.map(Into::into),
            premium: Some("50,000".into()),
            status: Some("정상".into()),
            start_date: Some("2024-03-01".into()),
            insured_name: Some("홍길동".into()),
            insured_birth: Some("1980-01-15".into()),
            ..Default::default()
        }
    }

    fn draft(fin: &FinancialRecord) -> ContractDraft {
        let holder = Policyholder {
            name: "홍길동".into(),
            phone: "010-1234-5678".into(),
            party_type: PartyType::Person,
            org_key: "홍길동".into(),
        };
        ContractDraft::new(fin, holder, PrimaryRole::Policyholder)
    }

    fn customer(db: &CrmDb, name: &str, phone: &str) -> i64 {
        db.insert_customer(&CustomerFields {
            name: name.into(),
            phone: phone.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_insert_then_same_then_update() {
        let db = test_db();
        let cid = customer(&db, "홍길동", "010-1234-5678");
        let rec = ContractReconciler::new(&db);

        let first = rec.reconcile(cid, &draft(&fin(Some("AB-123")))).unwrap();
        assert_eq!(first.action, ContractAction::Insert);
        let id = first.contract_id.unwrap();

        // Same policy written differently is the same contract
        let again = rec.reconcile(cid, &draft(&fin(Some("ab123")))).unwrap();
        assert_eq!(again.action, ContractAction::Same { contract_id: id });

        let mut changed = fin(Some("AB-123"));
        changed.status = Some("실효".into());
        let updated = rec.reconcile(cid, &draft(&changed)).unwrap();
        assert_eq!(updated.action, ContractAction::Update { contract_id: id });
        assert_eq!(
            db.get_contract(id).unwrap().unwrap().status.as_deref(),
            Some("실효")
        );
        assert_eq!(db.customer_contracts(cid).unwrap().len(), 1);
    }

    #[test]
    fn test_policy_on_other_customer_is_ambiguous() {
        let db = test_db();
        let a = customer(&db, "홍길동", "010-1234-5678");
        let b = customer(&db, "김철수", "010-9999-0000");
        let rec = ContractReconciler::new(&db);
        rec.reconcile(a, &draft(&fin(Some("AB-123")))).unwrap();

        let res = rec.reconcile(b, &draft(&fin(Some("AB123")))).unwrap();
        match res.action {
            ContractAction::Ambiguous { reason, .. } => {
                assert_eq!(reason, HoldReason::PolicyNoOtherCustomer)
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
        assert!(db.customer_contracts(b).unwrap().is_empty());

        // A customer that does not exist yet is checked globally
        let preview = rec.classify(None, &draft(&fin(Some("AB123")))).unwrap();
        assert_eq!(preview.code(), "ambig");
        let fresh = rec.classify(None, &draft(&fin(Some("ZZ-1")))).unwrap();
        assert_eq!(fresh, ContractAction::Insert);
    }

    #[test]
    fn test_policy_drift_found_by_stable_hash() {
        let db = test_db();
        let cid = customer(&db, "홍길동", "010-1234-5678");
        let rec = ContractReconciler::new(&db);
        let id = rec
            .reconcile(cid, &draft(&fin(None)))
            .unwrap()
            .contract_id
            .unwrap();

        // Policy number shows up later: same contract, updated
        let res = rec.reconcile(cid, &draft(&fin(Some("AB-123")))).unwrap();
        assert_eq!(res.action, ContractAction::Update { contract_id: id });
        assert_eq!(db.customer_contracts(cid).unwrap().len(), 1);
    }

    #[test]
    fn test_distinct_policies_sharing_stable_hash_are_ambiguous() {
        let db = test_db();
        let cid = customer(&db, "홍길동", "010-1234-5678");
        for policy in ["P-1", "P-2"] {
            let d = draft(&fin(Some(policy)));
            db.insert_contract(cid, &d, &contract_hashes(cid, &d)).unwrap();
        }
        let rec = ContractReconciler::new(&db);

        let mut changed = fin(None);
        changed.status = Some("실효".into());
        let res = rec.classify(Some(cid), &draft(&changed)).unwrap();
        match res {
            ContractAction::Ambiguous { reason, .. } => assert_eq!(reason, HoldReason::ContractAmbiguous),
            other => panic!("expected ambiguous, got {:?}", other),
        }

        let third = rec.classify(Some(cid), &draft(&fin(Some("P-3")))).unwrap();
        assert_eq!(third.code(), "ambig");
    }

    #[test]
    fn test_unnumbered_duplicates_resolve_to_lowest_id() {
        let db = test_db();
        let cid = customer(&db, "홍길동", "010-1234-5678");
        let d = draft(&fin(None));
        let hashes = contract_hashes(cid, &d);
        // Legacy duplicates: no key, no policy number
        for content in ["legacy-1", "legacy-2"] {
            db.conn_ref()
                .execute(
                    "INSERT INTO contracts (customer_id, company, policy_no_norm, stable_hash, content_hash)
                     VALUES (?1, '삼성생명', '', ?2, ?3)",
                    rusqlite::params![cid, hashes.stable_hash, content],
                )
                .unwrap();
        }
        let ids: Vec<i64> = db.customer_contracts(cid).unwrap().iter().map(|c| c.id).collect();
        let lowest = *ids.iter().min().unwrap();

        let res = ContractReconciler::new(&db).classify(Some(cid), &d).unwrap();
        assert_eq!(res, ContractAction::Update { contract_id: lowest });
    }

    #[test]
    fn test_missing_customer_fails() {
        let db = test_db();
        let res = ContractReconciler::new(&db)
            .reconcile(42, &draft(&fin(Some("P-1"))))
            .unwrap();
        assert_eq!(res.action.code(), "fail");
        assert!(res.contract_id.is_none());
    }

    #[test]
    fn test_action_serializes_with_short_codes() {
        let json = serde_json::to_value(ContractAction::Same { contract_id: 3 }).unwrap();
        assert_eq!(json["action"], "same");
        assert_eq!(json["contractId"], 3);
        let json = serde_json::to_value(ContractAction::Ambiguous {
            reason: HoldReason::ContractAmbiguous,
            detail: String::new(),
        })
        .unwrap();
        assert_eq!(json["action"], "ambig");
        assert_eq!(json["reason"], "CONTRACT_AMBIGUOUS");
    }
}
