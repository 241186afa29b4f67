//! Contract import for privacy-masked exports.
//!
//! Rows carry a masked name (`홍*동`), a phone or phone suffix, and contract
//! fields. Customers are never created here: the row must land on exactly
//! one existing customer, found by match key and confirmed by the masked
//! name pattern.

use serde::Serialize;

use crate::contract_match::{ContractAction, ContractReconciler};
use crate::db::{CrmDb, DbCustomer, DbError};
use crate::error::ImportError;
use crate::hashing::match_key;
use crate::import::{ApplyProgress, RowFailure};
use crate::name_match::is_name_match;
use crate::normalize::{field, normalize_name_for_key};
use crate::types::{ContractDraft, ImportRow, PartyType, Policyholder, PrimaryRole, UploadFile};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskedStats {
    pub inserted: usize,
    pub updated: usize,
    pub same: usize,
    /// Contracts the reconciler could not place.
    pub held: usize,
    /// Rows whose masked name fits more than one customer.
    pub ambiguous: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl MaskedStats {
    fn fail(&mut self, row_no: u32, message: String) {
        self.failed += 1;
        self.failures.push(RowFailure { row_no, message });
    }
}

/// Where a masked row's identity lands.
enum Target {
    Customer(DbCustomer),
    NoKey,
    NoCandidate,
    NameMismatch,
    Ambiguous(usize),
}

pub struct MaskedImporter<'a> {
    db: &'a CrmDb,
}

impl<'a> MaskedImporter<'a> {
    pub fn new(db: &'a CrmDb) -> Self {
        Self { db }
    }

    pub fn import(
        &self,
        file: &UploadFile,
        rows: &[ImportRow],
        progress: &mut dyn FnMut(&ApplyProgress),
    ) -> Result<MaskedStats, ImportError> {
        let mut stats = MaskedStats::default();
        let total = rows.len();

        for (idx, row) in rows.iter().enumerate() {
            let masked_name = field(&row.name).trim();
            match self.locate(row)? {
                Target::Customer(customer) => match row.contract() {
                    Some(fin) => {
                        let draft = ContractDraft::new(fin, holder_for(&customer), PrimaryRole::Policyholder);
                        let result = self.db.with_transaction(|db| {
                            ContractReconciler::new(db).reconcile(customer.id, &draft)
                        });
                        match result {
                            Ok(reconciled) => match reconciled.action {
                                ContractAction::Insert => stats.inserted += 1,
                                ContractAction::Update { .. } => stats.updated += 1,
                                ContractAction::Same { .. } => stats.same += 1,
                                ContractAction::Ambiguous { detail, .. } => {
                                    log::info!("Row {}: contract held ({})", row.row_no, detail);
                                    stats.held += 1;
                                }
                                ContractAction::Fail { message } => stats.fail(row.row_no, message),
                            },
                            Err(e) => {
                                log::warn!("Row {} rolled back: {}", row.row_no, e);
                                stats.fail(row.row_no, e.to_string());
                            }
                        }
                    }
                    None => stats.fail(row.row_no, format!("{}: no contract fields", masked_name)),
                },
                Target::NoKey => stats.fail(row.row_no, format!("{}: no match key", masked_name)),
                Target::NoCandidate => {
                    stats.fail(row.row_no, format!("{}: no customer candidate", masked_name))
                }
                Target::NameMismatch => {
                    stats.fail(row.row_no, format!("{}: name does not fit any candidate", masked_name))
                }
                Target::Ambiguous(n) => {
                    log::info!("Row {}: {} customers fit {}", row.row_no, n, masked_name);
                    stats.ambiguous += 1;
                }
            }
            progress(&ApplyProgress {
                done: idx + 1,
                total,
                row_no: row.row_no,
            });
        }

        self.db.record_upload(
            file,
            "masked",
            &serde_json::to_value(&stats).map_err(DbError::from)?,
        )?;
        log::info!(
            "Masked import {}: +{} ~{} ={} held {} ambiguous {} failed {}",
            file.filename,
            stats.inserted,
            stats.updated,
            stats.same,
            stats.held,
            stats.ambiguous,
            stats.failed
        );
        Ok(stats)
    }

    /// Broad filter by match key, then the masked-name check.
    fn locate(&self, row: &ImportRow) -> Result<Target, DbError> {
        let masked = normalize_name_for_key(field(&row.name));
        let key = match_key(field(&row.name), field(&row.phone));
        if key.is_empty() {
            return Ok(Target::NoKey);
        }
        let broad = self.db.customers_by_match_key(&key)?;
        if broad.is_empty() {
            return Ok(Target::NoCandidate);
        }
        let mut verified: Vec<DbCustomer> = broad
            .into_iter()
            .filter(|c| is_name_match(&normalize_name_for_key(&c.name), &masked))
            .collect();
        Ok(match verified.len() {
            0 => Target::NameMismatch,
            1 => Target::Customer(verified.remove(0)),
            n => Target::Ambiguous(n),
        })
    }
}

fn holder_for(customer: &DbCustomer) -> Policyholder {
    Policyholder {
        name: customer.name.clone(),
        phone: customer.phone.clone().unwrap_or_default(),
        party_type: PartyType::Person,
        org_key: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::CustomerFields;
    use crate::types::FinancialRecord;

    fn seed(db: &CrmDb, name: &str, phone: &str) -> i64 {
        db.insert_customer(&CustomerFields {
            name: name.into(),
            phone: phone.into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn masked(row_no: u32, name: &str, phone: &str, policy: &str) -> ImportRow {
        ImportRow {
            row_no,
            name: Some(name.into()),
            phone: Some(phone.into()),
            financial: Some(FinancialRecord {
                company: Some("한화생명".into()),
                product_name: Some("암보험".into()),
                policy_no: Some(policy.into()),
                premium: Some("32000".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn import(db: &CrmDb, rows: &[ImportRow]) -> MaskedStats {
        let file = UploadFile::from_bytes("masked.xlsx", b"masked");
        MaskedImporter::new(db)
            .import(&file, rows, &mut |_: &ApplyProgress| {})
            .unwrap()
    }

    #[test]
    fn test_masked_row_lands_on_verified_customer() {
        let db = test_db();
        let id = seed(&db, "홍길동", "010-1234-5678");
        let stats = import(&db, &[masked(2, "홍*동", "****5678", "M-1")]);
        assert_eq!(stats.inserted, 1);
        let contracts = db.customer_contracts(id).unwrap();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].policyholder_name.as_deref(), Some("홍길동"));

        let again = import(&db, &[masked(2, "홍*동", "****5678", "M-1")]);
        assert_eq!(again.same, 1);
        assert_eq!(db.customer_contracts(id).unwrap().len(), 1);
    }

    #[test]
    fn test_family_member_with_same_key_is_rejected() {
        let db = test_db();
        seed(&db, "홍길동", "010-1234-5678");
        let sibling = seed(&db, "홍길순", "010-9999-5678");
        let stats = import(&db, &[masked(2, "홍*순", "5678", "M-2")]);
        assert_eq!(stats.inserted, 1);
        assert_eq!(db.customer_contracts(sibling).unwrap().len(), 1);

        let stats = import(&db, &[masked(3, "홍**", "5678", "M-3")]);
        assert_eq!(stats.ambiguous, 1);
        assert_eq!(stats.inserted, 0);
    }

    #[test]
    fn test_unmatched_rows_fail_without_creating_customers() {
        let db = test_db();
        seed(&db, "홍길동", "010-1234-5678");
        let stats = import(
            &db,
            &[
                masked(2, "홍*서", "5678", "M-4"),
                masked(3, "김*수", "5678", "M-5"),
                masked(4, "홍*동", "", "M-6"),
            ],
        );
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.failures[0].row_no, 2);
        let customers: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(customers, 1);
    }
}
