//! Customer identity resolution.
//!
//! A fixed cascade of lookups decides whether a row's identity fields name a
//! new customer, an existing one, or something an operator has to settle.
//! The resolver only reads; writes happen in the orchestrator.

use serde::{Deserialize, Serialize};

use crate::db::{CrmDb, CustomerCandidate, DbCustomer, DbError};
use crate::hashing::{match_key, normalize_match_key};
use crate::name_match::is_name_match;
use crate::normalize::{normalize_birth, normalize_name_for_key, normalize_phone, phone_last4};
use crate::reason::{FailReason, HoldReason};
use crate::types::IdentityFields;

/// Outcome of resolving one row's customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomerResolution {
    New,
    #[serde(rename_all = "camelCase")]
    Update { customer_id: i64 },
    Hold {
        reason: HoldReason,
        candidates: Vec<CustomerCandidate>,
    },
    Fail { reason: FailReason },
}

impl CustomerResolution {
    pub fn customer_id(&self) -> Option<i64> {
        match self {
            CustomerResolution::Update { customer_id } => Some(*customer_id),
            _ => None,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, CustomerResolution::Hold { .. })
    }

    /// Reason code for HOLD and FAIL, empty otherwise.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CustomerResolution::Hold { reason, .. } => reason.code(),
            CustomerResolution::Fail { reason } => reason.code(),
            _ => "",
        }
    }

    pub fn reason_message(&self) -> &'static str {
        match self {
            CustomerResolution::New => "new customer",
            CustomerResolution::Update { .. } => "matched by phone",
            CustomerResolution::Hold { reason, .. } => reason.message(),
            CustomerResolution::Fail { reason } => reason.message(),
        }
    }
}

/// Normalized phone digits, or `None` when the phone is blank or masked
/// (`****5678`, `010-XXXX-5678`). A masked phone only yields a suffix.
pub fn usable_phone(phone: &str) -> Option<String> {
    if phone.contains(|c: char| c == '*' || c == '?') || phone.contains("XX") || phone.contains("xx") {
        return None;
    }
    let digits = normalize_phone(phone);
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub struct IdentityResolver<'a> {
    db: &'a CrmDb,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(db: &'a CrmDb) -> Self {
        Self { db }
    }

    /// Classify `identity` against the store.
    ///
    /// `match_key_hint` is an upstream match key carried by the row, used
    /// only when the row has no usable phone.
    pub fn resolve(
        &self,
        identity: &IdentityFields,
        match_key_hint: &str,
    ) -> Result<CustomerResolution, DbError> {
        let name_norm = normalize_name_for_key(&identity.name);
        if name_norm.is_empty() {
            return Ok(CustomerResolution::Fail {
                reason: FailReason::NameMissing,
            });
        }
        let birth_norm = normalize_birth(&identity.birth_date);

        match usable_phone(&identity.phone) {
            Some(phone_norm) => self.resolve_by_phone(&name_norm, &phone_norm, &birth_norm),
            None => self.resolve_without_phone(identity, &name_norm, match_key_hint),
        }
    }

    fn resolve_by_phone(
        &self,
        name_norm: &str,
        phone_norm: &str,
        birth_norm: &str,
    ) -> Result<CustomerResolution, DbError> {
        let by_phone = self.db.customers_by_phone(phone_norm)?;
        match by_phone.len() {
            0 => {}
            1 => {
                let existing = &by_phone[0];
                let existing_norm = normalize_name_for_key(&existing.name);
                if !existing_norm.is_empty() && existing_norm != name_norm {
                    return Ok(hold(HoldReason::PhoneNameMismatchDb, &by_phone, 100, "phone"));
                }
                return Ok(CustomerResolution::Update {
                    customer_id: existing.id,
                });
            }
            _ => return Ok(hold(HoldReason::PhoneDupDb, &by_phone, 100, "phone")),
        }

        // New phone; same name and birth elsewhere is a likely duplicate
        let by_name_birth = self.db.customers_by_name_birth(name_norm, birth_norm)?;
        if !by_name_birth.is_empty() {
            return Ok(hold(HoldReason::NameBirthDup, &by_name_birth, 80, "name+birth"));
        }
        Ok(CustomerResolution::New)
    }

    fn resolve_without_phone(
        &self,
        identity: &IdentityFields,
        name_norm: &str,
        match_key_hint: &str,
    ) -> Result<CustomerResolution, DbError> {
        let last4 = phone_last4(&identity.phone);

        let key = match normalize_match_key(match_key_hint) {
            hint if hint.is_empty() => match_key(&identity.name, &last4),
            hint => hint,
        };
        if !key.is_empty() {
            let verified: Vec<DbCustomer> = self
                .db
                .customers_by_match_key(&key)?
                .into_iter()
                .filter(|c| is_name_match(&normalize_name_for_key(&c.name), name_norm))
                .collect();
            if !verified.is_empty() {
                return Ok(hold(HoldReason::MatchKeyCandidates, &verified, 70, "match_key"));
            }
        }

        if !last4.is_empty() {
            let by_last4 = self.db.customers_by_name_last4(name_norm, &last4)?;
            if !by_last4.is_empty() {
                return Ok(hold(HoldReason::NameLast4Candidates, &by_last4, 60, "name+last4"));
            }
        }

        let by_name = self
            .db
            .customers_by_name_birth(name_norm, &normalize_birth(&identity.birth_date))?;
        if !by_name.is_empty() {
            return Ok(hold(HoldReason::SameNameCandidates, &by_name, 50, "name"));
        }

        Ok(CustomerResolution::Fail {
            reason: FailReason::PhoneMissing,
        })
    }
}

fn hold(reason: HoldReason, customers: &[DbCustomer], score: u32, label: &str) -> CustomerResolution {
    CustomerResolution::Hold {
        reason,
        candidates: customers
            .iter()
            .map(|c| to_candidate(c, score, label))
            .collect(),
    }
}

pub(crate) fn to_candidate(c: &DbCustomer, score: u32, label: &str) -> CustomerCandidate {
    CustomerCandidate {
        customer_id: c.id,
        name: c.name.clone(),
        phone: c.phone.clone().unwrap_or_default(),
        birth_date: c.birth_date.clone().unwrap_or_default(),
        score,
        reason: label.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::CustomerFields;

    fn identity(name: &str, phone: &str, birth: &str) -> IdentityFields {
        IdentityFields {
            name: name.into(),
            phone: phone.into(),
            birth_date: birth.into(),
            gender: String::new(),
        }
    }

    fn seed(db: &CrmDb, name: &str, phone: &str, birth: &str) -> i64 {
        db.insert_customer(&CustomerFields {
            name: name.into(),
            phone: phone.into(),
            birth_date: birth.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_missing_name_fails() {
        let db = test_db();
        let res = IdentityResolver::new(&db)
            .resolve(&identity("  ", "010-1234-5678", ""), "")
            .unwrap();
        assert_eq!(
            res,
            CustomerResolution::Fail {
                reason: FailReason::NameMissing
            }
        );
    }

    #[test]
    fn test_new_phone_and_name_is_new() {
        let db = test_db();
        let res = IdentityResolver::new(&db)
            .resolve(&identity("홍길동", "010-1234-5678", "1980-01-15"), "")
            .unwrap();
        assert_eq!(res, CustomerResolution::New);
    }

    #[test]
    fn test_same_phone_same_name_is_update() {
        let db = test_db();
        let id = seed(&db, "홍길동", "010-1234-5678", "");
        let res = IdentityResolver::new(&db)
            .resolve(&identity("홍 길동", "01012345678", ""), "")
            .unwrap();
        assert_eq!(res, CustomerResolution::Update { customer_id: id });
    }

    #[test]
    fn test_phone_reused_under_other_name_holds() {
        let db = test_db();
        let id = seed(&db, "홍길동", "010-1234-5678", "");
        let res = IdentityResolver::new(&db)
            .resolve(&identity("김영희", "010-1234-5678", ""), "")
            .unwrap();
        match res {
            CustomerResolution::Hold { reason, candidates } => {
                assert_eq!(reason, HoldReason::PhoneNameMismatchDb);
                assert_eq!(candidates[0].customer_id, id);
                assert_eq!(candidates[0].score, 100);
            }
            other => panic!("expected hold, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_phone_in_store_holds() {
        let db = test_db();
        seed(&db, "홍길동", "010-1234-5678", "");
        seed(&db, "홍길동", "010-1234-5678", "");
        let res = IdentityResolver::new(&db)
            .resolve(&identity("홍길동", "010-1234-5678", ""), "")
            .unwrap();
        assert_eq!(res.reason_code(), "PHONE_DUP_DB");
    }

    #[test]
    fn test_new_phone_with_name_birth_collision_holds() {
        let db = test_db();
        seed(&db, "홍길동", "010-1111-1111", "1980-01-15");
        let resolver = IdentityResolver::new(&db);
        let res = resolver
            .resolve(&identity("홍길동", "010-2222-2222", "19800115"), "")
            .unwrap();
        assert_eq!(res.reason_code(), "NAME_BIRTH_DUP");

        let other_birth = resolver
            .resolve(&identity("홍길동", "010-2222-2222", "1990-01-01"), "")
            .unwrap();
        assert_eq!(other_birth, CustomerResolution::New);

        // No incoming birth: same name alone is enough
        let no_birth = resolver
            .resolve(&identity("홍길동", "010-2222-2222", ""), "")
            .unwrap();
        assert_eq!(no_birth.reason_code(), "NAME_BIRTH_DUP");
    }

    #[test]
    fn test_no_phone_cascade() {
        let db = test_db();
        let resolver = IdentityResolver::new(&db);
        assert_eq!(
            resolver.resolve(&identity("홍길동", "", ""), "").unwrap(),
            CustomerResolution::Fail {
                reason: FailReason::PhoneMissing
            }
        );

        let id = seed(&db, "홍길동", "010-1234-5678", "");
        let masked = resolver.resolve(&identity("홍*동", "****5678", ""), "").unwrap();
        match masked {
            CustomerResolution::Hold { reason, candidates } => {
                assert_eq!(reason, HoldReason::MatchKeyCandidates);
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].customer_id, id);
            }
            other => panic!("expected hold, got {:?}", other),
        }

        let same_name = resolver.resolve(&identity("홍길동", "", ""), "").unwrap();
        assert_eq!(same_name.reason_code(), "SAME_NAME_CANDIDATES");
    }

    #[test]
    fn test_upstream_match_key_is_verified_by_name() {
        let db = test_db();
        seed(&db, "홍길순", "010-1234-5678", "");
        let res = IdentityResolver::new(&db)
            .resolve(&identity("홍길동", "", ""), "홍5678")
            .unwrap();
        assert_eq!(res.reason_code(), "PHONE_MISSING");
    }

    #[test]
    fn test_short_phone_is_still_a_phone() {
        assert_eq!(usable_phone("555-1234").as_deref(), Some("5551234"));
        assert_eq!(usable_phone("02-123-4567").as_deref(), Some("021234567"));
        assert!(usable_phone("****5678").is_none());
        assert!(usable_phone("010-XXXX-5678").is_none());
        assert!(usable_phone(" ").is_none());
        assert!(usable_phone("02-555-1234 ext 3").is_some());

        let db = test_db();
        let res = IdentityResolver::new(&db)
            .resolve(&identity("김영희", "555-1234", ""), "")
            .unwrap();
        assert_eq!(res, CustomerResolution::New);
    }

    #[test]
    fn test_upstream_match_key_case_is_ignored() {
        let db = test_db();
        let id = seed(&db, "Kim", "010-1111-5678", "");
        let res = IdentityResolver::new(&db)
            .resolve(&identity("Kim", "", ""), "K5678")
            .unwrap();
        match res {
            CustomerResolution::Hold { reason, candidates } => {
                assert_eq!(reason, HoldReason::MatchKeyCandidates);
                assert_eq!(candidates[0].customer_id, id);
            }
            other => panic!("expected hold, got {:?}", other),
        }
    }
}
