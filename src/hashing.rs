//! Deterministic identity keys for customers and contracts.
//!
//! Contract hashes are SHA-1 hex digests of pipe-joined normalized field
//! tuples. The tuple layouts are persisted (`contracts.key_hash` carries a
//! unique index), so changing any of them orphans existing rows.

use sha1::{Digest, Sha1};

use crate::normalize::{
    normalize_birth, normalize_date, normalize_name_for_key, normalize_phone, normalize_policy_no,
    normalize_text, phone_last4,
};
use crate::types::ContractDraft;

/// Broad customer filter: first name character plus last four phone digits.
///
/// Accepts a full phone number or an already-truncated suffix. Empty unless
/// both parts exist. Not unique; callers verify candidates by name.
pub fn match_key(name: &str, phone_or_last4: &str) -> String {
    let first = match normalize_name_for_key(name).chars().next() {
        Some(c) => c,
        None => return String::new(),
    };
    let last4 = phone_last4(phone_or_last4);
    if last4.is_empty() {
        return String::new();
    }
    format!("{}{}", first, last4)
}

/// Canonical form of a match key supplied by an upstream export, comparable
/// with [`match_key`] output.
pub fn normalize_match_key(key: &str) -> String {
    normalize_name_for_key(key)
}

/// The three contract identity hashes, always computed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractHashes {
    /// Primary dedup key (unique across all contracts).
    pub key_hash: String,
    /// Secondary identity that ignores the policy number.
    pub stable_hash: String,
    /// Change detection over every business-visible field.
    pub content_hash: String,
}

pub fn contract_hashes(customer_id: i64, draft: &ContractDraft) -> ContractHashes {
    ContractHashes {
        key_hash: contract_key_hash(customer_id, draft),
        stable_hash: contract_stable_hash(customer_id, draft),
        content_hash: contract_content_hash(customer_id, draft),
    }
}

fn sha1_hex(base: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(base.as_bytes());
    hex::encode(hasher.finalize())
}

/// Insured birth date when known, else the insured name.
fn insured_discriminator(draft: &ContractDraft) -> String {
    let birth = normalize_birth(&draft.insured_birth);
    if !birth.is_empty() {
        return birth;
    }
    normalize_name_for_key(&draft.insured_name)
}

/// `P|customer|company|policy` when a policy number exists, otherwise
/// `N|customer|company|product|start|premium|insured`.
pub fn contract_key_hash(customer_id: i64, draft: &ContractDraft) -> String {
    let cid = customer_id.to_string();
    let company = normalize_text(&draft.company);
    let policy = normalize_policy_no(&draft.policy_no);

    let base = if !policy.is_empty() {
        format!("P|{}|{}|{}", cid, company, policy)
    } else {
        format!(
            "N|{}|{}|{}|{}|{}|{}",
            cid,
            company,
            normalize_text(&draft.product_name),
            normalize_date(&draft.start_date),
            draft.premium,
            insured_discriminator(draft)
        )
    };
    sha1_hex(&base)
}

/// Survives policy-number drift: never reads the policy number.
pub fn contract_stable_hash(customer_id: i64, draft: &ContractDraft) -> String {
    let base = format!(
        "S|{}|{}|{}|{}|{}|{}|{}",
        customer_id,
        normalize_text(&draft.company),
        normalize_text(&draft.product_name),
        normalize_date(&draft.start_date),
        draft.premium,
        insured_discriminator(draft),
        normalize_text(&draft.insured_gender)
    );
    sha1_hex(&base)
}

pub fn contract_content_hash(customer_id: i64, draft: &ContractDraft) -> String {
    let base = [
        customer_id.to_string(),
        normalize_text(&draft.company),
        normalize_text(&draft.product_name),
        normalize_policy_no(&draft.policy_no),
        draft.premium.to_string(),
        normalize_text(&draft.status),
        normalize_date(&draft.start_date),
        normalize_date(&draft.end_date),
        normalize_name_for_key(&draft.insured_name),
        normalize_text(&draft.insured_phone),
        normalize_birth(&draft.insured_birth),
        normalize_text(&draft.insured_gender),
        normalize_text(&draft.coverage_summary),
    ]
    .join("|");
    sha1_hex(&base)
}

/// Customer-level origin fingerprint (name key, phone digits, birth).
pub fn customer_stable_hash(name: &str, phone: &str, birth_date: &str) -> String {
    let base = format!(
        "C|{}|{}|{}",
        normalize_name_for_key(name),
        normalize_phone(phone),
        normalize_birth(birth_date)
    );
    sha1_hex(&base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinancialRecord, PartyType, Policyholder, PrimaryRole};

    fn draft(fin: FinancialRecord) -> ContractDraft {
        let holder = Policyholder {
            name: "홍길동".into(),
            phone: String::new(),
            party_type: PartyType::Person,
            org_key: String::new(),
        };
        ContractDraft::new(&fin, holder, PrimaryRole::Policyholder)
    }

    fn base_fin() -> FinancialRecord {
        FinancialRecord {
            company: Some("삼성생명".into()),
            product_name: Some("종신보험".into()),
            policy_no: Some("AB-123".into()),
            premium: Some("50000".into()),
            start_date: Some("2024-03-01".into()),
            insured_name: Some("홍길동".into()),
            insured_birth: Some("1980-01-15".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_key() {
        assert_eq!(match_key("홍길동", "010-1234-5678"), "홍5678");
        assert_eq!(match_key("홍*동", "5678"), "홍5678");
        assert_eq!(normalize_match_key(" K5678 "), match_key("Kim", "010-1111-5678"));
        assert_eq!(normalize_match_key("홍5678"), "홍5678");
        assert_eq!(match_key("", "010-1234-5678"), "");
        assert_eq!(match_key("홍길동", "12"), "");
        assert_eq!(match_key("  Kim", "0101"), "k0101");
    }

    #[test]
    fn test_policy_number_formatting_does_not_change_identity() {
        let a = draft(base_fin());
        let b = draft(FinancialRecord {
            policy_no: Some(" ab123 ".into()),
            ..base_fin()
        });
        assert_eq!(contract_hashes(7, &a), contract_hashes(7, &b));
    }

    #[test]
    fn test_key_hash_is_scoped_by_customer() {
        let d = draft(base_fin());
        assert_ne!(contract_key_hash(1, &d), contract_key_hash(2, &d));
    }

    #[test]
    fn test_stable_hash_ignores_policy_number() {
        let a = draft(base_fin());
        let b = draft(FinancialRecord {
            policy_no: Some("ZZ-999".into()),
            ..base_fin()
        });
        assert_ne!(contract_key_hash(1, &a), contract_key_hash(1, &b));
        assert_eq!(contract_stable_hash(1, &a), contract_stable_hash(1, &b));
    }

    #[test]
    fn test_key_hash_without_policy_uses_discriminator() {
        let no_policy = FinancialRecord {
            policy_no: None,
            ..base_fin()
        };
        let a = draft(no_policy.clone());
        let b = draft(FinancialRecord {
            insured_birth: Some("19900202".into()),
            ..no_policy.clone()
        });
        assert_ne!(contract_key_hash(1, &a), contract_key_hash(1, &b));

        // Birth missing: insured name discriminates instead
        let c = draft(FinancialRecord {
            insured_birth: None,
            insured_name: Some("김철수".into()),
            ..no_policy
        });
        assert_ne!(contract_key_hash(1, &a), contract_key_hash(1, &c));
    }

    #[test]
    fn test_content_hash_tracks_status() {
        let a = draft(base_fin());
        let b = draft(FinancialRecord {
            status: Some("실효".into()),
            ..base_fin()
        });
        assert_eq!(contract_key_hash(1, &a), contract_key_hash(1, &b));
        assert_ne!(contract_content_hash(1, &a), contract_content_hash(1, &b));
    }

    #[test]
    fn test_hash_format() {
        let h = contract_key_hash(1, &draft(base_fin()));
        assert_eq!(h.len(), 40);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
