//! Policyholder / insured routing.
//!
//! Runs once per row, before any hashing or matching: the identity chosen
//! here determines which customer the contract hashes are scoped to.

use serde::{Deserialize, Serialize};

use crate::corporate::{normalize_org_name, CorporateClassifier};
use crate::normalize::{compact_name, field, non_blank};
use crate::types::{IdentityFields, ImportRow, PartyType, Policyholder, PrimaryRole};

/// Outcome of routing one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSplit {
    pub primary_role: PrimaryRole,
    pub policyholder: Policyholder,
    /// Fields the identity resolver sees for this row.
    pub identity: IdentityFields,
}

/// Decide which party is the CRM customer for `row`.
///
/// - Holder and insured are the same person (names equal ignoring
///   whitespace): the holder, role POLICYHOLDER.
/// - Holder is an organization and an insured person is named: the insured,
///   role INSURED. Missing insured phone, birth or gender fall back to the
///   row's own values.
/// - Otherwise: the holder, role POLICYHOLDER.
pub fn split_roles(row: &ImportRow, classifier: &dyn CorporateClassifier) -> RoleSplit {
    let holder_name = row.holder_name().to_string();
    let holder_phone = row.holder_phone().to_string();
    let party_type = if classifier.is_corporate(&holder_name) {
        PartyType::Corp
    } else {
        PartyType::Person
    };
    let policyholder = Policyholder {
        org_key: normalize_org_name(&holder_name),
        name: holder_name.clone(),
        phone: holder_phone.clone(),
        party_type,
    };

    let holder_identity = IdentityFields {
        name: holder_name.clone(),
        phone: holder_phone.clone(),
        birth_date: field(&row.birth_date).trim().to_string(),
        gender: field(&row.gender).trim().to_string(),
    };

    let fin = match row.financial.as_ref() {
        Some(fin) => fin,
        None => {
            return RoleSplit {
                primary_role: PrimaryRole::Policyholder,
                policyholder,
                identity: holder_identity,
            }
        }
    };

    let insured_name = match non_blank(&fin.insured_name) {
        Some(n) => n,
        None => {
            return RoleSplit {
                primary_role: PrimaryRole::Policyholder,
                policyholder,
                identity: holder_identity,
            }
        }
    };

    if compact_name(&holder_name) == compact_name(insured_name) || party_type == PartyType::Person {
        return RoleSplit {
            primary_role: PrimaryRole::Policyholder,
            policyholder,
            identity: holder_identity,
        };
    }

    log::debug!("Row {}: corporate holder, routing to insured", row.row_no);
    let identity = IdentityFields {
        name: insured_name.to_string(),
        phone: non_blank(&fin.insured_phone)
            .unwrap_or(&holder_phone)
            .to_string(),
        birth_date: non_blank(&fin.insured_birth)
            .unwrap_or(&holder_identity.birth_date)
            .to_string(),
        gender: non_blank(&fin.insured_gender)
            .unwrap_or(&holder_identity.gender)
            .to_string(),
    };
    RoleSplit {
        primary_role: PrimaryRole::Insured,
        policyholder,
        identity,
    }
}
