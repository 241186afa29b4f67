use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::normalize::{field, non_blank, normalize_date, normalize_policy_no, normalize_premium};

/// Contract fields as they arrive from a spreadsheet row. Every field is
/// optional; blank and absent are equivalent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insured_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insured_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insured_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insured_gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_summary: Option<String>,
}

impl FinancialRecord {
    /// True when the record carries nothing that identifies a contract.
    pub fn is_blank(&self) -> bool {
        [
            &self.company,
            &self.product_name,
            &self.policy_no,
            &self.premium,
            &self.start_date,
            &self.insured_name,
        ]
        .iter()
        .all(|v| non_blank(v).is_none())
    }
}

/// One spreadsheet row after header mapping.
///
/// `name`/`phone` describe the contract holder as the sheet presents it. When
/// the sheet has explicit contract-holder columns they land in
/// `policyholder_*`; otherwise the row's own name and phone stand in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRow {
    pub row_no: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Pre-computed match key from an upstream export, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policyholder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policyholder_phone: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial: Option<FinancialRecord>,
}

impl ImportRow {
    /// Contract-holder name: explicit column first, then the row's name.
    pub fn holder_name(&self) -> &str {
        non_blank(&self.policyholder_name)
            .or_else(|| non_blank(&self.name))
            .unwrap_or("")
    }

    pub fn holder_phone(&self) -> &str {
        non_blank(&self.policyholder_phone)
            .or_else(|| non_blank(&self.phone))
            .unwrap_or("")
    }

    /// The financial sub-record, when it names a contract at all.
    pub fn contract(&self) -> Option<&FinancialRecord> {
        self.financial.as_ref().filter(|f| !f.is_blank())
    }
}

/// Which party of a contract is the CRM-relevant person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimaryRole {
    Policyholder,
    Insured,
}

impl PrimaryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryRole::Policyholder => "POLICYHOLDER",
            PrimaryRole::Insured => "INSURED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyType {
    Person,
    Corp,
}

impl PartyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyType::Person => "PERSON",
            PartyType::Corp => "CORP",
        }
    }
}

/// The identity fields that feed customer resolution for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityFields {
    pub name: String,
    pub phone: String,
    pub birth_date: String,
    pub gender: String,
}

/// Contract-holder block stored on every contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policyholder {
    pub name: String,
    pub phone: String,
    pub party_type: PartyType,
    /// Organization key (`normalize_org_name`); used by corporate search.
    pub org_key: String,
}

/// Contract fields ready for hashing and writing.
///
/// Text fields are trimmed raw values (normalization happens inside the
/// hash functions); dates are already `YYYY-MM-DD` where derivable and the
/// premium is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDraft {
    pub company: String,
    pub product_name: String,
    pub policy_no: String,
    pub policy_no_norm: String,
    pub premium: i64,
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    pub coverage_summary: String,
    pub insured_name: String,
    pub insured_phone: String,
    pub insured_birth: String,
    pub insured_gender: String,
    pub policyholder: Policyholder,
    pub primary_role: PrimaryRole,
}

impl ContractDraft {
    pub fn new(fin: &FinancialRecord, policyholder: Policyholder, primary_role: PrimaryRole) -> Self {
        let text = |v: &Option<String>| field(v).trim().to_string();
        let mut policyholder = policyholder;
        if policyholder.name.is_empty() {
            // Display and search still need a holder name
            policyholder.name = text(&fin.insured_name);
        }
        Self {
            company: text(&fin.company),
            product_name: text(&fin.product_name),
            policy_no: text(&fin.policy_no),
            policy_no_norm: normalize_policy_no(field(&fin.policy_no)),
            premium: normalize_premium(field(&fin.premium)),
            status: text(&fin.status),
            start_date: normalize_date(field(&fin.start_date)),
            end_date: normalize_date(field(&fin.end_date)),
            coverage_summary: text(&fin.coverage_summary),
            insured_name: text(&fin.insured_name),
            insured_phone: text(&fin.insured_phone),
            insured_birth: text(&fin.insured_birth),
            insured_gender: text(&fin.insured_gender),
            policyholder,
            primary_role,
        }
    }
}

/// Identity of an uploaded file: content hash plus display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFile {
    pub file_hash: String,
    pub filename: String,
    pub filesize: u64,
}

impl UploadFile {
    pub fn from_bytes(filename: &str, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            file_hash: hex::encode(hasher.finalize()),
            filename: filename.to_string(),
            filesize: bytes.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_falls_back_to_row_identity() {
        let row = ImportRow {
            name: Some("홍길동".into()),
            phone: Some("010-1111-2222".into()),
            ..Default::default()
        };
        assert_eq!(row.holder_name(), "홍길동");
        assert_eq!(row.holder_phone(), "010-1111-2222");

        let row = ImportRow {
            name: Some("홍길동".into()),
            policyholder_name: Some("㈜선경스틸".into()),
            ..Default::default()
        };
        assert_eq!(row.holder_name(), "㈜선경스틸");
    }

    #[test]
    fn test_blank_financial_is_not_a_contract() {
        let row = ImportRow {
            financial: Some(FinancialRecord {
                status: Some("정상".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(row.contract().is_none());
    }

    #[test]
    fn test_draft_normalizes_dates_and_premium() {
        let fin = FinancialRecord {
            company: Some(" 삼성생명 ".into()),
            policy_no: Some("ab-123".into()),
            premium: Some("35,000".into()),
            start_date: Some("2024.3.1".into()),
            insured_name: Some("김철수".into()),
            ..Default::default()
        };
        let holder = Policyholder {
            name: String::new(),
            phone: String::new(),
            party_type: PartyType::Person,
            org_key: String::new(),
        };
        let draft = ContractDraft::new(&fin, holder, PrimaryRole::Policyholder);
        assert_eq!(draft.company, "삼성생명");
        assert_eq!(draft.policy_no_norm, "AB123");
        assert_eq!(draft.premium, 35000);
        assert_eq!(draft.start_date, "2024-03-01");
        assert_eq!(draft.policyholder.name, "김철수");
    }

    #[test]
    fn test_upload_file_identity_is_content_hash() {
        let a = UploadFile::from_bytes("a.xlsx", b"same bytes");
        let b = UploadFile::from_bytes("renamed.xlsx", b"same bytes");
        assert_eq!(a.file_hash, b.file_hash);
        assert_eq!(a.file_hash.len(), 64);
        assert_eq!(a.filesize, 10);
    }
}
