//! Closed taxonomy of hold and failure reasons.

use serde::{Deserialize, Serialize};

/// Why a row was parked for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldReason {
    /// Stored customer with this phone has a different name.
    PhoneNameMismatchDb,
    /// Two or more stored customers share this phone.
    PhoneDupDb,
    /// New phone, but a customer with the same name and birth date exists.
    NameBirthDup,
    MatchKeyCandidates,
    NameLast4Candidates,
    SameNameCandidates,
    /// Same phone under different names within one upload.
    PhoneNameConflictFile,
    /// The policy number is already attached to another customer.
    PolicyNoOtherCustomer,
    /// Several stored contracts fit and none can be preferred.
    ContractAmbiguous,
}

impl HoldReason {
    pub fn code(&self) -> &'static str {
        match self {
            HoldReason::PhoneNameMismatchDb => "PHONE_NAME_MISMATCH_DB",
            HoldReason::PhoneDupDb => "PHONE_DUP_DB",
            HoldReason::NameBirthDup => "NAME_BIRTH_DUP",
            HoldReason::MatchKeyCandidates => "MATCH_KEY_CANDIDATES",
            HoldReason::NameLast4Candidates => "NAME_LAST4_CANDIDATES",
            HoldReason::SameNameCandidates => "SAME_NAME_CANDIDATES",
            HoldReason::PhoneNameConflictFile => "PHONE_NAME_CONFLICT_FILE",
            HoldReason::PolicyNoOtherCustomer => "POLICY_NO_OTHER_CUSTOMER",
            HoldReason::ContractAmbiguous => "CONTRACT_AMBIGUOUS",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            HoldReason::PhoneNameMismatchDb => {
                "phone belongs to a customer with a different name; choose before applying"
            }
            HoldReason::PhoneDupDb => "two or more customers already share this phone",
            HoldReason::NameBirthDup => {
                "a customer with the same name and birth date exists under another phone"
            }
            HoldReason::MatchKeyCandidates => "no phone; customers match the name initial and phone suffix",
            HoldReason::NameLast4Candidates => "no phone; customers match the name and phone suffix",
            HoldReason::SameNameCandidates => "no phone; customers with the same name exist",
            HoldReason::PhoneNameConflictFile => {
                "this upload uses the same phone under different names"
            }
            HoldReason::PolicyNoOtherCustomer => "policy number already belongs to another customer",
            HoldReason::ContractAmbiguous => "several stored contracts match this row",
        }
    }
}

/// Why a row cannot be written at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    NameMissing,
    /// No usable phone and no existing customer to attach to.
    PhoneMissing,
    WriteFailed,
}

impl FailReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailReason::NameMissing => "NAME_MISSING",
            FailReason::PhoneMissing => "PHONE_MISSING",
            FailReason::WriteFailed => "WRITE_FAILED",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FailReason::NameMissing => "name is missing",
            FailReason::PhoneMissing => "phone is missing; a new customer cannot be created safely",
            FailReason::WriteFailed => "the database rejected the write",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_serialized_names() {
        for reason in [
            HoldReason::PhoneNameMismatchDb,
            HoldReason::NameLast4Candidates,
            HoldReason::PolicyNoOtherCustomer,
        ] {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, reason.code());
        }
        assert_eq!(serde_json::to_value(FailReason::PhoneMissing).unwrap(), "PHONE_MISSING");
    }
}
