//! Hold store and decision workflow.
//!
//! Rows the engines cannot settle are parked per (file, row). An operator
//! corrects them, then decides: map to an existing customer, create a new
//! one, or skip. Every decision leaves a decision row, an approval proof and
//! an audit entry. A hold is RESOLVED only when its contract also lands
//! cleanly; RESOLVED is terminal.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::contract_match::{ContractAction, ContractReconciler, Reconciled};
use crate::db::{CrmDb, CustomerCandidate, DbError, DbHold, HoldBatch, HoldFilter, HoldRecord};
use crate::error::ImportError;
use crate::import::{customer_fields, Analysis, RowAnalysis, RowStatus};
use crate::normalize::{non_blank, normalize_birth, normalize_name_for_key, normalize_phone};
use crate::roles::RoleSplit;
use crate::types::{ContractDraft, IdentityFields, ImportRow, UploadFile};

/// Candidate list size kept on a hold.
const CANDIDATE_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Open,
    Skipped,
    Resolved,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Open => "OPEN",
            HoldStatus::Skipped => "SKIPPED",
            HoldStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "OPEN" => Some(HoldStatus::Open),
            "SKIPPED" => Some(HoldStatus::Skipped),
            "RESOLVED" => Some(HoldStatus::Resolved),
            _ => None,
        }
    }
}

/// Operator decision for a held row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    #[serde(rename_all = "camelCase")]
    MapExisting { customer_id: i64 },
    CreateNew,
    Skip,
}

impl Decision {
    pub fn code(&self) -> &'static str {
        match self {
            Decision::MapExisting { .. } => "MAP_EXISTING",
            Decision::CreateNew => "CREATE_NEW",
            Decision::Skip => "SKIP",
        }
    }

    /// Build a decision from its code and optional target customer.
    pub fn from_parts(code: &str, target: Option<i64>) -> Result<Self, ImportError> {
        match code.trim().to_uppercase().as_str() {
            "MAP_EXISTING" | "MAP" => target
                .map(|customer_id| Decision::MapExisting { customer_id })
                .ok_or(ImportError::TargetRequired),
            "CREATE_NEW" | "NEW" => Ok(Decision::CreateNew),
            "SKIP" => Ok(Decision::Skip),
            other => Err(ImportError::UnknownDecision(other.to_string())),
        }
    }
}

/// Operator overlay on a held row's identity. `None` keeps the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
}

impl Correction {
    /// Later values win field by field.
    pub fn merged(&self, newer: &Correction) -> Correction {
        Correction {
            name: newer.name.clone().or_else(|| self.name.clone()),
            phone: newer.phone.clone().or_else(|| self.phone.clone()),
            birth_date: newer.birth_date.clone().or_else(|| self.birth_date.clone()),
        }
    }

    pub fn apply_to(&self, identity: &IdentityFields) -> IdentityFields {
        let pick = |c: &Option<String>, current: &str| {
            non_blank(c).unwrap_or(current).to_string()
        };
        IdentityFields {
            name: pick(&self.name, &identity.name),
            phone: pick(&self.phone, &identity.phone),
            birth_date: pick(&self.birth_date, &identity.birth_date),
            gender: identity.gender.clone(),
        }
    }

    pub(crate) fn decode(s: &str) -> Correction {
        if s.trim().is_empty() {
            return Correction::default();
        }
        serde_json::from_str(s).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable hold correction: {}", e);
            Correction::default()
        })
    }
}

/// Everything needed to replay a held row after a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldPayload {
    pub row: ImportRow,
    pub split: RoleSplit,
}

/// Contract summary shown next to a hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractHint {
    pub company: Option<String>,
    pub product_name: Option<String>,
    pub policy_no: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub insured_name: Option<String>,
    pub policyholder_name: Option<String>,
}

/// A hold with its snapshots decoded for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldView {
    pub id: i64,
    pub file_hash: String,
    pub row_no: u32,
    pub filename: Option<String>,
    pub reason_code: String,
    pub reason_msg: String,
    pub status: String,
    pub normalized: Value,
    pub corrected: Correction,
    pub candidates: Vec<CustomerCandidate>,
    pub contract_hint: ContractHint,
    pub display_name: String,
    pub display_phone: String,
    pub created_at: String,
    pub updated_at: String,
}

impl HoldView {
    fn from_hold(hold: DbHold) -> Self {
        let normalized: Value = decode_or(&hold.normalized_json, json!({}));
        let corrected = Correction::decode(&hold.corrected_json);
        let candidates: Vec<CustomerCandidate> = decode_or(&hold.candidates_json, Vec::new());
        let payload: Option<HoldPayload> = serde_json::from_str(&hold.row_payload_json).ok();

        let contract_hint = payload
            .as_ref()
            .map(|p| {
                let fin = p.row.financial.clone().unwrap_or_default();
                ContractHint {
                    company: fin.company,
                    product_name: fin.product_name,
                    policy_no: fin.policy_no,
                    status: fin.status,
                    start_date: fin.start_date,
                    end_date: fin.end_date,
                    insured_name: fin.insured_name,
                    policyholder_name: Some(p.split.policyholder.name.clone())
                        .filter(|s| !s.is_empty()),
                }
            })
            .unwrap_or_default();

        // corrected > normalized > raw
        let display = |corr: &Option<String>, key: &str, raw: Option<&str>| -> String {
            non_blank(corr)
                .map(str::to_string)
                .or_else(|| {
                    normalized
                        .get(key)
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                })
                .or_else(|| raw.map(str::to_string))
                .unwrap_or_else(|| "-".to_string())
        };
        let raw_name = payload.as_ref().and_then(|p| non_blank(&p.row.name));
        let raw_phone = payload.as_ref().and_then(|p| non_blank(&p.row.phone));
        let display_name = display(&corrected.name, "name", raw_name);
        let display_phone = display(&corrected.phone, "phone", raw_phone);

        HoldView {
            id: hold.id,
            file_hash: hold.file_hash,
            row_no: hold.row_no,
            filename: hold.filename,
            reason_code: hold.reason_code,
            reason_msg: hold.reason_msg,
            status: hold.status,
            normalized,
            corrected,
            candidates,
            contract_hint,
            display_name,
            display_phone,
            created_at: hold.created_at,
            updated_at: hold.updated_at,
        }
    }
}

/// What a decision did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub hold_id: i64,
    pub decision: Decision,
    pub status: HoldStatus,
    pub customer_id: Option<i64>,
    pub customer_created: bool,
    pub contract: Option<Reconciled>,
}

pub struct HoldStore<'a> {
    db: &'a CrmDb,
    actor: &'a str,
}

impl<'a> HoldStore<'a> {
    pub fn new(db: &'a CrmDb, actor: &'a str) -> Self {
        Self { db, actor }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Upsert the held rows of an analyzed batch. RESOLVED holds are left
    /// alone; SKIPPED holds keep their status. Returns the rows written.
    pub fn sync(&self, analysis: &Analysis) -> Result<usize, DbError> {
        self.db.with_transaction(|db| {
            let mut synced = 0;
            for row in analysis.rows.iter().filter(|r| r.status == RowStatus::Hold) {
                match db.hold_by_file_row(&analysis.file.file_hash, row.row_no)? {
                    Some(existing) if existing.status == HoldStatus::Resolved.as_str() => {
                        log::debug!("Row {} already resolved; hold left as is", row.row_no);
                    }
                    Some(existing) => {
                        db.refresh_hold(existing.id, &hold_record(&analysis.file, row)?)?;
                        synced += 1;
                    }
                    None => {
                        HoldStore::new(db, self.actor).open_hold(&analysis.file, row)?;
                        synced += 1;
                    }
                }
            }
            if synced > 0 {
                log::info!("Synced {} holds for {}", synced, analysis.file.filename);
            }
            Ok(synced)
        })
    }

    /// Insert a hold for a held row that has none yet.
    pub(crate) fn open_hold(&self, file: &UploadFile, row: &RowAnalysis) -> Result<DbHold, DbError> {
        let record = hold_record(file, row)?;
        let id = self.db.insert_hold(&record)?;
        self.db.insert_audit_log(
            "HOLD_CREATE",
            Some(id),
            "upload_holds",
            Some(id),
            &json!({
                "fileHash": file.file_hash,
                "rowNo": row.row_no,
                "reason": record.reason_code,
            }),
            self.actor,
        )?;
        self.db
            .get_hold(id)?
            .ok_or_else(|| DbError::InvalidInput(format!("hold {} vanished after insert", id)))
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn list(&self, filter: &HoldFilter) -> Result<Vec<HoldView>, DbError> {
        Ok(self
            .db
            .list_holds(filter)?
            .into_iter()
            .map(HoldView::from_hold)
            .collect())
    }

    pub fn get(&self, hold_id: i64) -> Result<HoldView, ImportError> {
        let hold = self
            .db
            .get_hold(hold_id)?
            .ok_or(ImportError::HoldNotFound(hold_id))?;
        Ok(HoldView::from_hold(hold))
    }

    pub fn batches(&self, limit: u32) -> Result<Vec<HoldBatch>, DbError> {
        self.db.list_hold_batches(limit)
    }

    pub fn reason_codes(&self) -> Result<Vec<String>, DbError> {
        self.db.hold_reason_codes()
    }

    // =========================================================================
    // Correction
    // =========================================================================

    /// Store an operator correction and recompute candidates against the
    /// corrected identity.
    pub fn correct(&self, hold_id: i64, correction: &Correction) -> Result<HoldView, ImportError> {
        self.db.with_transaction(|db| {
            let hold = db
                .get_hold(hold_id)?
                .ok_or(ImportError::HoldNotFound(hold_id))?;
            if hold.status == HoldStatus::Resolved.as_str() {
                return Err(ImportError::HoldAlreadyResolved(hold_id));
            }
            let payload = decode_payload(&hold)?;
            let merged = Correction::decode(&hold.corrected_json).merged(correction);
            let identity = merged.apply_to(&payload.split.identity);

            let candidates = db.find_candidates(
                &identity.name,
                &identity.phone,
                &identity.birth_date,
                CANDIDATE_LIMIT,
            )?;
            db.set_hold_correction(
                hold_id,
                &serde_json::to_string(&merged).map_err(DbError::from)?,
                &serde_json::to_string(&candidates).map_err(DbError::from)?,
            )?;
            db.insert_audit_log(
                "HOLD_CORRECT",
                Some(hold_id),
                "upload_holds",
                Some(hold_id),
                &json!({ "corrected": merged, "candidates": candidates.len() }),
                self.actor,
            )?;
            Ok(())
        })?;
        self.get(hold_id)
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    /// Apply an operator decision to a hold in one transaction.
    pub fn decide(&self, hold_id: i64, decision: Decision) -> Result<DecisionOutcome, ImportError> {
        let outcome = self.db.with_transaction(|db| {
            let hold = db
                .get_hold(hold_id)?
                .ok_or(ImportError::HoldNotFound(hold_id))?;
            if hold.status == HoldStatus::Resolved.as_str() {
                return Err(ImportError::HoldAlreadyResolved(hold_id));
            }
            let payload = decode_payload(&hold)?;
            let correction = Correction::decode(&hold.corrected_json);
            HoldStore::new(db, self.actor).execute(&hold, &payload, &correction, decision, "hold_store")
        })?;
        log::info!(
            "Hold {} decided {} -> {}",
            hold_id,
            decision.code(),
            outcome.status.as_str()
        );
        Ok(outcome)
    }

    /// Carry out `decision` for a synced hold. Runs inside the caller's
    /// transaction.
    ///
    /// A hold left OPEN by an earlier CREATE_NEW (its contract did not
    /// settle) reuses the customer that decision created.
    pub(crate) fn execute(
        &self,
        hold: &DbHold,
        payload: &HoldPayload,
        correction: &Correction,
        decision: Decision,
        source: &str,
    ) -> Result<DecisionOutcome, ImportError> {
        let hold_id = hold.id;

        let (customer_id, customer_created) = match decision {
            Decision::Skip => {
                self.record_trail(hold_id, decision, None, json!({ "source": source }))?;
                self.db.set_hold_status(hold_id, HoldStatus::Skipped.as_str())?;
                return Ok(DecisionOutcome {
                    hold_id,
                    decision,
                    status: HoldStatus::Skipped,
                    customer_id: None,
                    customer_created: false,
                    contract: None,
                });
            }
            Decision::MapExisting { customer_id } => {
                if self.db.get_customer(customer_id)?.is_none() {
                    return Err(ImportError::CustomerNotFound(customer_id));
                }
                (customer_id, false)
            }
            Decision::CreateNew => match self.db.customer_created_for_hold(hold_id)? {
                Some(id) => {
                    log::debug!("Hold {} reuses customer {} from an earlier CREATE_NEW", hold_id, id);
                    (id, false)
                }
                None => {
                    let identity = correction.apply_to(&payload.split.identity);
                    let fields =
                        customer_fields(&payload.row, &identity, payload.split.primary_role, source)?;
                    (self.db.create_customer_unconditionally(&fields, Some(hold_id), self.actor)?, true)
                }
            },
        };

        let contract = match payload.row.contract() {
            Some(fin) => {
                let draft = ContractDraft::new(
                    fin,
                    payload.split.policyholder.clone(),
                    payload.split.primary_role,
                );
                Some(ContractReconciler::new(self.db).reconcile(customer_id, &draft)?)
            }
            None => None,
        };
        let contract_code = contract.as_ref().map(|c| c.action.code()).unwrap_or("none");

        self.record_trail(
            hold_id,
            decision,
            Some(customer_id),
            json!({
                "source": source,
                "customerId": customer_id,
                "contractAction": contract_code,
            }),
        )?;

        let settled = contract.as_ref().map_or(true, |c| c.action.is_clean());
        let status = if settled {
            HoldStatus::Resolved
        } else {
            HoldStatus::Open
        };

        if settled {
            self.db.set_hold_status(hold_id, HoldStatus::Resolved.as_str())?;
            self.db.insert_audit_log(
                "HOLD_RESOLVED",
                Some(hold_id),
                "upload_holds",
                Some(hold_id),
                &json!({ "customerId": customer_id, "contractAction": contract_code }),
                self.actor,
            )?;
        } else {
            self.keep_open(hold, customer_id, contract.as_ref())?;
        }

        Ok(DecisionOutcome {
            hold_id,
            decision,
            status,
            customer_id: Some(customer_id),
            customer_created,
            contract,
        })
    }

    /// Close a held row whose contract landed cleanly during a batch apply.
    /// Returns whether a hold was closed.
    pub(crate) fn auto_resolve(&self, file_hash: &str, row_no: u32, detail: &Reconciled) -> Result<bool, DbError> {
        let hold = match self.db.hold_by_file_row(file_hash, row_no)? {
            Some(h) if h.status != HoldStatus::Resolved.as_str() => h,
            _ => return Ok(false),
        };
        self.db.set_hold_status(hold.id, HoldStatus::Resolved.as_str())?;
        self.db.insert_audit_log(
            "HOLD_AUTO_RESOLVED_AFTER_APPLY",
            Some(hold.id),
            "upload_holds",
            Some(hold.id),
            &json!({ "contractAction": detail.action.code(), "contractId": detail.contract_id }),
            self.actor,
        )?;
        Ok(true)
    }

    /// The customer side is settled but the contract is not: the hold stays
    /// OPEN with the contract's reason, and candidates now include the
    /// customer the decision bound.
    fn keep_open(&self, hold: &DbHold, customer_id: i64, contract: Option<&Reconciled>) -> Result<(), ImportError> {
        let (code, detail) = match contract.map(|c| &c.action) {
            Some(ContractAction::Ambiguous { reason, detail }) => {
                (reason.code().to_string(), detail.clone())
            }
            Some(ContractAction::Fail { message }) => {
                (hold.reason_code.clone(), message.clone())
            }
            _ => (hold.reason_code.clone(), String::new()),
        };
        let code_label = contract.map(|c| c.action.code()).unwrap_or("none");
        let base = hold
            .reason_msg
            .split(" | contract:")
            .next()
            .unwrap_or(&hold.reason_msg);
        let msg = format!(
            "{} | contract:{} {} (customer {})",
            base, code_label, detail, customer_id
        );
        self.db.set_hold_status(hold.id, HoldStatus::Open.as_str())?;
        self.db.set_hold_reason(hold.id, &code, msg.trim())?;

        let mut candidates: Vec<CustomerCandidate> = decode_or(&hold.candidates_json, Vec::new());
        if !candidates.iter().any(|c| c.customer_id == customer_id) {
            if let Some(c) = self.db.get_customer(customer_id)? {
                candidates.insert(0, crate::identity::to_candidate(&c, 100, "decided"));
            }
        }
        self.db.set_hold_correction(
            hold.id,
            &hold.corrected_json,
            &serde_json::to_string(&candidates).map_err(DbError::from)?,
        )?;
        self.db.insert_audit_log(
            "HOLD_DECISION_CONTRACT_PENDING",
            Some(hold.id),
            "upload_holds",
            Some(hold.id),
            &json!({ "customerId": customer_id, "contractAction": code_label }),
            self.actor,
        )?;
        log::warn!("Hold {} stays open: contract {}", hold.id, code_label);
        Ok(())
    }

    fn record_trail(
        &self,
        hold_id: i64,
        decision: Decision,
        customer_id: Option<i64>,
        detail: Value,
    ) -> Result<(), DbError> {
        self.db
            .insert_hold_decision(hold_id, decision.code(), customer_id, &detail, self.actor)?;
        self.db.insert_approval_proof(
            hold_id,
            "APPROVED",
            &json!({ "decision": decision.code(), "customerId": customer_id }),
            self.actor,
        )?;
        self.db.insert_audit_log(
            &format!("HOLD_DECISION_{}", decision.code()),
            Some(hold_id),
            "upload_holds",
            Some(hold_id),
            &detail,
            self.actor,
        )?;
        Ok(())
    }
}

fn decode_or<T: serde::de::DeserializeOwned>(s: &str, default: T) -> T {
    if s.trim().is_empty() {
        return default;
    }
    serde_json::from_str(s).unwrap_or(default)
}

fn decode_payload(hold: &DbHold) -> Result<HoldPayload, ImportError> {
    serde_json::from_str(&hold.row_payload_json)
        .map_err(|e| ImportError::CorruptSnapshot(hold.id, e.to_string()))
}

fn hold_record(file: &UploadFile, row: &RowAnalysis) -> Result<HoldRecord, DbError> {
    let identity = &row.split.identity;
    let normalized = json!({
        "name": identity.name,
        "phone": identity.phone,
        "birthDate": identity.birth_date,
        "gender": identity.gender,
        "nameNorm": normalize_name_for_key(&identity.name),
        "phoneNorm": normalize_phone(&identity.phone),
        "birthNorm": normalize_birth(&identity.birth_date),
        "primaryRole": row.split.primary_role,
    });
    let payload = HoldPayload {
        row: row.row.clone(),
        split: row.split.clone(),
    };
    let reason_code = row.hold_reason.map(|r| r.code()).unwrap_or("HOLD");
    Ok(HoldRecord {
        file_hash: file.file_hash.clone(),
        row_no: row.row_no,
        filename: file.filename.clone(),
        reason_code: reason_code.to_string(),
        reason_msg: row.message.clone(),
        raw_json: serde_json::to_string(&row.row)?,
        normalized_json: normalized.to_string(),
        candidates_json: serde_json::to_string(&row.candidates)?,
        row_payload_json: serde_json::to_string(&payload)?,
    })
}
