//! Batch import orchestration.
//!
//! `analyze` classifies every row of an upload without writing anything.
//! `apply` then writes row by row, each row in its own transaction, so one
//! bad row never takes the batch down with it.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::json;

use crate::contract_match::{ContractAction, ContractReconciler, Reconciled};
use crate::corporate::CorporateClassifier;
use crate::db::{CrmDb, CustomerCandidate, CustomerFields, DbError};
use crate::error::ImportError;
use crate::holds::{Correction, Decision, DecisionOutcome, HoldPayload, HoldStatus, HoldStore};
use crate::identity::{usable_phone, CustomerResolution, IdentityResolver};
use crate::normalize::{field, normalize_name_for_key};
use crate::reason::HoldReason;
use crate::roles::{split_roles, RoleSplit};
use crate::types::{ContractDraft, IdentityFields, ImportRow, PrimaryRole, UploadFile};

const CANDIDATE_LIMIT: usize = 20;

/// Row classification shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    New,
    Update,
    Same,
    Hold,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowAnalysis {
    pub row_no: u32,
    pub row: ImportRow,
    pub split: RoleSplit,
    pub customer: CustomerResolution,
    /// Contract preview; `None` when the row has no contract or its
    /// customer is not yet known.
    pub contract: Option<ContractAction>,
    pub status: RowStatus,
    pub hold_reason: Option<HoldReason>,
    pub message: String,
    pub candidates: Vec<CustomerCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub total: usize,
    pub new: usize,
    pub update: usize,
    pub same: usize,
    pub hold: usize,
    pub fail: usize,
    pub hold_reasons: BTreeMap<String, usize>,
}

impl AnalysisSummary {
    fn from_rows(rows: &[RowAnalysis]) -> Self {
        let mut summary = AnalysisSummary {
            total: rows.len(),
            ..Default::default()
        };
        for row in rows {
            match row.status {
                RowStatus::New => summary.new += 1,
                RowStatus::Update => summary.update += 1,
                RowStatus::Same => summary.same += 1,
                RowStatus::Hold => summary.hold += 1,
                RowStatus::Fail => summary.fail += 1,
            }
            if let Some(reason) = row.hold_reason {
                *summary.hold_reasons.entry(reason.code().to_string()).or_insert(0) += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub file: UploadFile,
    pub rows: Vec<RowAnalysis>,
    pub summary: AnalysisSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Write rows that change an existing customer or contract.
    pub apply_updates: bool,
    /// Re-run reconciliation for rows previewed as unchanged.
    pub verify_same: bool,
    /// Attempt contracts previewed as ambiguous instead of leaving them held.
    pub force_holds: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            apply_updates: true,
            verify_same: false,
            force_holds: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    pub row_no: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyStats {
    pub new_customers: usize,
    pub updated_customers: usize,
    pub new_contracts: usize,
    pub updated_contracts: usize,
    pub same_contracts: usize,
    pub ambiguous_contracts: usize,
    pub resolved_holds: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl ApplyStats {
    fn absorb(&mut self, other: ApplyStats) {
        self.new_customers += other.new_customers;
        self.updated_customers += other.updated_customers;
        self.new_contracts += other.new_contracts;
        self.updated_contracts += other.updated_contracts;
        self.same_contracts += other.same_contracts;
        self.ambiguous_contracts += other.ambiguous_contracts;
        self.resolved_holds += other.resolved_holds;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }

    fn fail(&mut self, row_no: u32, message: impl Into<String>) {
        self.failed += 1;
        self.failures.push(RowFailure {
            row_no,
            message: message.into(),
        });
    }

    fn count_contract(&mut self, row_no: u32, reconciled: &Reconciled) {
        match &reconciled.action {
            ContractAction::Insert => self.new_contracts += 1,
            ContractAction::Update { .. } => self.updated_contracts += 1,
            ContractAction::Same { .. } => self.same_contracts += 1,
            ContractAction::Ambiguous { .. } => self.ambiguous_contracts += 1,
            ContractAction::Fail { message } => self.fail(row_no, message.clone()),
        }
    }

    fn count_decision(&mut self, row_no: u32, outcome: &DecisionOutcome) {
        match outcome.decision {
            Decision::Skip => self.skipped += 1,
            Decision::CreateNew if outcome.customer_created => self.new_customers += 1,
            Decision::CreateNew => {}
            Decision::MapExisting { .. } => self.updated_customers += 1,
        }
        if let Some(contract) = &outcome.contract {
            self.count_contract(row_no, contract);
        }
        if outcome.status == HoldStatus::Resolved {
            self.resolved_holds += 1;
        }
    }
}

/// Progress of a running apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyProgress {
    pub done: usize,
    pub total: usize,
    pub row_no: u32,
}

/// Customer columns for a row whose identity has been chosen.
///
/// The upstream match key describes the contract holder, so it is only
/// carried when the holder is the customer.
pub fn customer_fields(
    row: &ImportRow,
    identity: &IdentityFields,
    role: PrimaryRole,
    source: &str,
) -> Result<CustomerFields, DbError> {
    let text = |v: &Option<String>| field(v).trim().to_string();
    let custom_data = if row.custom_data.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&row.custom_data)?
    };
    Ok(CustomerFields {
        name: identity.name.trim().to_string(),
        phone: identity.phone.trim().to_string(),
        birth_date: identity.birth_date.trim().to_string(),
        gender: identity.gender.trim().to_string(),
        region: text(&row.region),
        address: text(&row.address),
        email: text(&row.email),
        source: source.to_string(),
        memo: text(&row.memo),
        custom_data,
        match_key: match role {
            PrimaryRole::Policyholder => text(&row.match_key),
            PrimaryRole::Insured => String::new(),
        },
    })
}

pub struct Importer<'a> {
    db: &'a CrmDb,
    classifier: &'a dyn CorporateClassifier,
    actor: &'a str,
}

impl<'a> Importer<'a> {
    pub fn new(db: &'a CrmDb, classifier: &'a dyn CorporateClassifier, actor: &'a str) -> Self {
        Self {
            db,
            classifier,
            actor,
        }
    }

    // =========================================================================
    // Analyze
    // =========================================================================

    /// Classify every row against the current store. Read-only.
    pub fn analyze(&self, file: &UploadFile, rows: Vec<ImportRow>) -> Result<Analysis, ImportError> {
        let resolver = IdentityResolver::new(self.db);
        let reconciler = ContractReconciler::new(self.db);

        let mut analyzed = Vec::with_capacity(rows.len());
        for row in rows {
            let split = split_roles(&row, self.classifier);
            let hint = match split.primary_role {
                PrimaryRole::Policyholder => field(&row.match_key).trim().to_string(),
                PrimaryRole::Insured => String::new(),
            };
            let customer = resolver.resolve(&split.identity, &hint)?;

            let contract = match row.contract() {
                Some(fin) => {
                    let draft = ContractDraft::new(fin, split.policyholder.clone(), split.primary_role);
                    match &customer {
                        CustomerResolution::Update { customer_id } => {
                            Some(reconciler.classify(Some(*customer_id), &draft)?)
                        }
                        CustomerResolution::New => Some(reconciler.classify(None, &draft)?),
                        _ => None,
                    }
                }
                None => None,
            };

            analyzed.push(classify_row(row, split, customer, contract));
        }

        self.escalate_file_conflicts(&mut analyzed);

        for row in analyzed.iter_mut() {
            if row.status == RowStatus::Hold && row.candidates.is_empty() {
                let id = &row.split.identity;
                row.candidates =
                    self.db
                        .find_candidates(&id.name, &id.phone, &id.birth_date, CANDIDATE_LIMIT)?;
            }
        }

        let summary = AnalysisSummary::from_rows(&analyzed);
        log::info!(
            "Analyzed {}: {} rows, {} new, {} update, {} same, {} hold, {} fail",
            file.filename,
            summary.total,
            summary.new,
            summary.update,
            summary.same,
            summary.hold,
            summary.fail
        );
        Ok(Analysis {
            file: file.clone(),
            rows: analyzed,
            summary,
        })
    }

    /// Analyze, then persist held rows to the hold store.
    pub fn analyze_and_sync(
        &self,
        file: &UploadFile,
        rows: Vec<ImportRow>,
    ) -> Result<(Analysis, usize), ImportError> {
        let analysis = self.analyze(file, rows)?;
        let synced = HoldStore::new(self.db, self.actor).sync(&analysis)?;
        self.db
            .record_upload(file, "analyze", &serde_json::to_value(&analysis.summary).map_err(DbError::from)?)?;
        Ok((analysis, synced))
    }

    /// The same phone under two different names inside one upload: every
    /// non-failed row of that phone goes to HOLD. Rows already held keep
    /// their reason.
    fn escalate_file_conflicts(&self, rows: &mut [RowAnalysis]) {
        let mut names_by_phone: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows.iter() {
            if let Some(phone) = usable_phone(&row.split.identity.phone) {
                let name = normalize_name_for_key(&row.split.identity.name);
                let names = names_by_phone.entry(phone).or_default();
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        for row in rows.iter_mut() {
            if row.status == RowStatus::Fail {
                continue;
            }
            let conflicted = usable_phone(&row.split.identity.phone)
                .and_then(|p| names_by_phone.get(&p))
                .map_or(false, |names| names.len() > 1);
            if !conflicted {
                continue;
            }
            log::warn!("Row {}: phone used under several names in this file", row.row_no);
            if !row.customer.is_hold() {
                row.customer = CustomerResolution::Hold {
                    reason: HoldReason::PhoneNameConflictFile,
                    candidates: Vec::new(),
                };
            }
            if row.status != RowStatus::Hold {
                row.status = RowStatus::Hold;
                row.hold_reason = Some(HoldReason::PhoneNameConflictFile);
                row.message = HoldReason::PhoneNameConflictFile.message().to_string();
            }
        }
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Write an analyzed batch.
    ///
    /// `decisions` settles customer-held rows by row number; held rows
    /// without one are skipped and stay in the hold store. A row that errors
    /// is rolled back and reported in `failures`.
    pub fn apply(
        &self,
        analysis: &Analysis,
        decisions: &HashMap<u32, Decision>,
        options: &ApplyOptions,
        progress: &mut dyn FnMut(&ApplyProgress),
    ) -> Result<ApplyStats, ImportError> {
        let total = analysis.rows.len();
        let mut stats = ApplyStats::default();

        for (idx, row) in analysis.rows.iter().enumerate() {
            let decision = decisions.get(&row.row_no).copied();
            let result = self.db.with_transaction(|db| {
                self.apply_row(db, &analysis.file, row, decision, options)
            });
            match result {
                Ok(tally) => stats.absorb(tally),
                Err(e) => {
                    log::warn!("Row {} rolled back: {}", row.row_no, e);
                    stats.fail(row.row_no, e.to_string());
                }
            }
            progress(&ApplyProgress {
                done: idx + 1,
                total,
                row_no: row.row_no,
            });
        }

        self.db.record_upload(
            &analysis.file,
            "apply",
            &serde_json::to_value(&stats).map_err(DbError::from)?,
        )?;
        log::info!(
            "Applied {}: customers +{} ~{}, contracts +{} ~{} ={} ?{}, skipped {}, failed {}",
            analysis.file.filename,
            stats.new_customers,
            stats.updated_customers,
            stats.new_contracts,
            stats.updated_contracts,
            stats.same_contracts,
            stats.ambiguous_contracts,
            stats.skipped,
            stats.failed
        );
        Ok(stats)
    }

    fn apply_row(
        &self,
        db: &CrmDb,
        file: &UploadFile,
        row: &RowAnalysis,
        decision: Option<Decision>,
        options: &ApplyOptions,
    ) -> Result<ApplyStats, ImportError> {
        let mut tally = ApplyStats::default();

        if row.status == RowStatus::Fail {
            tally.fail(row.row_no, row.message.clone());
            return Ok(tally);
        }

        if row.customer.is_hold() {
            let store = HoldStore::new(db, self.actor);
            let existing = db.hold_by_file_row(&file.file_hash, row.row_no)?;
            if existing
                .as_ref()
                .map_or(false, |h| h.status == HoldStatus::Resolved.as_str())
            {
                tally.skipped += 1;
                return Ok(tally);
            }
            let decision = match decision {
                Some(d) => d,
                None => {
                    tally.skipped += 1;
                    return Ok(tally);
                }
            };
            // Every decision is recorded against a stored hold
            let hold = match existing {
                Some(h) => h,
                None => store.open_hold(file, row)?,
            };
            let correction = Correction::decode(&hold.corrected_json);
            let payload = HoldPayload {
                row: row.row.clone(),
                split: row.split.clone(),
            };
            let outcome = store.execute(&hold, &payload, &correction, decision, "upload_apply")?;
            tally.count_decision(row.row_no, &outcome);
            return Ok(tally);
        }

        if row.status == RowStatus::Update && !options.apply_updates {
            tally.skipped += 1;
            return Ok(tally);
        }

        let fields = customer_fields(&row.row, &row.split.identity, row.split.primary_role, "upload")?;
        let (customer_id, inserted) = db.upsert_customer_identity(&fields)?;
        if inserted {
            tally.new_customers += 1;
        } else {
            tally.updated_customers += 1;
        }

        let fin = match row.row.contract() {
            Some(fin) => fin,
            None => return Ok(tally),
        };
        match &row.contract {
            Some(ContractAction::Same { .. }) if !options.verify_same => {
                tally.same_contracts += 1;
                return Ok(tally);
            }
            Some(ContractAction::Update { .. }) if !options.apply_updates => {
                return Ok(tally);
            }
            Some(ContractAction::Ambiguous { .. }) if !options.force_holds => {
                tally.ambiguous_contracts += 1;
                return Ok(tally);
            }
            _ => {}
        }

        let draft = ContractDraft::new(fin, row.split.policyholder.clone(), row.split.primary_role);
        let reconciled = ContractReconciler::new(db).reconcile(customer_id, &draft)?;
        tally.count_contract(row.row_no, &reconciled);

        if row.status == RowStatus::Hold
            && reconciled.action.is_clean()
            && HoldStore::new(db, self.actor).auto_resolve(&file.file_hash, row.row_no, &reconciled)?
        {
            tally.resolved_holds += 1;
        }
        Ok(tally)
    }

    /// Convenience for callers holding an analysis they already synced:
    /// record an explicit SKIP for every open hold of the upload.
    pub fn skip_open_holds(&self, analysis: &Analysis) -> Result<usize, ImportError> {
        let store = HoldStore::new(self.db, self.actor);
        let mut skipped = 0;
        for row in analysis.rows.iter().filter(|r| r.customer.is_hold()) {
            if let Some(hold) = self.db.hold_by_file_row(&analysis.file.file_hash, row.row_no)? {
                if hold.status == HoldStatus::Open.as_str() {
                    store.decide(hold.id, Decision::Skip)?;
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            self.db.insert_audit_log(
                "HOLD_BULK_SKIP",
                None,
                "upload_holds",
                None,
                &json!({ "fileHash": analysis.file.file_hash, "count": skipped }),
                self.actor,
            )?;
        }
        Ok(skipped)
    }
}

fn classify_row(
    row: ImportRow,
    split: RoleSplit,
    customer: CustomerResolution,
    contract: Option<ContractAction>,
) -> RowAnalysis {
    let (status, hold_reason, message, candidates) = match (&customer, &contract) {
        (CustomerResolution::Fail { reason }, _) => {
            (RowStatus::Fail, None, reason.message().to_string(), Vec::new())
        }
        (CustomerResolution::Hold { reason, candidates }, _) => (
            RowStatus::Hold,
            Some(*reason),
            reason.message().to_string(),
            candidates.clone(),
        ),
        (_, Some(ContractAction::Ambiguous { reason, detail })) => (
            RowStatus::Hold,
            Some(*reason),
            format!("{} ({})", reason.message(), detail),
            Vec::new(),
        ),
        (_, Some(ContractAction::Fail { message })) => {
            (RowStatus::Fail, None, message.clone(), Vec::new())
        }
        (_, Some(ContractAction::Insert)) => (RowStatus::New, None, "new contract".to_string(), Vec::new()),
        (_, Some(ContractAction::Update { .. })) => {
            (RowStatus::Update, None, "contract changed".to_string(), Vec::new())
        }
        (_, Some(ContractAction::Same { .. })) => {
            (RowStatus::Same, None, "no change".to_string(), Vec::new())
        }
        (CustomerResolution::New, None) => {
            (RowStatus::New, None, customer.reason_message().to_string(), Vec::new())
        }
        (CustomerResolution::Update { .. }, None) => {
            (RowStatus::Update, None, customer.reason_message().to_string(), Vec::new())
        }
    };
    RowAnalysis {
        row_no: row.row_no,
        row,
        split,
        customer,
        contract,
        status,
        hold_reason,
        message,
        candidates,
    }
}
