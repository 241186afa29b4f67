use rusqlite::types::Value;
use rusqlite::OptionalExtension;

use super::*;

const HOLD_COLUMNS: &str = "id, file_hash, row_no, filename, reason_code, reason_msg, status,
     raw_json, normalized_json, corrected_json, candidates_json, row_payload_json,
     created_at, updated_at";

/// Default page size for hold listings.
const DEFAULT_HOLD_LIMIT: u32 = 500;

impl CrmDb {
    // =========================================================================
    // Upload holds
    // =========================================================================

    pub fn get_hold(&self, id: i64) -> Result<Option<DbHold>, DbError> {
        let sql = format!("SELECT {} FROM upload_holds WHERE id = ?1", HOLD_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::map_hold_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn hold_by_file_row(&self, file_hash: &str, row_no: u32) -> Result<Option<DbHold>, DbError> {
        let sql = format!(
            "SELECT {} FROM upload_holds WHERE file_hash = ?1 AND row_no = ?2",
            HOLD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![file_hash, row_no], Self::map_hold_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Insert a new OPEN hold. Fails on a duplicate (file, row).
    pub fn insert_hold(&self, record: &HoldRecord) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO upload_holds (file_hash, row_no, filename, reason_code, reason_msg,
                    status, raw_json, normalized_json, corrected_json, candidates_json,
                    row_payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, 'OPEN', ?6, ?7, '', ?8, ?9)",
            params![
                record.file_hash,
                record.row_no,
                record.filename,
                record.reason_code,
                record.reason_msg,
                record.raw_json,
                record.normalized_json,
                record.candidates_json,
                record.row_payload_json,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Refresh the snapshots of an existing hold. Status and any operator
    /// correction are left alone.
    pub fn refresh_hold(&self, id: i64, record: &HoldRecord) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE upload_holds SET
                filename = ?1, reason_code = ?2, reason_msg = ?3, raw_json = ?4,
                normalized_json = ?5, candidates_json = ?6, row_payload_json = ?7,
                updated_at = datetime('now')
             WHERE id = ?8",
            params![
                record.filename,
                record.reason_code,
                record.reason_msg,
                record.raw_json,
                record.normalized_json,
                record.candidates_json,
                record.row_payload_json,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn set_hold_status(&self, id: i64, status: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE upload_holds SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    pub fn set_hold_reason(&self, id: i64, reason_code: &str, reason_msg: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE upload_holds SET reason_code = ?1, reason_msg = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![reason_code, reason_msg, id],
        )?;
        Ok(())
    }

    pub fn set_hold_correction(
        &self,
        id: i64,
        corrected_json: &str,
        candidates_json: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE upload_holds SET corrected_json = ?1, candidates_json = ?2,
                    updated_at = datetime('now')
             WHERE id = ?3",
            params![corrected_json, candidates_json, id],
        )?;
        Ok(())
    }

    /// Filtered listing, most recently touched first.
    pub fn list_holds(&self, filter: &HoldFilter) -> Result<Vec<DbHold>, DbError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            clauses.push(format!("status IN ({})", marks));
            values.extend(filter.statuses.iter().map(|s| Value::Text(s.to_uppercase())));
        }
        if !filter.reason_codes.is_empty() {
            let marks = vec!["?"; filter.reason_codes.len()].join(", ");
            clauses.push(format!("reason_code IN ({})", marks));
            values.extend(filter.reason_codes.iter().map(|s| Value::Text(s.clone())));
        }
        if let Some(file_hash) = filter.file_hash.as_deref().filter(|s| !s.is_empty()) {
            clauses.push("file_hash = ?".to_string());
            values.push(Value::Text(file_hash.to_string()));
        }
        if let Some(keyword) = filter.keyword.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            clauses.push(
                "(COALESCE(filename, '') LIKE ? OR raw_json LIKE ? OR normalized_json LIKE ?
                  OR corrected_json LIKE ? OR reason_msg LIKE ?)"
                    .to_string(),
            );
            let pattern = format!("%{}%", keyword);
            for _ in 0..5 {
                values.push(Value::Text(pattern.clone()));
            }
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Value::Integer(i64::from(filter.limit.unwrap_or(DEFAULT_HOLD_LIMIT))));
        values.push(Value::Integer(i64::from(filter.offset.unwrap_or(0))));

        let sql = format!(
            "SELECT {} FROM upload_holds {} ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
            HOLD_COLUMNS, where_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), Self::map_hold_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Hold counts grouped by uploaded file, most recent first.
    pub fn list_hold_batches(&self, limit: u32) -> Result<Vec<HoldBatch>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT file_hash, MAX(filename), COUNT(*),
                    SUM(CASE WHEN status = 'OPEN' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'RESOLVED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'SKIPPED' THEN 1 ELSE 0 END),
                    MAX(updated_at)
             FROM upload_holds
             GROUP BY file_hash
             ORDER BY MAX(updated_at) DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(HoldBatch {
                file_hash: row.get(0)?,
                filename: row.get(1)?,
                total: row.get(2)?,
                open: row.get(3)?,
                resolved: row.get(4)?,
                skipped: row.get(5)?,
                last_updated: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Distinct reason codes currently present in the store.
    pub fn hold_reason_codes(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT reason_code FROM upload_holds ORDER BY reason_code ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Decision trail (append-only)
    // =========================================================================

    pub fn insert_hold_decision(
        &self,
        hold_id: i64,
        decision: &str,
        target_customer_id: Option<i64>,
        decision_json: &serde_json::Value,
        decided_by: &str,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO hold_decisions (hold_id, decision, target_customer_id, decision_json, decided_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![hold_id, decision, target_customer_id, decision_json.to_string(), decided_by],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_approval_proof(
        &self,
        hold_id: i64,
        approval: &str,
        approval_json: &serde_json::Value,
        approved_by: &str,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO approval_proofs (hold_id, approval, approval_json, approved_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![hold_id, approval, approval_json.to_string(), approved_by],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_audit_log(
        &self,
        event_type: &str,
        hold_id: Option<i64>,
        ref_table: &str,
        ref_id: Option<i64>,
        payload: &serde_json::Value,
        actor: &str,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO audit_logs (event_type, hold_id, ref_table, ref_id, payload_json, actor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![event_type, hold_id, ref_table, ref_id, payload.to_string(), actor],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Customer created by an earlier CREATE_NEW on this hold, if it still
    /// exists.
    pub fn customer_created_for_hold(&self, hold_id: i64) -> Result<Option<i64>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT d.target_customer_id FROM hold_decisions d
                 JOIN customers c ON c.id = d.target_customer_id
                 WHERE d.hold_id = ?1 AND d.decision = 'CREATE_NEW'
                 ORDER BY d.id ASC LIMIT 1",
                params![hold_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Number of decision-trail rows recorded for a hold:
    /// (decisions, approval proofs, audit entries).
    pub fn hold_trail_counts(&self, hold_id: i64) -> Result<(i64, i64, i64), DbError> {
        let count = |table: &str| -> Result<i64, DbError> {
            Ok(self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE hold_id = ?1", table),
                params![hold_id],
                |row| row.get(0),
            )?)
        };
        Ok((
            count("hold_decisions")?,
            count("approval_proofs")?,
            count("audit_logs")?,
        ))
    }

    /// Helper: map a row to `DbHold`.
    fn map_hold_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbHold> {
        Ok(DbHold {
            id: row.get(0)?,
            file_hash: row.get(1)?,
            row_no: row.get(2)?,
            filename: row.get(3)?,
            reason_code: row.get(4)?,
            reason_msg: row.get(5)?,
            status: row.get(6)?,
            raw_json: row.get(7)?,
            normalized_json: row.get(8)?,
            corrected_json: row.get(9)?,
            candidates_json: row.get(10)?,
            row_payload_json: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}
