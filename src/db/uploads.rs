use super::*;
use crate::types::UploadFile;

impl CrmDb {
    // =========================================================================
    // Upload history
    // =========================================================================

    /// Record that `file` went through `action`. Re-recording the same file
    /// and action refreshes the timestamp and summary.
    pub fn record_upload(
        &self,
        file: &UploadFile,
        action: &str,
        summary: &serde_json::Value,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO upload_history (file_hash, action, filename, filesize, summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_hash, action) DO UPDATE SET
                filename = excluded.filename,
                filesize = excluded.filesize,
                summary_json = excluded.summary_json,
                uploaded_at = datetime('now')",
            params![
                file.file_hash,
                action,
                file.filename,
                file.filesize as i64,
                summary.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn find_upload(&self, file_hash: &str, action: &str) -> Result<Option<UploadRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_hash, action, filename, filesize, uploaded_at, summary_json
             FROM upload_history WHERE file_hash = ?1 AND action = ?2",
        )?;
        let mut rows = stmt.query_map(params![file_hash, action], |row| {
            Ok(UploadRecord {
                id: row.get(0)?,
                file_hash: row.get(1)?,
                action: row.get(2)?,
                filename: row.get(3)?,
                filesize: row.get(4)?,
                uploaded_at: row.get(5)?,
                summary_json: row.get(6)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    #[test]
    fn test_upload_history_is_unique_per_action() {
        let db = test_db();
        let file = UploadFile::from_bytes("march.xlsx", b"rows");
        assert!(db.find_upload(&file.file_hash, "apply").unwrap().is_none());

        db.record_upload(&file, "apply", &serde_json::json!({"newContracts": 3}))
            .unwrap();
        db.record_upload(&file, "apply", &serde_json::json!({"newContracts": 0}))
            .unwrap();
        db.record_upload(&file, "masked", &serde_json::json!({}))
            .unwrap();

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM upload_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let rec = db.find_upload(&file.file_hash, "apply").unwrap().unwrap();
        assert_eq!(rec.filename.as_deref(), Some("march.xlsx"));
        assert_eq!(rec.filesize, Some(4));
        assert_eq!(rec.summary_json.as_deref(), Some(r#"{"newContracts":0}"#));
    }
}
