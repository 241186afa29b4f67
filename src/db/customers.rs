use std::collections::BTreeMap;

use rusqlite::OptionalExtension;

use super::*;
use crate::name_match::is_name_match;
use crate::normalize::{compact_name, phone_last4};

const CUSTOMER_COLUMNS: &str = "id, name, name_norm, phone, phone_norm, birth_date, birth_norm,
     gender, region, address, email, source, memo, custom_data, match_key,
     created_at, updated_at";

impl CrmDb {
    // =========================================================================
    // Customers: writes
    // =========================================================================

    /// Insert-or-merge keyed on normalized phone.
    ///
    /// When a customer with the same `phone_norm` exists (lowest id wins) its
    /// blank columns are filled from `fields`; populated columns are never
    /// blanked. Returns the customer id and whether a row was inserted.
    /// Callers are responsible for having ruled out a name conflict first.
    pub fn upsert_customer_identity(&self, fields: &CustomerFields) -> Result<(i64, bool), DbError> {
        let phone_norm = normalize_phone(&fields.phone);
        if compact_name(&fields.name).is_empty() || phone_norm.is_empty() {
            return Err(DbError::InvalidInput("name and phone are required".into()));
        }

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM customers WHERE phone_norm = ?1 ORDER BY id ASC LIMIT 1",
                params![phone_norm],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.merge_customer(id, fields)?;
                Ok((id, false))
            }
            None => Ok((self.insert_customer(fields)?, true)),
        }
    }

    /// Non-destructive merge into an existing customer.
    pub fn merge_customer(&self, id: i64, fields: &CustomerFields) -> Result<(), DbError> {
        let existing = self
            .get_customer(id)?
            .ok_or_else(|| DbError::InvalidInput(format!("customer {} not found", id)))?;
        let phone_norm = normalize_phone(&fields.phone);
        let key = if existing.match_key.is_empty() {
            Self::derive_match_key(fields)
        } else {
            existing.match_key.clone()
        };
        let custom_data = merge_custom_data(existing.custom_data.as_deref(), &fields.custom_data);

        self.conn.execute(
            "UPDATE customers SET
                phone = CASE WHEN phone_norm = '' AND ?1 <> '' THEN ?2 ELSE phone END,
                phone_norm = CASE WHEN phone_norm = '' THEN ?1 ELSE phone_norm END,
                birth_date = CASE WHEN ?3 <> '' THEN ?3 ELSE birth_date END,
                birth_norm = CASE WHEN ?4 <> '' THEN ?4 ELSE birth_norm END,
                gender = CASE WHEN ?5 <> '' THEN ?5 ELSE gender END,
                region = CASE WHEN ?6 <> '' THEN ?6 ELSE region END,
                address = CASE WHEN ?7 <> '' THEN ?7 ELSE address END,
                email = CASE WHEN ?8 <> '' THEN ?8 ELSE email END,
                memo = CASE WHEN ?9 <> '' THEN ?9 ELSE memo END,
                custom_data = CASE WHEN ?10 <> '' THEN ?10 ELSE custom_data END,
                match_key = ?11,
                updated_at = datetime('now')
             WHERE id = ?12",
            params![
                phone_norm,
                fields.phone.trim(),
                fields.birth_date.trim(),
                normalize_birth(&fields.birth_date),
                fields.gender.trim(),
                fields.region.trim(),
                fields.address.trim(),
                fields.email.trim(),
                fields.memo.trim(),
                custom_data,
                key,
                id
            ],
        )?;
        Ok(())
    }

    /// Plain insert. No phone dedupe happens here.
    pub fn insert_customer(&self, fields: &CustomerFields) -> Result<i64, DbError> {
        let name = compact_name(&fields.name);
        if name.is_empty() {
            return Err(DbError::InvalidInput("name is required".into()));
        }
        self.conn.execute(
            "INSERT INTO customers (name, name_norm, phone, phone_norm, birth_date, birth_norm,
                                    gender, region, address, email, source, memo, custom_data,
                                    match_key, origin_hash, stable_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                name,
                normalize_name_for_key(&name),
                fields.phone.trim(),
                normalize_phone(&fields.phone),
                fields.birth_date.trim(),
                normalize_birth(&fields.birth_date),
                fields.gender.trim(),
                fields.region.trim(),
                fields.address.trim(),
                fields.email.trim(),
                fields.source.trim(),
                fields.memo.trim(),
                fields.custom_data,
                Self::derive_match_key(fields),
                customer_stable_hash(&name, &fields.phone, &fields.birth_date),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Create a customer without the phone-based dedupe of
    /// [`upsert_customer_identity`](Self::upsert_customer_identity).
    ///
    /// Used when an operator has judged a held row to be a distinct person.
    /// The creation is audited against the `customers` table.
    pub fn create_customer_unconditionally(
        &self,
        fields: &CustomerFields,
        hold_id: Option<i64>,
        actor: &str,
    ) -> Result<i64, DbError> {
        let id = self.insert_customer(fields)?;
        let payload = serde_json::json!({
            "name": compact_name(&fields.name),
            "phoneNorm": normalize_phone(&fields.phone),
            "source": fields.source,
        });
        self.insert_audit_log("CUSTOMER_CREATE_DIRECT", hold_id, "customers", Some(id), &payload, actor)?;
        log::info!("Customer {} created without phone dedupe", id);
        Ok(id)
    }

    fn derive_match_key(fields: &CustomerFields) -> String {
        let upstream = normalize_match_key(&fields.match_key);
        if !upstream.is_empty() {
            return upstream;
        }
        match_key(&fields.name, &fields.phone)
    }

    // =========================================================================
    // Customers: lookups
    // =========================================================================

    pub fn get_customer(&self, id: i64) -> Result<Option<DbCustomer>, DbError> {
        let sql = format!("SELECT {} FROM customers WHERE id = ?1", CUSTOMER_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::map_customer_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn customers_by_phone(&self, phone_norm: &str) -> Result<Vec<DbCustomer>, DbError> {
        if phone_norm.is_empty() {
            return Ok(Vec::new());
        }
        self.query_customers(
            "WHERE phone_norm = ?1 ORDER BY id ASC LIMIT 20",
            params![phone_norm],
        )
    }

    pub fn customers_by_match_key(&self, key: &str) -> Result<Vec<DbCustomer>, DbError> {
        if key.is_empty() {
            return Ok(Vec::new());
        }
        self.query_customers("WHERE match_key = ?1 ORDER BY id ASC LIMIT 50", params![key])
    }

    /// Customers with the same name key and birth date. An empty birth date
    /// matches on name alone.
    pub fn customers_by_name_birth(
        &self,
        name_norm: &str,
        birth_norm: &str,
    ) -> Result<Vec<DbCustomer>, DbError> {
        if name_norm.is_empty() {
            return Ok(Vec::new());
        }
        if birth_norm.is_empty() {
            return self.query_customers(
                "WHERE name_norm = ?1 ORDER BY id ASC LIMIT 20",
                params![name_norm],
            );
        }
        self.query_customers(
            "WHERE name_norm = ?1 AND birth_norm = ?2 ORDER BY id ASC LIMIT 20",
            params![name_norm, birth_norm],
        )
    }

    /// Customers with the same name key whose phone ends in `last4`.
    pub fn customers_by_name_last4(
        &self,
        name_norm: &str,
        last4: &str,
    ) -> Result<Vec<DbCustomer>, DbError> {
        if name_norm.is_empty() || last4.len() != 4 {
            return Ok(Vec::new());
        }
        self.query_customers(
            "WHERE name_norm = ?1 AND substr(phone_norm, -4) = ?2 ORDER BY id ASC LIMIT 20",
            params![name_norm, last4],
        )
    }

    /// Scored candidate list for a row an operator has to adjudicate.
    ///
    /// Exact phone scores 100, name + birth 80, a verified match-key hit 70.
    /// Each customer appears once with its best score; ties go to the newer
    /// customer.
    pub fn find_candidates(
        &self,
        name: &str,
        phone: &str,
        birth_date: &str,
        limit: usize,
    ) -> Result<Vec<CustomerCandidate>, DbError> {
        let name_norm = normalize_name_for_key(name);
        let phone_norm = normalize_phone(phone);
        let birth_norm = normalize_birth(birth_date);

        let mut best: BTreeMap<i64, CustomerCandidate> = BTreeMap::new();
        let mut offer = |c: &DbCustomer, score: u32, reason: &str| {
            let entry = best.entry(c.id).or_insert_with(|| CustomerCandidate {
                customer_id: c.id,
                name: c.name.clone(),
                phone: c.phone.clone().unwrap_or_default(),
                birth_date: c.birth_date.clone().unwrap_or_default(),
                score: 0,
                reason: String::new(),
            });
            if score > entry.score {
                entry.score = score;
                entry.reason = reason.to_string();
            }
        };

        for c in self.customers_by_phone(&phone_norm)? {
            offer(&c, 100, "phone");
        }
        if !name_norm.is_empty() && !birth_norm.is_empty() {
            for c in self.customers_by_name_birth(&name_norm, &birth_norm)? {
                offer(&c, 80, "name+birth");
            }
        }
        let key = match_key(name, &phone_last4(phone));
        for c in self.customers_by_match_key(&key)? {
            if is_name_match(&normalize_name_for_key(&c.name), &name_norm) {
                offer(&c, 70, "match_key");
            }
        }

        let mut out: Vec<CustomerCandidate> = best.into_values().collect();
        out.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.customer_id.cmp(&a.customer_id))
        });
        out.truncate(limit);
        Ok(out)
    }

    fn query_customers(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DbCustomer>, DbError> {
        let sql = format!("SELECT {} FROM customers {}", CUSTOMER_COLUMNS, clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, Self::map_customer_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Helper: map a row to `DbCustomer`.
    fn map_customer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbCustomer> {
        Ok(DbCustomer {
            id: row.get(0)?,
            name: row.get(1)?,
            name_norm: row.get(2)?,
            phone: row.get(3)?,
            phone_norm: row.get(4)?,
            birth_date: row.get(5)?,
            birth_norm: row.get(6)?,
            gender: row.get(7)?,
            region: row.get(8)?,
            address: row.get(9)?,
            email: row.get(10)?,
            source: row.get(11)?,
            memo: row.get(12)?,
            custom_data: row.get(13)?,
            match_key: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }
}

/// Merge two custom-data JSON objects; incoming keys win, existing keys
/// absent from the incoming object survive. Non-object input is taken as-is.
fn merge_custom_data(existing: Option<&str>, incoming: &str) -> String {
    let incoming = incoming.trim();
    if incoming.is_empty() {
        return String::new();
    }
    let parse = |s: &str| serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(s).ok();
    match (existing.and_then(parse), parse(incoming)) {
        (Some(mut base), Some(new)) => {
            for (k, v) in new {
                base.insert(k, v);
            }
            serde_json::Value::Object(base).to_string()
        }
        _ => incoming.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn fields(name: &str, phone: &str, birth: &str) -> CustomerFields {
        CustomerFields {
            name: name.into(),
            phone: phone.into(),
            birth_date: birth.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_stores_derived_keys() {
        let db = test_db();
        let id = db
            .insert_customer(&fields("홍 길동", "010-1234-5678", "1980.01.15"))
            .unwrap();
        let c = db.get_customer(id).unwrap().unwrap();
        assert_eq!(c.name, "홍길동");
        assert_eq!(c.name_norm, "홍길동");
        assert_eq!(c.phone_norm, "01012345678");
        assert_eq!(c.birth_norm, "19800115");
        assert_eq!(c.match_key, "홍5678");
    }

    #[test]
    fn test_upsert_merges_without_blanking() {
        let db = test_db();
        let mut first = fields("홍길동", "010-1234-5678", "1980-01-15");
        first.email = "hong@example.com".into();
        let (id, inserted) = db.upsert_customer_identity(&first).unwrap();
        assert!(inserted);

        let mut second = fields("홍길동", "01012345678", "");
        second.region = "서울".into();
        let (id2, inserted) = db.upsert_customer_identity(&second).unwrap();
        assert_eq!(id, id2);
        assert!(!inserted);

        let c = db.get_customer(id).unwrap().unwrap();
        assert_eq!(c.birth_date.as_deref(), Some("1980-01-15"));
        assert_eq!(c.email.as_deref(), Some("hong@example.com"));
        assert_eq!(c.region.as_deref(), Some("서울"));
    }

    #[test]
    fn test_upsert_requires_phone() {
        let db = test_db();
        let err = db.upsert_customer_identity(&fields("홍길동", "", "")).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
    }

    #[test]
    fn test_upsert_lookup_error_is_not_a_miss() {
        let db = test_db();
        db.insert_customer(&fields("홍길동", "010-1234-5678", "")).unwrap();
        db.conn_ref()
            .execute_batch("ALTER TABLE customers RENAME COLUMN phone_norm TO phone_digits")
            .unwrap();
        let err = db
            .upsert_customer_identity(&fields("홍길동", "010-1234-5678", ""))
            .unwrap_err();
        assert!(matches!(err, DbError::Sqlite(_)));
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_upstream_match_key_is_normalized() {
        let db = test_db();
        let mut f = fields("Kim", "010-1111-5678", "");
        f.match_key = " K5678 ".into();
        let id = db.insert_customer(&f).unwrap();
        assert_eq!(db.get_customer(id).unwrap().unwrap().match_key, "k5678");
        let hits = db
            .customers_by_match_key(&match_key("Kim", "010-2222-5678"))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_unconditional_create_ignores_phone_and_audits() {
        let db = test_db();
        let (a, _) = db
            .upsert_customer_identity(&fields("홍길동", "010-1234-5678", ""))
            .unwrap();
        let b = db
            .create_customer_unconditionally(&fields("홍길순", "010-1234-5678", ""), None, "tester")
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(db.customers_by_phone("01012345678").unwrap().len(), 2);

        let (table, actor): (String, String) = db
            .conn_ref()
            .query_row(
                "SELECT ref_table, actor FROM audit_logs WHERE ref_id = ?1",
                params![b],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(table, "customers");
        assert_eq!(actor, "tester");
    }

    #[test]
    fn test_name_birth_lookup_degrades_to_name_only() {
        let db = test_db();
        db.insert_customer(&fields("홍길동", "010-1111-1111", "1980-01-15"))
            .unwrap();
        assert_eq!(db.customers_by_name_birth("홍길동", "19800115").unwrap().len(), 1);
        assert_eq!(db.customers_by_name_birth("홍길동", "19900101").unwrap().len(), 0);
        assert_eq!(db.customers_by_name_birth("홍길동", "").unwrap().len(), 1);
    }

    #[test]
    fn test_name_last4_lookup() {
        let db = test_db();
        db.insert_customer(&fields("홍길동", "010-1111-5678", ""))
            .unwrap();
        assert_eq!(db.customers_by_name_last4("홍길동", "5678").unwrap().len(), 1);
        assert_eq!(db.customers_by_name_last4("홍길동", "0000").unwrap().len(), 0);
    }

    #[test]
    fn test_find_candidates_scores_and_order() {
        let db = test_db();
        let by_phone = db
            .insert_customer(&fields("홍길동", "010-1234-5678", ""))
            .unwrap();
        let by_birth = db
            .insert_customer(&fields("홍길동", "010-9999-0000", "1980-01-15"))
            .unwrap();
        let by_key = db
            .insert_customer(&fields("홍길순", "010-5555-5678", ""))
            .unwrap();

        let out = db
            .find_candidates("홍길동", "010-1234-5678", "19800115", 10)
            .unwrap();
        let ids: Vec<i64> = out.iter().map(|c| c.customer_id).collect();
        assert_eq!(ids, vec![by_phone, by_birth]);
        assert_eq!(out[0].score, 100);
        assert_eq!(out[1].score, 80);
        // 홍길순 shares the match key but fails name verification
        assert!(!ids.contains(&by_key));

        let masked = db.find_candidates("홍*순", "5678", "", 10).unwrap();
        assert_eq!(masked.len(), 1);
        assert_eq!(masked[0].customer_id, by_key);
        assert_eq!(masked[0].score, 70);
    }

    #[test]
    fn test_custom_data_merge() {
        assert_eq!(
            merge_custom_data(Some(r#"{"a":"1","b":"2"}"#), r#"{"b":"3"}"#),
            r#"{"a":"1","b":"3"}"#
        );
        assert_eq!(merge_custom_data(Some(r#"{"a":"1"}"#), ""), "");
        assert_eq!(merge_custom_data(None, r#"{"x":"y"}"#), r#"{"x":"y"}"#);
    }
}
