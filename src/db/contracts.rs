use super::*;
use crate::corporate::normalize_org_name;
use crate::hashing::ContractHashes;

const CONTRACT_COLUMNS: &str = "id, customer_id, company, product_name, policy_no, policy_no_norm,
     premium, status, start_date, end_date, coverage_summary, insured_name, insured_phone,
     insured_birth, insured_gender, policyholder_name, policyholder_type, policyholder_norm,
     policyholder_phone, primary_role, key_hash, stable_hash, content_hash, created_at, updated_at";

impl CrmDb {
    // =========================================================================
    // Contracts: identity lookups
    // =========================================================================

    pub fn contract_by_key_hash(&self, key_hash: &str) -> Result<Option<ContractIdentity>, DbError> {
        let mut out = self.query_identities(
            "WHERE key_hash = ?1 LIMIT 1",
            params![key_hash],
        )?;
        Ok(out.pop())
    }

    /// Contracts of `customer_id` carrying the normalized policy number.
    pub fn contracts_by_policy(
        &self,
        customer_id: i64,
        policy_no_norm: &str,
    ) -> Result<Vec<ContractIdentity>, DbError> {
        if policy_no_norm.is_empty() {
            return Ok(Vec::new());
        }
        self.query_identities(
            "WHERE customer_id = ?1 AND policy_no_norm = ?2 ORDER BY id ASC LIMIT 5",
            params![customer_id, policy_no_norm],
        )
    }

    pub fn contracts_by_stable_hash(
        &self,
        customer_id: i64,
        stable_hash: &str,
    ) -> Result<Vec<ContractIdentity>, DbError> {
        self.query_identities(
            "WHERE customer_id = ?1 AND stable_hash = ?2 ORDER BY id ASC LIMIT 10",
            params![customer_id, stable_hash],
        )
    }

    /// Contracts anywhere in the store with this policy number that belong
    /// to a customer other than `customer_id` (any customer when `None`).
    pub fn policy_on_other_customers(
        &self,
        customer_id: Option<i64>,
        policy_no_norm: &str,
    ) -> Result<Vec<ContractIdentity>, DbError> {
        if policy_no_norm.is_empty() {
            return Ok(Vec::new());
        }
        self.query_identities(
            "WHERE policy_no_norm = ?1 AND customer_id <> ?2 ORDER BY id ASC LIMIT 10",
            params![policy_no_norm, customer_id.unwrap_or(-1)],
        )
    }

    fn query_identities(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ContractIdentity>, DbError> {
        let sql = format!(
            "SELECT id, customer_id, COALESCE(content_hash, ''), COALESCE(key_hash, ''),
                    COALESCE(policy_no_norm, '')
             FROM contracts {}",
            clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(ContractIdentity {
                id: row.get(0)?,
                customer_id: row.get(1)?,
                content_hash: row.get(2)?,
                key_hash: row.get(3)?,
                policy_no_norm: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Contracts: writes
    // =========================================================================

    pub fn insert_contract(
        &self,
        customer_id: i64,
        draft: &ContractDraft,
        hashes: &ContractHashes,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO contracts (customer_id, company, product_name, policy_no, policy_no_norm,
                    premium, status, start_date, end_date, coverage_summary, insured_name,
                    insured_phone, insured_birth, insured_gender, policyholder_name,
                    policyholder_type, policyholder_norm, policyholder_phone, primary_role,
                    key_hash, stable_hash, content_hash, origin_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?22)",
            params![
                customer_id,
                draft.company,
                draft.product_name,
                draft.policy_no,
                draft.policy_no_norm,
                draft.premium,
                draft.status,
                draft.start_date,
                draft.end_date,
                draft.coverage_summary,
                draft.insured_name,
                draft.insured_phone,
                draft.insured_birth,
                draft.insured_gender,
                draft.policyholder.name,
                draft.policyholder.party_type.as_str(),
                draft.policyholder.org_key,
                draft.policyholder.phone,
                draft.primary_role.as_str(),
                hashes.key_hash,
                hashes.stable_hash,
                hashes.content_hash,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Overwrite every business field of contract `id` and refresh its hashes.
    ///
    /// With `replace_key` false the stored `key_hash` is kept; the caller
    /// uses that after the new key collided with another row.
    pub fn update_contract(
        &self,
        id: i64,
        draft: &ContractDraft,
        hashes: &ContractHashes,
        replace_key: bool,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE contracts SET
                company = ?1, product_name = ?2, policy_no = ?3, policy_no_norm = ?4,
                premium = ?5, status = ?6, start_date = ?7, end_date = ?8,
                coverage_summary = ?9, insured_name = ?10, insured_phone = ?11,
                insured_birth = ?12, insured_gender = ?13, policyholder_name = ?14,
                policyholder_type = ?15, policyholder_norm = ?16, policyholder_phone = ?17,
                primary_role = ?18, stable_hash = ?19, content_hash = ?20,
                key_hash = CASE WHEN ?21 THEN ?22 ELSE key_hash END,
                updated_at = datetime('now')
             WHERE id = ?23",
            params![
                draft.company,
                draft.product_name,
                draft.policy_no,
                draft.policy_no_norm,
                draft.premium,
                draft.status,
                draft.start_date,
                draft.end_date,
                draft.coverage_summary,
                draft.insured_name,
                draft.insured_phone,
                draft.insured_birth,
                draft.insured_gender,
                draft.policyholder.name,
                draft.policyholder.party_type.as_str(),
                draft.policyholder.org_key,
                draft.policyholder.phone,
                draft.primary_role.as_str(),
                hashes.stable_hash,
                hashes.content_hash,
                replace_key,
                hashes.key_hash,
                id,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Contracts: views
    // =========================================================================

    pub fn get_contract(&self, id: i64) -> Result<Option<DbContract>, DbError> {
        let sql = format!("SELECT {} FROM contracts WHERE id = ?1", CONTRACT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::map_contract_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All contracts of a customer, newest start date first.
    pub fn customer_contracts(&self, customer_id: i64) -> Result<Vec<DbContract>, DbError> {
        let sql = format!(
            "SELECT {} FROM contracts WHERE customer_id = ?1
             ORDER BY COALESCE(start_date, '') DESC, id DESC",
            CONTRACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![customer_id], Self::map_contract_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Contracts held by organizations whose key contains the query's key.
    pub fn search_corporate_contracts(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<CorporateContract>, DbError> {
        let key = normalize_org_name(query);
        let columns = CONTRACT_COLUMNS
            .split(',')
            .map(|c| format!("ct.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {}, cu.name, cu.phone
             FROM contracts ct
             JOIN customers cu ON cu.id = ct.customer_id
             WHERE ct.policyholder_type = 'CORP'
               AND COALESCE(ct.policyholder_norm, '') LIKE '%' || ?1 || '%'
             ORDER BY ct.policyholder_norm ASC, ct.id DESC
             LIMIT ?2",
            columns
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![key, limit], |row| {
            Ok(CorporateContract {
                contract: Self::map_contract_row(row)?,
                customer_name: row.get(25)?,
                customer_phone: row.get(26)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Helper: map a row to `DbContract`.
    fn map_contract_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbContract> {
        Ok(DbContract {
            id: row.get(0)?,
            customer_id: row.get(1)?,
            company: row.get(2)?,
            product_name: row.get(3)?,
            policy_no: row.get(4)?,
            policy_no_norm: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            premium: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
            status: row.get(7)?,
            start_date: row.get(8)?,
            end_date: row.get(9)?,
            coverage_summary: row.get(10)?,
            insured_name: row.get(11)?,
            insured_phone: row.get(12)?,
            insured_birth: row.get(13)?,
            insured_gender: row.get(14)?,
            policyholder_name: row.get(15)?,
            policyholder_type: row.get(16)?,
            policyholder_norm: row.get(17)?,
            policyholder_phone: row.get(18)?,
            primary_role: row.get(19)?,
            key_hash: row.get(20)?,
            stable_hash: row.get(21)?,
            content_hash: row.get(22)?,
            created_at: row.get(23)?,
            updated_at: row.get(24)?,
        })
    }
}
