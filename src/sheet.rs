//! Spreadsheet adapter.
//!
//! Reads the first worksheet of an xlsx/xls/ods file and maps free-form
//! Korean/English headers onto `ImportRow` fields. Header recognition is by
//! keyword containment after stripping punctuation, with insured-party
//! headers checked first, then contract-holder headers, then everything
//! else. Resident registration numbers are reduced to birth date and gender
//! on the spot and never leave this module.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Days, NaiveDate};
use regex::Regex;

use crate::error::ImportError;
use crate::normalize::{compact_name, non_blank, normalize_phone};
use crate::types::{FinancialRecord, ImportRow, UploadFile};

/// General header vocabulary, checked in order. The first key whose keyword
/// occurs in the cleaned header wins.
const GENERAL_HEADERS: &[(&str, &[&str])] = &[
    ("common_name", &["고객명", "성명", "이름", "name", "customer"]),
    (
        "common_phone",
        &["연락처", "휴대폰", "전화번호", "핸드폰", "모바일", "hp", "mobile", "휴대전화", "휴대폰번호"],
    ),
    ("rrn", &["주민번호", "주민등록번호", "rrn"]),
    ("birth_date", &["생년월일", "생일", "birth"]),
    ("gender", &["성별", "남여", "gender"]),
    ("region", &["주소", "거주지", "시도", "address"]),
    ("email", &["이메일", "메일", "email", "e-mail"]),
    ("company", &["보험사", "회사", "company", "보험회사"]),
    (
        "product_name",
        &["상품", "보험명", "product", "상품명", "보험상품", "보험상품명", "보장명", "담보명"],
    ),
    (
        "policy_no",
        &["증권번호", "증권", "증서번호", "증번호", "계약번호", "폴리시번호", "policy_no"],
    ),
    (
        "premium",
        &["보험료", "납입", "premium", "월보험료", "보험료(월)", "납입보험료"],
    ),
    ("status", &["상태", "유지", "status", "계약상태"]),
    (
        "start_date",
        &["계약일", "가입일", "시작", "청약", "청약일", "개시일", "보험시작일", "계약개시일"],
    ),
    ("end_date", &["만기", "종료", "end", "만기일", "해지일", "종료일"]),
];

/// Canonical keys that never reach `custom_data`.
const KNOWN_KEYS: &[&str] = &[
    "common_name",
    "common_phone",
    "contractor_name",
    "contractor_phone",
    "rrn",
    "birth_date",
    "gender",
    "region",
    "email",
    "insured_name",
    "insured_phone",
    "insured_rrn",
    "company",
    "product_name",
    "policy_no",
    "premium",
    "status",
    "start_date",
    "end_date",
];

fn re_header_noise() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^가-힣a-zA-Z0-9]").unwrap())
}

fn clean_header(s: &str) -> String {
    re_header_noise().replace_all(s, "").to_lowercase()
}

/// Canonical key for one header, before duplicate handling.
fn classify_header(header: &str) -> Option<&'static str> {
    let clean = clean_header(header);
    if clean.is_empty() {
        return None;
    }
    if clean.contains("피보험자") || clean.contains("insured") {
        return Some(if clean.contains("성명") || clean.contains("이름") {
            "insured_name"
        } else if clean.contains("연락처") || clean.contains("휴대폰") {
            "insured_phone"
        } else if clean.contains("주민") {
            "insured_rrn"
        } else {
            "insured_name"
        });
    }
    if clean.contains("계약자") || clean.contains("contractor") {
        return Some(if clean.contains("연락처") || clean.contains("휴대폰") {
            "contractor_phone"
        } else {
            "contractor_name"
        });
    }
    GENERAL_HEADERS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| clean.contains(&clean_header(k))))
        .map(|(key, _)| *key)
}

/// Canonical key per column. The first column mapped to a key keeps it; a
/// second phone column becomes `company_phone`, any other repeat is left
/// unmapped (and lands in `custom_data` under its own header).
pub fn map_headers(headers: &[String]) -> Vec<Option<&'static str>> {
    let mut taken: HashSet<&'static str> = HashSet::new();
    headers
        .iter()
        .map(|h| {
            let key = classify_header(h)?;
            if taken.insert(key) {
                return Some(key);
            }
            if key == "common_phone" && taken.insert("company_phone") {
                return Some("company_phone");
            }
            None
        })
        .collect()
}

/// Birth date (`YYYY-MM-DD`) and gender (`남`/`여`) from a resident
/// registration number. Needs at least the first seven digits.
pub fn parse_rrn(rrn: &str) -> Option<(String, String)> {
    let digits = normalize_phone(rrn);
    if digits.len() < 7 {
        return None;
    }
    let code = digits[6..7].parse::<u32>().ok()?;
    let century = match code {
        1 | 2 | 5 | 6 => "19",
        3 | 4 | 7 | 8 => "20",
        _ => return None,
    };
    let birth = format!(
        "{}{}-{}-{}",
        century,
        &digits[0..2],
        &digits[2..4],
        &digits[4..6]
    );
    let gender = if code % 2 == 1 { "남" } else { "여" };
    Some((birth, gender.to_string()))
}

/// `010-XXXX-XXXX` for 11-digit mobile numbers; anything else unchanged.
pub fn format_phone(raw: &str) -> String {
    let digits = normalize_phone(raw);
    if digits.len() == 11 && digits.starts_with("010") {
        return format!("{}-{}-{}", &digits[..3], &digits[3..7], &digits[7..]);
    }
    raw.trim().to_string()
}

/// Turn a header row plus data rows into import rows.
///
/// Row numbers are spreadsheet row numbers (the header is row 1). Rows
/// without any name are dropped.
pub fn rows_from_table(headers: &[String], rows: &[Vec<String>]) -> Vec<ImportRow> {
    let keys = map_headers(headers);
    let mut out = Vec::with_capacity(rows.len());

    for (idx, cells) in rows.iter().enumerate() {
        let mut mapped: BTreeMap<&'static str, String> = BTreeMap::new();
        let mut custom: BTreeMap<String, String> = BTreeMap::new();
        for (col, raw) in cells.iter().enumerate() {
            let value = match non_blank(&Some(raw.clone())) {
                Some(v) => v.to_string(),
                None => continue,
            };
            match keys.get(col).copied().flatten() {
                Some(key) if KNOWN_KEYS.contains(&key) => {
                    mapped.insert(key, value);
                }
                Some(key) => {
                    custom.insert(key.to_string(), value);
                }
                None => {
                    let header = headers.get(col).map(|h| h.trim()).unwrap_or("");
                    let header = if header.is_empty() {
                        format!("column_{}", col + 1)
                    } else {
                        header.to_string()
                    };
                    custom.insert(header, value);
                }
            }
        }
        let take = |key: &str| mapped.get(key).cloned();

        let contractor = take("contractor_name");
        let name = match contractor.clone().or_else(|| take("common_name")) {
            Some(n) => n,
            None => continue,
        };
        let phone = take("contractor_phone")
            .or_else(|| take("common_phone"))
            .map(|p| format_phone(&p));

        let (birth_date, gender) = match take("rrn").as_deref().and_then(parse_rrn) {
            Some((b, g)) => (Some(b), Some(g)),
            None => (take("birth_date"), take("gender")),
        };

        let mut fin = FinancialRecord {
            company: take("company"),
            product_name: take("product_name"),
            policy_no: take("policy_no"),
            premium: take("premium"),
            status: take("status"),
            start_date: take("start_date"),
            end_date: take("end_date"),
            ..Default::default()
        };
        if let Some(insured) = take("insured_name") {
            fin.insured_phone = take("insured_phone").map(|p| format_phone(&p));
            if let Some((b, g)) = take("insured_rrn").as_deref().and_then(parse_rrn) {
                fin.insured_birth = Some(b);
                fin.insured_gender = Some(g);
            }
            if compact_name(&insured) != compact_name(&name) {
                custom.insert("family_relation_guess".into(), format!("피보험자: {}", insured));
            }
            fin.insured_name = Some(insured);
        }

        out.push(ImportRow {
            row_no: idx as u32 + 2,
            name: Some(name),
            phone,
            birth_date,
            gender,
            region: take("region"),
            email: take("email"),
            policyholder_name: contractor,
            policyholder_phone: take("contractor_phone").map(|p| format_phone(&p)),
            custom_data: custom,
            financial: if fin == FinancialRecord::default() {
                None
            } else {
                Some(fin)
            },
            ..Default::default()
        });
    }
    out
}

/// Read an upload from disk: file identity plus mapped rows.
pub fn read_upload(path: &Path) -> Result<(UploadFile, Vec<ImportRow>), ImportError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ImportError::Sheet(format!("{}: {}", path.display(), e)))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let file = UploadFile::from_bytes(&filename, &bytes);

    let mut workbook =
        open_workbook_auto(path).map_err(|e| ImportError::Sheet(format!("{}: {}", filename, e)))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ImportError::Sheet(format!("{}: no worksheets", filename)))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| ImportError::Sheet(format!("{}: {}", filename, e)))?;

    let mut rows = range.rows();
    let headers: Vec<String> = match rows.next() {
        Some(header) => header.iter().map(cell_to_string).collect(),
        None => return Ok((file, Vec::new())),
    };
    let body: Vec<Vec<String>> = rows.map(|r| r.iter().map(cell_to_string).collect()).collect();
    let mapped = rows_from_table(&headers, &body);
    log::info!(
        "Read {}: {} data rows, {} with a name",
        filename,
        body.len(),
        mapped.len()
    );
    Ok((file, mapped))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => excel_serial_date(dt.as_f64()).unwrap_or_else(|| dt.to_string()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// `YYYY-MM-DD` for an Excel serial day number (1900 date system).
fn excel_serial_date(serial: f64) -> Option<String> {
    if !(1.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_days(Days::new(serial.floor() as u64))?;
    Some(date.format("%Y-%m-%d").to_string())
}
