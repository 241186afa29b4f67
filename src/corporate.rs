//! Corporate policyholder detection and organization keys.
//!
//! Detection is a keyword heuristic and will miss organizations whose names
//! carry no legal-entity marker. Those fall through to the person path; the
//! hold workflow remains the escape hatch. The heuristic sits behind
//! [`CorporateClassifier`] so callers can swap or extend it.

use std::sync::OnceLock;

use regex::Regex;

/// Korean and organizational markers that indicate a non-person policyholder.
pub const CORPORATE_MARKERS: &[&str] = &[
    "(주)", "㈜", "주식회사", "유한회사", "재단", "사단", "협동조합", "법무법인", "세무법인",
    "회계법인", "병원", "의원", "학교", "학원", "센터", "협회", "조합", "공사", "공단",
];

/// Markers removed when building an organization key.
const ORG_STRIP_MARKERS: &[&str] = &["(주)", "㈜", "주식회사", "유한회사", "재단법인", "사단법인"];

fn re_latin_entity() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(CORP|CORPORATION|LTD|LIMITED|INC|LLC|CO\.?,?\s*LTD)\b").unwrap()
    })
}

fn re_latin_entity_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(co\.?,?\s*ltd|corporation|corp|inc|ltd|limited|llc)\b\.?").unwrap()
    })
}

fn re_org_punct() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\(\)\[\]\{\},.]").unwrap())
}

/// Strategy for deciding whether a policyholder name is an organization.
pub trait CorporateClassifier: Send + Sync {
    fn is_corporate(&self, name: &str) -> bool;
}

/// Default classifier: marker substrings plus Latin legal-entity words.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    extra_markers: Vec<String>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add markers on top of the built-in list (from configuration).
    pub fn with_extra_markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra_markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.trim().is_empty())
                .collect(),
        }
    }
}

impl CorporateClassifier for KeywordClassifier {
    fn is_corporate(&self, name: &str) -> bool {
        is_corporate_name(name) || self.extra_markers.iter().any(|m| name.contains(m.as_str()))
    }
}

/// Built-in marker heuristic. Blank names are never corporate.
pub fn is_corporate_name(name: &str) -> bool {
    let n = name.trim();
    if n.is_empty() {
        return false;
    }
    CORPORATE_MARKERS.iter().any(|k| n.contains(k)) || re_latin_entity().is_match(n)
}

/// Organization key for grouping and search: legal-entity markers, brackets
/// and all whitespace removed. `"(주) 선경스틸"` and `"㈜선경스틸"` share a key.
pub fn normalize_org_name(name: &str) -> String {
    let n = name.trim();
    if n.is_empty() {
        return String::new();
    }
    let without_latin = re_latin_entity_suffix().replace_all(n, "");
    let mut key: String = without_latin.chars().filter(|c| !c.is_whitespace()).collect();
    for marker in ORG_STRIP_MARKERS {
        key = key.replace(marker, "");
    }
    re_org_punct().replace_all(&key, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_korean_markers() {
        assert!(is_corporate_name("㈜선경스틸"));
        assert!(is_corporate_name("(주) 선경스틸"));
        assert!(is_corporate_name("서울대학교병원"));
        assert!(!is_corporate_name("김철수"));
        assert!(!is_corporate_name("   "));
    }

    #[test]
    fn test_latin_markers_need_word_boundary() {
        assert!(is_corporate_name("Acme Corp"));
        assert!(is_corporate_name("Acme Co., Ltd."));
        assert!(is_corporate_name("acme inc"));
        assert!(!is_corporate_name("Princeton Smith"));
    }

    #[test]
    fn test_org_key() {
        assert_eq!(normalize_org_name("㈜선경스틸"), "선경스틸");
        assert_eq!(normalize_org_name("(주) 선경 스틸"), "선경스틸");
        assert_eq!(normalize_org_name("주식회사 선경스틸"), "선경스틸");
        assert_eq!(normalize_org_name("Acme Co., Ltd."), "Acme");
        assert_eq!(normalize_org_name("Acme, Inc."), "Acme");
        assert_eq!(normalize_org_name(""), "");
    }

    #[test]
    fn test_extra_markers() {
        let classifier = KeywordClassifier::with_extra_markers(["상사", " "]);
        assert!(classifier.is_corporate("대한상사"));
        assert!(!classifier.is_corporate("김철수"));
        assert!(KeywordClassifier::new().is_corporate("㈜선경스틸"));
    }
}
