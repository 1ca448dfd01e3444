//! Fair name matching.
//!
//! Short fair names ("IRE", "ISE", "CES") are unusable as plain
//! substrings: "ire" sits inside "require", "tired", and foreign fair
//! codes like "ge26ire". Keywords shorter than five characters therefore
//! use boundary matching, where a boundary is a URL separator, a string
//! edge, or a digit transition ("ire2026" matches, "ge26ire" does not).

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Minimum keyword length for plain substring matching.
const MIN_SUBSTRING_LEN: usize = 5;

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*20\d{2}\s*").expect("year regex is valid"));

/// Codes like "LTW26" or "ISE24" embedded in PDF filenames.
static FAIR_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^a-z])([a-z]{2,6})(2[0-9])(?:[^0-9]|$)").expect("code regex is valid"));

/// Whether a fair keyword appears meaningfully in a URL.
pub fn fair_name_in_url(keyword: &str, url: &str) -> bool {
    if keyword.is_empty() || url.is_empty() {
        return false;
    }
    let word = keyword.to_lowercase();
    let url_lower = url.to_lowercase();

    if word.chars().count() >= MIN_SUBSTRING_LEN {
        return url_lower.contains(&word);
    }
    short_word_matches_url(&word, &url_lower)
}

fn short_word_matches_url(word: &str, url_lower: &str) -> bool {
    let pattern = format!(r"(?:^|[.\-_/]){}(?:$|[.\-_/\d])", regex::escape(word));
    Regex::new(&pattern)
        .map(|re| re.is_match(url_lower))
        .unwrap_or(false)
}

/// Whether a fair keyword appears meaningfully in free text.
pub fn fair_name_in_text(keyword: &str, text: &str) -> bool {
    if keyword.is_empty() || text.is_empty() {
        return false;
    }
    let word = keyword.to_lowercase();
    let text_lower = text.to_lowercase();

    if word.chars().count() >= MIN_SUBSTRING_LEN {
        return text_lower.contains(&word);
    }
    let pattern = format!(r"\b{}\b", regex::escape(&word));
    Regex::new(&pattern)
        .map(|re| re.is_match(&text_lower))
        .unwrap_or(false)
}

/// Whether any keyword of at least `min_len` characters matches the URL.
pub fn any_fair_keyword_in_url(keywords: &[String], url: &str, min_len: usize) -> bool {
    keywords
        .iter()
        .any(|kw| kw.chars().count() >= min_len && fair_name_in_url(kw, url))
}

const STOP_WORDS: [&str; 22] = [
    "the", "of", "and", "for", "in", "at", "de", "der", "die", "das", "van", "het", "een",
    "fair", "trade", "show", "exhibition", "expo", "messe", "fiera", "salon", "salone",
];

/// Extract matchable keywords from a fair name.
///
/// Strips the year, drops stop words, and adds the full cleaned name plus
/// its concatenated form ("Fruit Logistica" contributes "fruitlogistica").
pub fn extract_fair_keywords(fair_name: &str) -> Vec<String> {
    let mut keywords = HashSet::new();

    let clean = YEAR_RE.replace_all(fair_name, " ");
    let clean = clean.trim().to_lowercase();

    if clean.chars().count() >= 3 {
        keywords.insert(clean.clone());
    }

    let concat: String = clean.chars().filter(|c| *c != ' ' && *c != '-').collect();
    if concat.chars().count() >= 3 {
        keywords.insert(concat);
    }

    for word in clean.split_whitespace() {
        if !STOP_WORDS.contains(&word)
            && !word.chars().all(|c| c.is_ascii_digit())
            && word.chars().count() >= 3
        {
            keywords.insert(word.to_string());
        }
    }

    let mut sorted: Vec<String> = keywords.into_iter().collect();
    sorted.sort();
    sorted
}

/// Whether a PDF URL likely belongs to a different fair.
///
/// Detects foreign fair codes in the filename, e.g. "LTW26_Standbuild.pdf"
/// while hunting documents for "IRE 2026".
pub fn is_different_fair_pdf(pdf_url: &str, fair_name: &str) -> bool {
    let url_lower = pdf_url.to_lowercase();
    let filename = url_lower.rsplit('/').next().unwrap_or(&url_lower);

    let fair_keywords = extract_fair_keywords(fair_name);
    let fair_concat: String = YEAR_RE
        .replace_all(fair_name, "")
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != ' ')
        .collect();

    const COMMON_ABBREVS: [&str; 10] = [
        "rev", "ver", "vol", "doc", "pdf", "img", "src", "tmp", "eng", "deu",
    ];

    for caps in FAIR_CODE_RE.captures_iter(filename) {
        let code = match caps.get(1) {
            Some(m) => m.as_str(),
            None => continue,
        };
        if fair_keywords.iter().any(|kw| kw == code) || code == fair_concat {
            continue;
        }
        if COMMON_ABBREVS.contains(&code) {
            continue;
        }
        return true;
    }
    false
}
