//! Deterministic, filesystem-safe keys for entities.
//!
//! A key doubles as the entity's directory name under the output root and as
//! its de-duplication identity, so the same input must always map to the
//! same key across runs.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static ILLEGAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]"#).unwrap());
static CJK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\u{4e00}-\u{9fa5}]").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const DEFAULT_EXT: &str = ".html";

/// Key for a page URL: `host` + path with `/` turned into `_`, plus `.html`
/// when the result has no extension. The query string is dropped.
pub fn url_key(url: &str) -> String {
    url_key_with(url, false, false)
}

pub fn url_key_with(url: &str, include_query: bool, no_ext: bool) -> String {
    let (netloc, path, query) = match Url::parse(url.trim()) {
        Ok(parsed) => {
            let mut netloc = parsed.host_str().unwrap_or_default().to_string();
            if let Some(port) = parsed.port() {
                netloc.push_str(&format!(":{port}"));
            }
            let path = if parsed.cannot_be_a_base() {
                String::new()
            } else {
                parsed.path().to_string()
            };
            (netloc, path, parsed.query().unwrap_or_default().to_string())
        }
        // Scheme-less input: treat everything before `?` as a path.
        Err(_) => {
            let (path, query) = url.trim().split_once('?').unwrap_or((url.trim(), ""));
            (String::new(), path.to_string(), query.to_string())
        }
    };

    let mut filename = path.replace('/', "_");
    if include_query {
        filename.push_str(&query);
    }
    if !no_ext && !has_extension(&filename) {
        filename.push_str(DEFAULT_EXT);
    }
    safe_filename(&format!("{netloc}{filename}"))
}

/// Key for a person: `name` or `name_institute`, made filesystem safe.
pub fn identity_key(name: &str, institute: Option<&str>) -> String {
    let name = SPACES_RE.replace_all(name.trim(), " ");
    match institute.map(str::trim).filter(|s| !s.is_empty()) {
        Some(inst) => safe_filename(&format!("{}_{}", name, SPACES_RE.replace_all(inst, " "))),
        None => safe_filename(&name),
    }
}

/// Replace characters that are illegal in file names on common platforms.
/// Names made only of dots (`.`, `..`) would point at a parent directory
/// and become `_`.
pub fn safe_filename(s: &str) -> String {
    let safe = ILLEGAL_RE.replace_all(s, "_");
    if safe.chars().all(|c| c == '.') {
        return "_".into();
    }
    safe.into_owned()
}

pub fn contains_chinese(text: &str) -> bool {
    CJK_RE.is_match(text)
}

/// De-duplication identity for a person's name. Names containing Chinese
/// characters reduce to those characters, so `"Zhang San 张三"` and `"张三"`
/// are the same person.
pub fn normalize_name(name: &str) -> String {
    if contains_chinese(name) {
        return CJK_RE.find_iter(name).map(|m| m.as_str()).collect();
    }
    SPACES_RE.replace_all(name.trim(), " ").to_lowercase()
}

fn has_extension(filename: &str) -> bool {
    let stem_start = filename.trim_start_matches('.').len();
    let trimmed = &filename[filename.len() - stem_start..];
    trimmed.rfind('.').is_some()
}
