//! Layered settings: built-in defaults < persisted JSON file < `HUNTER_*`
//! environment < command-line overrides.
//!
//! Settings are loaded once in `main` and handed to each component.

use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub const ENV_PREFIX: &str = "HUNTER";
pub const CONFIG_FILE_NAME: &str = ".faculty_hunter.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Plain HTTP fetch with reqwest.
    Http,
    /// Rendered fetch through spider.cloud (needs SPIDER_API_KEY).
    Spider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub backend: Backend,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    /// URL extensions the browser refuses to navigate to.
    pub block_extensions: Vec<String>,
    pub wait_poll_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        BrowserSettings {
            backend: Backend::Http,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/124.0 Safari/537.36"
                .into(),
            timeout_secs: 30,
            proxy: None,
            block_extensions: ["png", "jpg", "jpeg", "gif", "svg", "webp", "css", "woff", "woff2", "mp4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            wait_poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is not set.
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Total extraction attempts, the first one included.
    pub max_tries: u32,
    /// Append-only JSONL log of every request/response pair.
    pub audit_log: PathBuf,
}

impl Default for LlmSettings {
    fn default() -> Self {
        LlmSettings {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.0,
            timeout_secs: 120,
            max_tries: 3,
            audit_log: PathBuf::from("llm_audit.jsonl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub batch_attempts: u32,
    pub sleep_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            batch_attempts: 3,
            sleep_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub engine_url: String,
    pub result_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            engine_url: "https://www.google.com/search".into(),
            result_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScholarSettings {
    pub base_url: String,
    pub page_limit: usize,
}

impl Default for ScholarSettings {
    fn default() -> Self {
        ScholarSettings {
            base_url: "https://scholar.google.com".into(),
            page_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub out_dir: PathBuf,
    pub pandoc_cmd: String,
    /// Drop raw HTML from pandoc output.
    pub suppress_raw_html: bool,
    pub table_max_width: usize,
    pub browser: BrowserSettings,
    pub llm: LlmSettings,
    pub retry: RetrySettings,
    pub search: SearchSettings,
    pub scholar: ScholarSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            out_dir: PathBuf::from("out"),
            pandoc_cmd: "pandoc".into(),
            suppress_raw_html: true,
            table_max_width: 60,
            browser: BrowserSettings::default(),
            llm: LlmSettings::default(),
            retry: RetrySettings::default(),
            search: SearchSettings::default(),
            scholar: ScholarSettings::default(),
        }
    }
}

impl Settings {
    /// Build settings from every layer. `overrides` are dotted `key=value`
    /// pairs from the command line and win over everything else.
    pub fn load(file: &Path, overrides: &[(String, String)]) -> Result<Settings> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(file).format(FileFormat::Json).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("browser.block_extensions"),
            );
        for (key, value) in overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    /// The audit log lives under the output directory unless given as an
    /// absolute path.
    pub fn audit_log_path(&self) -> PathBuf {
        if self.llm.audit_log.is_absolute() {
            self.llm.audit_log.clone()
        } else {
            self.out_dir.join(&self.llm.audit_log)
        }
    }
}

pub fn default_config_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

/// Parse `key=value` command-line overrides.
pub fn parse_override(s: &str) -> std::result::Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    let k = k.trim();
    if k.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((k.to_string(), v.trim().to_string()))
}

// ── Persisted file editing (`config get/set/unset`) ──

pub fn read_file(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str(&text)?)
}

fn write_file(path: &Path, map: &Map<String, Value>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(map)?)?;
    Ok(())
}

pub fn get_value(path: &Path, key: &str) -> Result<Option<Value>> {
    let map = read_file(path)?;
    let mut cur = map.get(key_head(key));
    for part in key.split('.').skip(1) {
        cur = cur.and_then(|v| v.get(part));
    }
    Ok(cur.cloned())
}

/// Set a dotted key. The value is stored as JSON when it parses as JSON,
/// otherwise as a string.
pub fn set_value(path: &Path, key: &str, raw: &str) -> Result<()> {
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let mut map = read_file(path)?;
    let parts: Vec<&str> = key.split('.').collect();
    let (last, parents) = parts.split_last().expect("split always yields one part");

    let mut cur = &mut map;
    for part in parents {
        let entry = cur
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cur = entry.as_object_mut().expect("just made an object");
    }
    cur.insert(last.to_string(), value);
    write_file(path, &map)
}

/// Remove a dotted key. Returns whether anything was removed.
pub fn unset_value(path: &Path, key: &str) -> Result<bool> {
    let mut map = read_file(path)?;
    let parts: Vec<&str> = key.split('.').collect();
    let (last, parents) = parts.split_last().expect("split always yields one part");

    let mut cur = &mut map;
    for part in parents {
        match cur.get_mut(*part).and_then(Value::as_object_mut) {
            Some(next) => cur = next,
            None => return Ok(false),
        }
    }
    let removed = cur.remove(*last).is_some();
    if removed {
        write_file(path, &map)?;
    }
    Ok(removed)
}

fn key_head(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("missing.json"), &[]).unwrap();
        assert_eq!(s.llm.max_tries, 3);
        assert_eq!(s.retry.batch_attempts, 3);
        assert_eq!(s.browser.backend, Backend::Http);
        assert_eq!(s.out_dir, PathBuf::from("out"));
    }

    #[test]
    fn file_then_overrides_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg.json");
        std::fs::write(
            &file,
            r#"{"pandoc_cmd": "/opt/pandoc", "llm": {"model": "file-model", "max_tries": 5}}"#,
        )
        .unwrap();

        let s = Settings::load(&file, &[]).unwrap();
        assert_eq!(s.pandoc_cmd, "/opt/pandoc");
        assert_eq!(s.llm.model, "file-model");
        assert_eq!(s.llm.max_tries, 5);
        // Untouched nested defaults survive a partial file.
        assert_eq!(s.llm.api_key_env, "OPENAI_API_KEY");

        let overrides = vec![("llm.model".to_string(), "cli-model".to_string())];
        let s = Settings::load(&file, &overrides).unwrap();
        assert_eq!(s.llm.model, "cli-model");
        assert_eq!(s.llm.max_tries, 5);
    }

    #[test]
    fn set_get_unset_dotted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg.json");

        set_value(&file, "llm.model", "m1").unwrap();
        set_value(&file, "retry.batch_attempts", "4").unwrap();
        assert_eq!(get_value(&file, "llm.model").unwrap(), Some(Value::String("m1".into())));
        assert_eq!(get_value(&file, "retry.batch_attempts").unwrap(), Some(Value::from(4)));

        let s = Settings::load(&file, &[]).unwrap();
        assert_eq!(s.llm.model, "m1");
        assert_eq!(s.retry.batch_attempts, 4);

        assert!(unset_value(&file, "llm.model").unwrap());
        assert!(!unset_value(&file, "llm.model").unwrap());
        assert_eq!(get_value(&file, "llm.model").unwrap(), None);
    }

    #[test]
    fn parse_override_pairs() {
        assert_eq!(
            parse_override("llm.model = gpt").unwrap(),
            ("llm.model".to_string(), "gpt".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=x").is_err());
    }
}
