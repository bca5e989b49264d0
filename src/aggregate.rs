//! Merge per-entity extraction artifacts into one flat table.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use url::Url;

use crate::key::normalize_name;
use crate::records::{scrub_placeholders, Seed};
use crate::seeds::expand_globs;
use crate::store::{load_jsonl, Stage, Topic};

const ASSISTANT_KEYWORDS: [&str; 2] = ["assist", "prof"];
const TRAINEE_KEYWORDS: &[&str] = &["phd", "ph.d", "doctoral", "graduate student", "master", "msc", "m.s."];

/// Which records make it into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Filter {
    /// Title mentions both "assist" and "prof".
    AssistantProfessor,
    /// Title marks a PhD or master's level trainee.
    GraduateTrainee,
    #[default]
    All,
}

impl Filter {
    /// Decide on a title. An empty title is kept, with a warning naming the
    /// record, so it can be checked by hand.
    pub fn includes(self, title: &str, name: &str) -> bool {
        if self == Filter::All {
            return true;
        }
        let title = title.trim().to_lowercase();
        if title.is_empty() {
            warn!("{} has no title; keeping it", name);
            return true;
        }
        match self {
            Filter::AssistantProfessor => ASSISTANT_KEYWORDS.iter().all(|k| title.contains(k)),
            Filter::GraduateTrainee => {
                !title.contains("postdoc") && TRAINEE_KEYWORDS.iter().any(|k| title.contains(k))
            }
            Filter::All => true,
        }
    }
}

/// Resolve a possibly relative link against the page it was found on. The
/// base loses its query and fragment first; absolute links pass through.
pub fn resolve_url(base: &str, link: &str) -> String {
    let link = link.trim();
    if link.is_empty() || Url::parse(link).is_ok() {
        return link.to_string();
    }
    let Ok(mut base) = Url::parse(base.trim()) else {
        return link.to_string();
    };
    base.set_query(None);
    base.set_fragment(None);
    base.join(link).map(|u| u.to_string()).unwrap_or_else(|_| link.to_string())
}

struct Loaded {
    entity: String,
    records: Vec<Map<String, Value>>,
}

/// The URL the artifact's page was fetched from, when the scrape recorded it.
fn source_url(dir: &Path, artifact: &Path) -> anyhow::Result<Option<String>> {
    let file_name = artifact.file_name().unwrap_or_default();
    let Some(topic) = [Topic::Faculty, Topic::Cv, Topic::Group]
        .into_iter()
        .find(|t| file_name == Stage::Extract(*t).file_name().as_str())
    else {
        return Ok(None);
    };
    let source = dir.join(Stage::Source(topic).file_name());
    if !source.exists() {
        return Ok(None);
    }
    let url = std::fs::read_to_string(&source)?.trim().to_string();
    Ok(Some(url).filter(|u| !u.is_empty()))
}

fn seed_url(dir: &Path) -> anyhow::Result<Option<String>> {
    let index = dir.join(Stage::Seed.file_name());
    if !index.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&index)?;
    Ok(serde_json::from_str::<Seed>(&text)
        .with_context(|| format!("reading {}", index.display()))?
        .url)
}

/// Records of one artifact, with profile links made absolute.
fn load_artifact(path: &Path) -> anyhow::Result<Loaded> {
    let values: Vec<Value> = if path.extension().is_some_and(|e| e == "jsonl") {
        load_jsonl(path)?
    } else {
        let text = std::fs::read_to_string(path)?;
        match serde_json::from_str(&text)? {
            Value::Array(items) => items,
            v => vec![v],
        }
    };

    let dir = path.parent().unwrap_or(Path::new("."));
    let entity = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = match source_url(dir, path)? {
        Some(url) => Some(url),
        None => seed_url(dir)?,
    };

    let mut records = Vec::with_capacity(values.len());
    for mut v in values {
        scrub_placeholders(&mut v);
        let Value::Object(mut obj) = v else {
            anyhow::bail!("record is not an object");
        };
        if let (Some(base), Some(Value::String(link))) = (base.as_deref(), obj.get_mut("profile_url")) {
            *link = resolve_url(base, link);
        }
        records.push(obj);
    }
    Ok(Loaded { entity, records })
}

/// Load every artifact matching `patterns`, keep what `filter` accepts and
/// drop repeated names (first one wins, in path order).
pub fn aggregate<S: AsRef<str>>(patterns: &[S], filter: Filter) -> anyhow::Result<Table> {
    let mut paths: Vec<PathBuf> = expand_globs(patterns, false)?;
    paths.sort();
    info!("Aggregating {} artifacts", paths.len());

    let loaded: Vec<(PathBuf, anyhow::Result<Loaded>)> = paths
        .into_par_iter()
        .map(|p| {
            let r = load_artifact(&p);
            (p, r)
        })
        .collect();

    let mut seen = HashSet::new();
    let mut kept: Vec<(String, Map<String, Value>)> = Vec::new();
    for (path, result) in loaded {
        let artifact = match result {
            Ok(a) => a,
            Err(e) => {
                error!("Skipping {}: {:#}", path.display(), e);
                continue;
            }
        };
        for record in artifact.records {
            let name = text(&record, "name");
            if !filter.includes(text(&record, "title"), name) {
                continue;
            }
            if !seen.insert(normalize_name(name)) {
                continue;
            }
            kept.push((artifact.entity.clone(), record));
        }
    }
    info!("{} records kept", kept.len());
    Ok(Table::from_records(&kept))
}

fn text<'a>(record: &'a Map<String, Value>, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

impl Table {
    /// Columns are `name`, then every other field in order of first
    /// appearance, then the entity the record came from.
    fn from_records(records: &[(String, Map<String, Value>)]) -> Self {
        let mut headers = vec!["name".to_string()];
        for (_, r) in records {
            for k in r.keys() {
                if !headers.contains(k) {
                    headers.push(k.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|(entity, r)| {
                let mut row: Vec<String> = headers.iter().map(|h| r.get(h).map(cell).unwrap_or_default()).collect();
                row.push(entity.clone());
                row
            })
            .collect();
        headers.push("entity".to_string());
        Table { headers, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The first `n` rows.
    pub fn head(&self, n: usize) -> Table {
        Table {
            headers: self.headers.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Write CSV, or TSV when the path ends in `.tsv`.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let delimiter = if path.extension().is_some_and(|e| e == "tsv") { b'\t' } else { b',' };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut w = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        w.write_record(&self.headers)?;
        for row in &self.rows {
            w.write_record(row)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Width of each column: the longest cell or header, capped at `max`.
    pub fn column_widths(&self, max: usize) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                self.rows
                    .iter()
                    .map(|r| r[i].chars().count())
                    .chain(std::iter::once(h.chars().count()))
                    .max()
                    .unwrap_or(0)
                    .min(max)
            })
            .collect()
    }

    pub fn render(&self, max_width: usize) -> String {
        let widths = self.column_widths(max_width);
        let line = |cells: &[String]| {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<w$}", truncate(&c.replace('\n', " "), *w), w = *w))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        let mut out = line(&self.headers);
        out.push('\n');
        out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 3 * widths.len().saturating_sub(1)));
        for row in &self.rows {
            out.push('\n');
            out.push_str(line(row).trim_end());
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else if max <= 3 {
        s.chars().take(max).collect()
    } else {
        let truncated: String = s.chars().take(max - 3).collect();
        format!("{}...", truncated)
    }
}
