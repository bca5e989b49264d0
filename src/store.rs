//! Directory-per-entity artifact layout.
//!
//! Each stage writes one file under `{root}/{key}/`. The file's presence is
//! the only completion marker: there is no database and no lock file. The
//! store assumes a single writer process.

use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HunterError, Result};

/// What a per-entity pipeline is hunting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Faculty listing pages.
    Faculty,
    /// A person's CV or profile page.
    Cv,
    /// A research group's member page.
    Group,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Faculty => "faculty",
            Topic::Cv => "cv",
            Topic::Group => "group",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Seed,
    Search(Topic),
    /// URL the raw page was actually fetched from.
    Source(Topic),
    Raw(Topic),
    Clean(Topic),
    Markdown(Topic),
    Extract(Topic),
}

impl Stage {
    /// File name inside the entity directory. The suffix encodes the stage.
    pub fn file_name(self) -> String {
        match self {
            Stage::Seed => "index.json".into(),
            Stage::Search(t) => format!("{t}.search.json"),
            Stage::Source(t) => format!("{t}.source.txt"),
            Stage::Raw(t) => format!("{t}.raw.html"),
            Stage::Clean(t) => format!("{t}.clean.html"),
            Stage::Markdown(t) => format!("{t}.md"),
            Stage::Extract(Topic::Cv) => "cv.json".into(),
            Stage::Extract(t) => format!("{t}.jsonl"),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Seed => f.write_str("seed"),
            Stage::Search(t) => write!(f, "{t}/search"),
            Stage::Source(t) => write!(f, "{t}/source"),
            Stage::Raw(t) => write!(f, "{t}/scrape"),
            Stage::Clean(t) => write!(f, "{t}/clean"),
            Stage::Markdown(t) => write!(f, "{t}/convert"),
            Stage::Extract(t) => write!(f, "{t}/extract"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn path(&self, stage: Stage, key: &str) -> PathBuf {
        self.entity_dir(key).join(stage.file_name())
    }

    pub fn exists(&self, stage: Stage, key: &str) -> bool {
        self.path(stage, key).is_file()
    }

    /// Plain overwrite-on-open write; creates the entity directory.
    pub fn write(&self, stage: Stage, key: &str, content: &str) -> Result<PathBuf> {
        let path = self.path(stage, key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read(&self, stage: Stage, key: &str) -> Result<String> {
        let path = self.path(stage, key);
        if !path.is_file() {
            return Err(HunterError::MissingArtifact {
                key: key.to_string(),
                stage,
            });
        }
        Ok(fs::read_to_string(path)?)
    }

    pub fn read_json<T: DeserializeOwned>(&self, stage: Stage, key: &str) -> Result<T> {
        let text = self.read(stage, key)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_json<T: Serialize>(&self, stage: Stage, key: &str, value: &T) -> Result<PathBuf> {
        let text = serde_json::to_string_pretty(value)?;
        self.write(stage, key, &text)
    }

    pub fn read_jsonl<T: DeserializeOwned>(&self, stage: Stage, key: &str) -> Result<Vec<T>> {
        let path = self.path(stage, key);
        if !path.is_file() {
            return Err(HunterError::MissingArtifact {
                key: key.to_string(),
                stage,
            });
        }
        load_jsonl(&path)
    }

    pub fn write_jsonl<T: Serialize>(&self, stage: Stage, key: &str, records: &[T]) -> Result<PathBuf> {
        self.write(stage, key, &dump_jsonl(records)?)
    }

    /// Entity keys (directory names under the root), sorted.
    pub fn entities(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                keys.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

pub fn load_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

pub fn dump_jsonl<T: Serialize>(records: &[T]) -> Result<String> {
    let mut out = String::new();
    for r in records {
        out.push_str(&serde_json::to_string(r)?);
        out.push('\n');
    }
    Ok(out)
}

/// Append one record to a JSONL file, creating it if needed.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}
