//! Seed loading: line-delimited URL files and spreadsheets.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Reader};
use tracing::{info, warn};

use crate::error::HunterError;
use crate::records::Seed;
use crate::store::{ArtifactStore, Stage};

pub type Row = BTreeMap<String, String>;

/// Column names used when reading people from a spreadsheet.
#[derive(Debug, Clone)]
pub struct Columns {
    pub name: String,
    pub institute: String,
    pub url: String,
}

impl Default for Columns {
    fn default() -> Self {
        Columns {
            name: "name".into(),
            institute: "institute".into(),
            url: "url".into(),
        }
    }
}

/// Expand glob patterns, keeping order and dropping duplicates. Plain paths
/// pass through untouched.
pub fn expand_globs<S: AsRef<str>>(patterns: &[S], raise_invalid: bool) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let matched: Vec<PathBuf> = if pattern.contains('*') {
            glob::glob(pattern)
                .with_context(|| format!("bad glob pattern {pattern}"))?
                .filter_map(|p| p.ok())
                .collect()
        } else {
            vec![PathBuf::from(pattern)]
        };
        if raise_invalid && matched.is_empty() {
            anyhow::bail!("no file found for {pattern}");
        }
        for p in matched {
            if seen.insert(p.clone()) {
                paths.push(p);
            } else {
                warn!("path {} listed more than once", p.display());
            }
        }
    }
    Ok(paths)
}

/// One URL per line; blank lines and `#` comments are ignored.
pub fn parse_url_lines(text: &str) -> Vec<Seed> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(Seed::from_url)
        .filter(|s| seen.insert(s.key.clone()))
        .collect()
}

pub fn load_url_file(path: &Path) -> Result<Vec<Seed>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_url_lines(&text))
}

/// Read a spreadsheet into rows keyed by header name.
pub fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "csv" | "tsv" => read_delimited(path, if ext == "tsv" { b'\t' } else { b',' }),
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => read_workbook(path),
        _ => Err(HunterError::UnsupportedSheet(path.to_path_buf()).into()),
    }
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.trim().to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn read_workbook(path: &Path) -> Result<Vec<Row>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow::anyhow!("{} has no sheets", path.display()))??;

    let mut lines = range.rows();
    let headers: Vec<String> = match lines.next() {
        Some(h) => h.iter().map(|c| c.to_string().trim().to_string()).collect(),
        None => return Ok(Vec::new()),
    };
    Ok(lines
        .map(|cells| {
            headers
                .iter()
                .zip(cells.iter())
                .map(|(h, c)| (h.clone(), c.to_string().trim().to_string()))
                .collect()
        })
        .collect())
}

/// Turn spreadsheet rows into seeds. Rows with a URL become URL seeds (the
/// name and institute ride along); rows with only a name become people.
pub fn seeds_from_rows(rows: &[Row], cols: &Columns) -> Vec<Seed> {
    let mut seen = HashSet::new();
    let mut seeds = Vec::new();
    for row in rows {
        let get = |c: &str| row.get(c).map(|s| s.trim()).filter(|s| !s.is_empty());
        let name = get(cols.name.as_str());
        let institute = get(cols.institute.as_str());

        let mut seed = match (get(cols.url.as_str()), name) {
            (Some(url), _) => {
                let mut s = Seed::from_url(url);
                s.name = name.map(str::to_string);
                s.institute = institute.map(str::to_string);
                s
            }
            (None, Some(name)) => Seed::from_person(name, institute),
            (None, None) => continue,
        };
        for (k, v) in row {
            if *k != cols.name && *k != cols.institute && *k != cols.url && !v.is_empty() {
                seed.extra.insert(k.clone(), v.clone().into());
            }
        }
        if seen.insert(seed.key.clone()) {
            seeds.push(seed);
        }
    }
    seeds
}

/// Load seeds from any supported input: spreadsheets by extension, anything
/// else as a line-delimited URL list.
pub fn load_seeds(path: &Path, cols: &Columns) -> Result<Vec<Seed>> {
    match read_rows(path) {
        Ok(rows) => Ok(seeds_from_rows(&rows, cols)),
        Err(e) if matches!(e.downcast_ref::<HunterError>(), Some(HunterError::UnsupportedSheet(_))) => {
            load_url_file(path)
        }
        Err(e) => Err(e),
    }
}

/// Create `index.json` for every seed that does not have one yet.
/// Returns (created, already present).
pub fn init_entities(store: &ArtifactStore, seeds: &[Seed]) -> Result<(usize, usize)> {
    let mut created = 0;
    let mut existing = 0;
    for seed in seeds {
        if store.exists(Stage::Seed, &seed.key) {
            existing += 1;
            continue;
        }
        store.write_json(Stage::Seed, &seed.key, seed)?;
        created += 1;
    }
    info!("Seeds: {} created, {} already present", created, existing);
    Ok((created, existing))
}

/// Read every seed under the store root, skipping unreadable ones.
pub fn load_entities(store: &ArtifactStore) -> Result<Vec<Seed>> {
    let mut seeds = Vec::new();
    for key in store.entities()? {
        if !store.exists(Stage::Seed, &key) {
            continue;
        }
        match store.read_json::<Seed>(Stage::Seed, &key) {
            Ok(seed) => seeds.push(seed),
            Err(e) => warn!("Skipping {}: unreadable index.json: {}", key, e),
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn url_lines_skip_comments_and_duplicates() {
        let seeds = parse_url_lines(
            "# faculty pages\nhttps://a.edu/people\n\n  https://a.edu/people  \nhttps://b.edu/faculty/list.php\n",
        );
        let keys: Vec<&str> = seeds.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a.edu_people.html", "b.edu_faculty_list.php"]);
    }

    #[test]
    fn csv_rows_become_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "name,institute,url,note").unwrap();
        writeln!(f, "Jane Doe,Example U,,hired 2020").unwrap();
        writeln!(f, ",Chem Dept,https://chem.example.edu/faculty,").unwrap();
        writeln!(f, ",,,").unwrap();
        drop(f);

        let seeds = load_seeds(&path, &Columns::default()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].key, "Jane Doe_Example U");
        assert_eq!(seeds[0].extra.get("note").and_then(|v| v.as_str()), Some("hired 2020"));
        assert_eq!(seeds[1].key, "chem.example.edu_faculty.html");
        assert_eq!(seeds[1].institute.as_deref(), Some("Chem Dept"));
    }

    #[test]
    fn plain_text_falls_back_to_url_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "https://a.edu/x\n").unwrap();
        let seeds = load_seeds(&path, &Columns::default()).unwrap();
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let seeds = parse_url_lines("https://a.edu/x\nhttps://a.edu/y\n");

        assert_eq!(init_entities(&store, &seeds).unwrap(), (2, 0));
        assert_eq!(init_entities(&store, &seeds).unwrap(), (0, 2));
        let loaded = load_entities(&store).unwrap();
        assert_eq!(loaded, seeds);
    }

    #[test]
    fn expand_globs_dedups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "").unwrap();
        std::fs::write(dir.path().join("b.md"), "").unwrap();
        let pattern = format!("{}/*.md", dir.path().display());
        let plain = dir.path().join("a.md").display().to_string();
        let paths = expand_globs(&[pattern.as_str(), plain.as_str()], true).unwrap();
        assert_eq!(paths.len(), 2);

        let missing = format!("{}/*.none", dir.path().display());
        assert!(expand_globs(&[missing], true).is_err());
    }
}
