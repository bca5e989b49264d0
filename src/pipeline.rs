//! The concrete stages: search, scrape, clean, convert and extract.
//!
//! Each step reads its upstream artifact from the store and returns the
//! content of its own; the [`StageRunner`] decides whether to run it and
//! persists the result.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::browser::{page_title, Browser};
use crate::clean::clean_html;
use crate::config::{SearchSettings, Settings};
use crate::convert::Converter;
use crate::llm::Completion;
use crate::prompt::schema;
use crate::records::{FacultyMember, GroupMember, ScholarProfile, Seed};
use crate::runner::{BatchReport, StageRunner, Step};
use crate::search::{self, SearchItem};
use crate::store::{dump_jsonl, ArtifactStore, Stage, Topic};
use crate::validate::ensure_valid;

/// Upstream artifact, or `None` when the earlier stage has not produced it.
fn upstream(store: &ArtifactStore, stage: Stage, key: &str) -> anyhow::Result<Option<String>> {
    if !store.exists(stage, key) {
        debug!("{} missing for {}", stage, key);
        return Ok(None);
    }
    Ok(Some(store.read(stage, key)?))
}

pub struct SearchStep<'a> {
    pub browser: &'a mut dyn Browser,
    pub settings: &'a SearchSettings,
    pub topic: Topic,
}

#[async_trait]
impl<'a> Step for SearchStep<'a> {
    fn stage(&self) -> Stage {
        Stage::Search(self.topic)
    }

    async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>> {
        if seed.name.is_none() {
            debug!("{} has no name to search for", seed.key);
            return Ok(None);
        }
        let query = search::build_query(seed, self.topic);
        let items = search::search(
            &mut *self.browser,
            &self.settings.engine_url,
            &query,
            self.topic,
            seed.name.as_deref(),
            self.settings.result_limit,
        )
        .await?;
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string_pretty(&items)?))
    }
}

pub struct ScrapeStep<'a> {
    pub browser: &'a mut dyn Browser,
    pub store: &'a ArtifactStore,
    pub topic: Topic,
}

impl ScrapeStep<'_> {
    /// Faculty pages come from the seed itself; CV and group pages from the
    /// best search result.
    fn target(&self, seed: &Seed) -> anyhow::Result<Option<String>> {
        if self.topic == Topic::Faculty {
            return Ok(seed.url.clone());
        }
        let stage = Stage::Search(self.topic);
        if !self.store.exists(stage, &seed.key) {
            debug!("{} missing for {}", stage, seed.key);
            return Ok(None);
        }
        let items: Vec<SearchItem> = self.store.read_json(stage, &seed.key)?;
        Ok(items.into_iter().next().map(|it| it.url))
    }
}

#[async_trait]
impl<'a> Step for ScrapeStep<'a> {
    fn stage(&self) -> Stage {
        Stage::Raw(self.topic)
    }

    async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>> {
        let Some(url) = self.target(seed)? else {
            return Ok(None);
        };
        self.browser.goto(&url).await?;
        let html = self.browser.content()?;
        let title = page_title(&html).unwrap_or_default();
        info!("Fetched {} `{}` ({} bytes)", url, title, html.len());
        // Relative links in the page resolve against where it really came from.
        let source = self.browser.current_url().unwrap_or(&url);
        self.store.write(Stage::Source(self.topic), &seed.key, source)?;
        Ok(Some(html))
    }
}

pub struct CleanStep<'a> {
    pub store: &'a ArtifactStore,
    pub topic: Topic,
}

#[async_trait]
impl<'a> Step for CleanStep<'a> {
    fn stage(&self) -> Stage {
        Stage::Clean(self.topic)
    }

    async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>> {
        let Some(raw) = upstream(self.store, Stage::Raw(self.topic), &seed.key)? else {
            return Ok(None);
        };
        Ok(Some(clean_html(&raw, true)))
    }
}

pub struct ConvertStep<'a> {
    pub store: &'a ArtifactStore,
    pub converter: &'a Converter,
    pub topic: Topic,
}

#[async_trait]
impl<'a> Step for ConvertStep<'a> {
    fn stage(&self) -> Stage {
        Stage::Markdown(self.topic)
    }

    async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>> {
        let Some(html) = upstream(self.store, Stage::Clean(self.topic), &seed.key)? else {
            return Ok(None);
        };
        Ok(Some(self.converter.convert_html(&html).await?))
    }
}

pub struct ExtractStep<'a> {
    pub store: &'a ArtifactStore,
    pub llm: &'a dyn Completion,
    pub topic: Topic,
    pub max_tries: u32,
}

#[async_trait]
impl<'a> Step for ExtractStep<'a> {
    fn stage(&self) -> Stage {
        Stage::Extract(self.topic)
    }

    async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>> {
        let Some(markdown) = upstream(self.store, Stage::Markdown(self.topic), &seed.key)? else {
            return Ok(None);
        };
        if markdown.trim().is_empty() {
            return Ok(None);
        }
        let schema = schema(self.topic);
        let reply = self.llm.complete(&schema.extract, &markdown).await?;
        let records = ensure_valid(self.llm, &reply, schema, self.max_tries).await?;

        let content = match self.topic {
            Topic::Faculty => dump_jsonl(&typed::<FacultyMember>(records)?)?,
            Topic::Group => dump_jsonl(&typed::<GroupMember>(records)?)?,
            Topic::Cv => {
                let profile = typed::<ScholarProfile>(records)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("no profile in reply"))?;
                serde_json::to_string_pretty(&profile)?
            }
        };
        Ok(Some(content))
    }
}

fn typed<T: DeserializeOwned + Serialize>(records: Vec<Value>) -> anyhow::Result<Vec<T>> {
    records
        .into_iter()
        .map(|r| serde_json::from_value(r).map_err(anyhow::Error::from))
        .collect()
}

/// Run every stage of `topic` over `seeds` in order, each with batch retry.
/// A stage that aborts ends the run; its report is the last one returned.
pub async fn run_topic(
    runner: &StageRunner<'_>,
    settings: &Settings,
    browser: &mut dyn Browser,
    llm: &dyn Completion,
    topic: Topic,
    seeds: &[Seed],
) -> Vec<BatchReport> {
    let store = runner.store();
    let retry = &settings.retry;
    let converter = Converter::new(&settings.pandoc_cmd, settings.suppress_raw_html);
    let mut reports = Vec::new();

    if topic != Topic::Faculty {
        let mut step = SearchStep { browser: &mut *browser, settings: &settings.search, topic };
        reports.push(runner.retry_batch(&mut step, seeds, retry).await);
        if stopped(&reports) {
            return reports;
        }
    }

    let mut scrape = ScrapeStep { browser: &mut *browser, store, topic };
    reports.push(runner.retry_batch(&mut scrape, seeds, retry).await);
    if stopped(&reports) {
        return reports;
    }

    let mut clean = CleanStep { store, topic };
    reports.push(runner.retry_batch(&mut clean, seeds, retry).await);
    if stopped(&reports) {
        return reports;
    }

    let mut convert = ConvertStep { store, converter: &converter, topic };
    reports.push(runner.retry_batch(&mut convert, seeds, retry).await);
    if stopped(&reports) {
        return reports;
    }

    let mut extract = ExtractStep { store, llm, topic, max_tries: settings.llm.max_tries };
    reports.push(runner.retry_batch(&mut extract, seeds, retry).await);

    reports
}

fn stopped(reports: &[BatchReport]) -> bool {
    reports.last().is_some_and(|r| r.aborted.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::MockBrowser;
    use crate::llm::testing::MockCompletion;
    use pretty_assertions::assert_eq;

    const FACULTY_PAGE: &str = r#"<html><body><script>x()</script>
      <h1>People</h1><a class="p" href="/people/jane">Jane Doe</a> Assistant Professor
    </body></html>"#;

    const FACULTY_REPLY: &str = "```json\n\
        {\"name\": \"Jane Doe\", \"title\": \"Assistant Professor\", \"email\": \"N/A\", \"profile_url\": \"/people/jane\"}\n\
        {\"name\": \"Bob Roe\", \"title\": \"Professor\"}\n```";

    fn faculty_seed() -> Seed {
        Seed::from_url("https://www.example.edu/people")
    }

    #[tokio::test]
    async fn scrape_and_clean_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seeds = vec![faculty_seed()];
        let mut browser = MockBrowser::default().with_page("https://www.example.edu/people", FACULTY_PAGE);

        for _ in 0..2 {
            let mut step = ScrapeStep { browser: &mut browser, store: &store, topic: Topic::Faculty };
            runner.run(&mut step, &seeds).await;
        }
        assert_eq!(browser.visits(), 1);

        let mut clean = CleanStep { store: &store, topic: Topic::Faculty };
        let report = runner.run(&mut clean, &seeds).await;
        assert_eq!(report.done, 1);
        let cleaned = store.read(Stage::Clean(Topic::Faculty), &seeds[0].key).unwrap();
        assert!(cleaned.contains(r#"<a href="/people/jane">Jane Doe</a>"#));
        assert!(!cleaned.contains("script"));
    }

    #[tokio::test]
    async fn extract_writes_scrubbed_records_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seed = faculty_seed();
        store.write(Stage::Markdown(Topic::Faculty), &seed.key, "# People\nJane Doe").unwrap();
        let llm = MockCompletion::new([FACULTY_REPLY]);

        for _ in 0..2 {
            let mut step = ExtractStep { store: &store, llm: &llm, topic: Topic::Faculty, max_tries: 3 };
            runner.run(&mut step, std::slice::from_ref(&seed)).await;
        }
        assert_eq!(llm.calls(), 1);

        let members: Vec<FacultyMember> = store.read_jsonl(Stage::Extract(Topic::Faculty), &seed.key).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "Jane Doe");
        assert_eq!(members[0].email, "");
        assert_eq!(members[0].profile_url, "/people/jane");
    }

    #[tokio::test]
    async fn extract_failure_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seed = Seed::from_person("Jane Doe", Some("Example U"));
        store.write(Stage::Markdown(Topic::Group), &seed.key, "members").unwrap();
        let llm = MockCompletion::new(["I could not find anything."]);

        let mut step = ExtractStep { store: &store, llm: &llm, topic: Topic::Group, max_tries: 2 };
        let report = runner.run(&mut step, std::slice::from_ref(&seed)).await;

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("after 2 attempt"));
        // one extraction plus one repair
        assert_eq!(llm.calls(), 2);
        assert!(!store.exists(Stage::Extract(Topic::Group), &seed.key));
    }

    #[tokio::test]
    async fn cv_reply_with_wrong_types_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seed = Seed::from_person("Jane Doe", Some("Example U"));
        store.write(Stage::Markdown(Topic::Cv), &seed.key, "# Jane Doe\nPhD 2012").unwrap();
        let llm = MockCompletion::new([
            r#"{"name": "Jane Doe", "education": "PhD, Example U, 2012"}"#,
            r#"{"name": "Jane Doe", "education": [{"start_year": 2012, "title": "PhD", "institute": "Example U"}]}"#,
        ]);

        let mut step = ExtractStep { store: &store, llm: &llm, topic: Topic::Cv, max_tries: 3 };
        let report = runner.run(&mut step, std::slice::from_ref(&seed)).await;

        assert_eq!(report.done, 1);
        assert_eq!(llm.calls(), 2);
        let profile: ScholarProfile = store.read_json(Stage::Extract(Topic::Cv), &seed.key).unwrap();
        assert_eq!(profile.education[0].start_year, "2012");
    }

    #[tokio::test]
    async fn cv_scrape_follows_top_search_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seed = Seed::from_person("Jane Doe", Some("Example U"));
        let items = vec![
            SearchItem { title: "Jane Doe CV".into(), url: "https://a.edu/jane/cv".into(), snippet: String::new() },
            SearchItem { title: "other".into(), url: "https://b.org".into(), snippet: String::new() },
        ];
        store.write_json(Stage::Search(Topic::Cv), &seed.key, &items).unwrap();
        let mut browser = MockBrowser::default().with_page("https://a.edu/jane/cv", "<p>cv</p>");

        let mut step = ScrapeStep { browser: &mut browser, store: &store, topic: Topic::Cv };
        let report = runner.run(&mut step, std::slice::from_ref(&seed)).await;

        assert_eq!(report.done, 1);
        assert_eq!(store.read(Stage::Raw(Topic::Cv), &seed.key).unwrap(), "<p>cv</p>");
        assert_eq!(store.read(Stage::Source(Topic::Cv), &seed.key).unwrap(), "https://a.edu/jane/cv");
    }

    #[tokio::test]
    async fn missing_upstream_is_empty_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seeds = vec![Seed::from_person("Nobody", None)];

        let mut clean = CleanStep { store: &store, topic: Topic::Cv };
        let report = runner.run(&mut clean, &seeds).await;
        assert_eq!(report.empty, 1);

        let mut browser = MockBrowser::default();
        let mut scrape = ScrapeStep { browser: &mut browser, store: &store, topic: Topic::Group };
        let report = runner.run(&mut scrape, &seeds).await;
        assert_eq!(report.empty, 1);
        assert_eq!(browser.visits(), 0);
    }

    #[tokio::test]
    async fn group_extract_accepts_array_reply() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let seed = Seed::from_person("Jane Doe", None);
        store.write(Stage::Markdown(Topic::Group), &seed.key, "team").unwrap();
        let llm = MockCompletion::new([
            "```json\n[{\"name\": \"Ann\", \"title\": \"PhD student\", \"is_alumni\": false}]\n```",
        ]);

        let mut step = ExtractStep { store: &store, llm: &llm, topic: Topic::Group, max_tries: 3 };
        runner.run(&mut step, std::slice::from_ref(&seed)).await;

        let members: Vec<GroupMember> = store.read_jsonl(Stage::Extract(Topic::Group), &seed.key).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].title, "PhD student");
        assert_eq!(members[0].is_alumni, Some(false));
    }

    #[tokio::test]
    async fn missing_converter_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let mut settings = Settings::default();
        settings.pandoc_cmd = "definitely-not-a-real-pandoc-binary".into();
        settings.retry.batch_attempts = 3;
        settings.retry.sleep_secs = 0;
        let seeds = vec![faculty_seed(), Seed::from_url("https://www.example.edu/staff")];
        let mut browser = MockBrowser::default()
            .with_page("https://www.example.edu/people", FACULTY_PAGE)
            .with_page("https://www.example.edu/staff", FACULTY_PAGE);
        let llm = MockCompletion::new([FACULTY_REPLY]);

        let reports = run_topic(&runner, &settings, &mut browser, &llm, Topic::Faculty, &seeds).await;

        let stages: Vec<Stage> = reports.iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            vec![Stage::Raw(Topic::Faculty), Stage::Clean(Topic::Faculty), Stage::Markdown(Topic::Faculty)]
        );
        let convert = reports.last().unwrap();
        assert_eq!(convert.failed.len(), 1);
        assert!(convert.ensure_not_aborted().is_err());
        assert_eq!(llm.calls(), 0);
    }
}
