//! Run one pipeline stage over a batch of entities.
//!
//! An entity whose output artifact already exists is skipped, so re-running
//! an interrupted batch only redoes what is missing. A failing entity is
//! recorded in the report and the batch moves on.

use std::time::Duration;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::config::RetrySettings;
use crate::error::HunterError;
use crate::records::Seed;
use crate::store::{ArtifactStore, Stage};

/// One stage's work for one entity.
#[async_trait]
pub trait Step: Send {
    /// The artifact this step produces.
    fn stage(&self) -> Stage;

    /// Produce the artifact content, or `None` when there is nothing to
    /// write (e.g. the upstream artifact is missing).
    async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Skipped,
    Empty,
    Failed(String),
    /// Failed in a way every remaining entity would too.
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub stage: Stage,
    pub done: usize,
    pub skipped: usize,
    pub empty: usize,
    pub failed: Vec<(String, String)>,
    /// Set when the batch stopped early on a fatal error.
    pub aborted: Option<String>,
}

impl BatchReport {
    fn new(stage: Stage) -> Self {
        BatchReport {
            stage,
            done: 0,
            skipped: 0,
            empty: 0,
            failed: Vec::new(),
            aborted: None,
        }
    }

    fn record(&mut self, key: &str, outcome: Outcome) {
        match outcome {
            Outcome::Done => self.done += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Empty => self.empty += 1,
            Outcome::Failed(reason) => self.failed.push((key.to_string(), reason)),
            Outcome::Aborted(reason) => {
                self.failed.push((key.to_string(), reason.clone()));
                self.aborted = Some(reason);
            }
        }
    }

    pub fn total(&self) -> usize {
        self.done + self.skipped + self.empty + self.failed.len()
    }

    /// Fold a retry's report into this one. Entities finished by an earlier
    /// attempt show up as skipped in the retry and are counted once.
    fn absorb_retry(&mut self, next: BatchReport) {
        let carried = self.done;
        self.done += next.done;
        self.skipped = next.skipped.saturating_sub(carried);
        self.empty = next.empty;
        self.failed = next.failed;
        self.aborted = next.aborted;
    }

    /// An error when the batch was aborted.
    pub fn ensure_not_aborted(&self) -> anyhow::Result<()> {
        match &self.aborted {
            Some(reason) => anyhow::bail!("{} aborted: {}", self.stage, reason),
            None => Ok(()),
        }
    }

    pub fn print(&self) {
        println!(
            "{}: {} entities, {} done, {} skipped, {} empty, {} failed",
            self.stage,
            self.total(),
            self.done,
            self.skipped,
            self.empty,
            self.failed.len()
        );
        for (key, reason) in &self.failed {
            println!("  ✗ {}: {}", key, reason);
        }
        if let Some(reason) = &self.aborted {
            println!("  stopped early: {}", reason);
        }
    }
}

pub struct StageRunner<'a> {
    store: &'a ArtifactStore,
    progress: bool,
}

impl<'a> StageRunner<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        StageRunner { store, progress: true }
    }

    pub fn quiet(store: &'a ArtifactStore) -> Self {
        StageRunner { store, progress: false }
    }

    pub fn store(&self) -> &'a ArtifactStore {
        self.store
    }

    async fn run_one(&self, step: &mut dyn Step, seed: &Seed) -> Outcome {
        let stage = step.stage();
        if self.store.exists(stage, &seed.key) {
            info!("{} exists for {}, skipping", stage, seed.key);
            return Outcome::Skipped;
        }
        match step.run(seed).await {
            Ok(Some(content)) => match self.store.write(stage, &seed.key, &content) {
                Ok(path) => {
                    info!("{} saved to {}", stage, path.display());
                    Outcome::Done
                }
                Err(e) => {
                    warn!("{} failed to save for {}: {}", stage, seed.key, e);
                    Outcome::Failed(e.to_string())
                }
            },
            Ok(None) => Outcome::Empty,
            Err(e) if e.downcast_ref::<HunterError>().is_some_and(HunterError::is_fatal) => {
                error!("{} failed for {}, stopping batch: {:#}", stage, seed.label(), e);
                Outcome::Aborted(format!("{:#}", e))
            }
            Err(e) => {
                warn!("{} failed for {}: {:#}", stage, seed.label(), e);
                Outcome::Failed(format!("{:#}", e))
            }
        }
    }

    /// Run `step` over `seeds` in input order.
    pub async fn run(&self, step: &mut dyn Step, seeds: &[Seed]) -> BatchReport {
        let stage = step.stage();
        let pb = if self.progress {
            let pb = ProgressBar::new(seeds.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] {bar:40} {pos}/{len} (eta {eta})")
            {
                pb.set_style(style.progress_chars("=> "));
            }
            pb.set_message(stage.to_string());
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut report = BatchReport::new(stage);
        for seed in seeds {
            let outcome = self.run_one(step, seed).await;
            report.record(&seed.key, outcome);
            pb.inc(1);
            if report.aborted.is_some() {
                break;
            }
        }
        pb.finish_and_clear();

        info!(
            "{}: {} done, {} skipped, {} empty, {} failed",
            stage,
            report.done,
            report.skipped,
            report.empty,
            report.failed.len()
        );
        report
    }

    /// Re-run the whole batch while it reports failures, with a fixed sleep
    /// between attempts and at most `policy.batch_attempts` attempts.
    pub async fn retry_batch(
        &self,
        step: &mut dyn Step,
        seeds: &[Seed],
        policy: &RetrySettings,
    ) -> BatchReport {
        let attempts = policy.batch_attempts.max(1);
        let mut report = self.run(step, seeds).await;
        for attempt in 2..=attempts {
            if report.failed.is_empty() || report.aborted.is_some() {
                break;
            }
            warn!(
                "{}: {} failures, retrying batch in {}s (attempt {}/{})",
                report.stage,
                report.failed.len(),
                policy.sleep_secs,
                attempt,
                attempts
            );
            tokio::time::sleep(Duration::from_secs(policy.sleep_secs)).await;
            let next = self.run(step, seeds).await;
            report.absorb_retry(next);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::store::Topic;

    /// Produces `"{key}!"`, failing for keys listed in `fail_times` until
    /// they have failed that many times.
    struct Echo {
        calls: usize,
        fail_times: HashMap<String, usize>,
        empty_for: Option<String>,
        fatal_for: Option<String>,
    }

    impl Echo {
        fn new() -> Self {
            Echo { calls: 0, fail_times: HashMap::new(), empty_for: None, fatal_for: None }
        }
    }

    #[async_trait]
    impl Step for Echo {
        fn stage(&self) -> Stage {
            Stage::Raw(Topic::Faculty)
        }

        async fn run(&mut self, seed: &Seed) -> anyhow::Result<Option<String>> {
            self.calls += 1;
            if self.empty_for.as_deref() == Some(seed.key.as_str()) {
                return Ok(None);
            }
            if self.fatal_for.as_deref() == Some(seed.key.as_str()) {
                return Err(HunterError::ConverterMissing { cmd: "pandoc".into() }.into());
            }
            if let Some(left) = self.fail_times.get_mut(&seed.key) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("boom on {}", seed.key);
                }
            }
            Ok(Some(format!("{}!", seed.key)))
        }
    }

    fn seeds(keys: &[&str]) -> Vec<Seed> {
        keys.iter()
            .map(|k| Seed { key: k.to_string(), ..Default::default() })
            .collect()
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let batch = seeds(&["a", "b"]);

        let mut step = Echo::new();
        let first = runner.run(&mut step, &batch).await;
        assert_eq!(first.done, 2);
        assert_eq!(step.calls, 2);
        assert_eq!(store.read(Stage::Raw(Topic::Faculty), "a").unwrap(), "a!");

        let mut again = Echo::new();
        let second = runner.run(&mut again, &batch).await;
        assert_eq!(second.skipped, 2);
        assert_eq!(second.done, 0);
        assert_eq!(again.calls, 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);

        let mut step = Echo::new();
        step.fail_times.insert("b".into(), usize::MAX);
        step.empty_for = Some("c".into());
        let report = runner.run(&mut step, &seeds(&["a", "b", "c", "d"])).await;

        assert_eq!(report.done, 2);
        assert_eq!(report.empty, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(report.failed[0].1.contains("boom"));
        assert_eq!(report.total(), 4);
        assert!(!store.exists(Stage::Raw(Topic::Faculty), "b"));
        assert!(!store.exists(Stage::Raw(Topic::Faculty), "c"));
    }

    #[tokio::test]
    async fn batch_retry_redoes_only_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let policy = RetrySettings { batch_attempts: 3, sleep_secs: 0 };

        let mut step = Echo::new();
        step.fail_times.insert("b".into(), 1);
        let report = runner.retry_batch(&mut step, &seeds(&["a", "b"]), &policy).await;

        assert_eq!(report.done, 2);
        assert_eq!(report.skipped, 0);
        assert!(report.failed.is_empty());
        // a, b (fails), then only b again.
        assert_eq!(step.calls, 3);
    }

    #[tokio::test]
    async fn batch_retry_has_a_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let policy = RetrySettings { batch_attempts: 2, sleep_secs: 0 };

        let mut step = Echo::new();
        step.fail_times.insert("x".into(), usize::MAX);
        let report = runner.retry_batch(&mut step, &seeds(&["x"]), &policy).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(step.calls, 2);
    }

    #[tokio::test]
    async fn fatal_error_stops_batch_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let runner = StageRunner::quiet(&store);
        let policy = RetrySettings { batch_attempts: 3, sleep_secs: 0 };

        let mut step = Echo::new();
        step.fatal_for = Some("b".into());
        let report = runner.retry_batch(&mut step, &seeds(&["a", "b", "c"]), &policy).await;

        // a, then b aborts; c is never tried and there is no second attempt.
        assert_eq!(step.calls, 2);
        assert_eq!(report.done, 1);
        assert_eq!(report.failed.len(), 1);
        let reason = report.aborted.clone().unwrap();
        assert!(reason.contains("`pandoc` not found"), "{reason}");
        assert!(report.ensure_not_aborted().is_err());
        assert!(!store.exists(Stage::Raw(Topic::Faculty), "c"));
    }
}
