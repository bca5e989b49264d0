mod aggregate;
mod browser;
mod clean;
mod config;
mod convert;
mod error;
mod key;
mod llm;
mod pipeline;
mod prompt;
mod records;
mod runner;
mod scholar;
mod search;
mod seeds;
mod store;
mod validate;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::aggregate::Filter;
use crate::config::Settings;
use crate::convert::Converter;
use crate::llm::ChatClient;
use crate::pipeline::{CleanStep, ConvertStep, ExtractStep, ScrapeStep, SearchStep};
use crate::records::Seed;
use crate::runner::{BatchReport, StageRunner};
use crate::seeds::Columns;
use crate::store::{ArtifactStore, Stage, Topic};

#[derive(Parser)]
#[command(name = "faculty_hunter", about = "Find faculty, CVs and research group members on the web")]
struct Cli {
    /// Config file (default: ~/.faculty_hunter.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Output directory, one sub-directory per entity
    #[arg(short, long, global = true)]
    out_dir: Option<PathBuf>,
    /// Override a setting for this run, e.g. --set llm.model=gpt-4o
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = config::parse_override, global = true)]
    overrides: Vec<(String, String)>,
    /// Debug logging (RUST_LOG wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create one entity directory per URL line or spreadsheet row
    Init {
        /// URL list or spreadsheet (csv, tsv, xlsx, xls, ods); globs allowed
        #[arg(required = true)]
        inputs: Vec<String>,
        #[arg(long, default_value = "name")]
        name_col: String,
        #[arg(long, default_value = "institute")]
        institute_col: String,
        #[arg(long, default_value = "url")]
        url_col: String,
    },
    /// Search the web for each person and cache ranked results
    Search {
        #[arg(value_enum, default_value = "cv")]
        topic: Topic,
    },
    /// Fetch the page of each entity
    Scrape {
        #[arg(value_enum, default_value = "faculty")]
        topic: Topic,
    },
    /// Strip scraped pages down to structure and text
    Clean {
        #[arg(value_enum, default_value = "faculty")]
        topic: Topic,
    },
    /// Convert cleaned pages to Markdown, or a single file with --input
    Convert {
        #[arg(value_enum, default_value = "faculty")]
        topic: Topic,
        /// Convert this HTML file instead of the store
        #[arg(long, requires = "output")]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Extract structured records from Markdown with the LLM
    Extract {
        #[arg(value_enum, default_value = "faculty")]
        topic: Topic,
    },
    /// Every stage for a topic, each with batch retry
    Run {
        #[arg(value_enum, default_value = "faculty")]
        topic: Topic,
    },
    /// Merge extracted records into one table
    Aggregate {
        /// Artifact globs, e.g. "out/*/faculty.jsonl" (default: every artifact of --topic)
        patterns: Vec<String>,
        #[arg(long, value_enum, default_value = "faculty")]
        topic: Topic,
        #[arg(short, long, value_enum, default_value = "all")]
        filter: Filter,
        /// Write CSV (or TSV for .tsv) here
        #[arg(long)]
        output: Option<PathBuf>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Google Scholar author search
    Scholar {
        #[command(subcommand)]
        command: ScholarCommand,
    },
    /// Read or edit the persisted config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ScholarCommand {
    /// Search articles by author and append them to gs_result.jsonl
    Authors {
        /// File with one author name per line
        authors: PathBuf,
    },
    /// Print the distinct author profile URLs found so far
    Profiles {
        /// Result file (default: <out_dir>/gs_result.jsonl)
        file: Option<PathBuf>,
        /// Print profile ids instead of URLs
        #[arg(long)]
        ids: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get { key: String },
    /// Value is parsed as JSON when possible, otherwise stored as a string
    Set { key: String, value: String },
    Unset { key: String },
    /// Print the effective settings after every layer is applied
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let t0 = Instant::now();
    let config_file = cli.config.clone().unwrap_or_else(config::default_config_file);
    let mut overrides = cli.overrides.clone();
    if let Some(dir) = &cli.out_dir {
        overrides.push(("out_dir".into(), dir.to_string_lossy().into_owned()));
    }
    let settings = Settings::load(&config_file, &overrides)
        .with_context(|| format!("loading settings from {}", config_file.display()))?;
    let store = ArtifactStore::new(&settings.out_dir);

    let result = match cli.command {
        Commands::Init { inputs, name_col, institute_col, url_col } => {
            let cols = Columns { name: name_col, institute: institute_col, url: url_col };
            let mut all = Vec::new();
            for path in seeds::expand_globs(&inputs, true)? {
                let loaded = seeds::load_seeds(&path, &cols)
                    .with_context(|| format!("reading {}", path.display()))?;
                println!("{}: {} seeds", path.display(), loaded.len());
                all.extend(loaded);
            }
            let (created, existing) = seeds::init_entities(&store, &all)?;
            println!(
                "Created {} entities ({} already present) in {}",
                created,
                existing,
                store.root().display()
            );
            Ok(())
        }
        Commands::Search { topic } => {
            let Some(entities) = entities(&store)? else { return Ok(()) };
            let mut browser = browser::launch(&settings.browser)?;
            let mut step = SearchStep { browser: browser.as_mut(), settings: &settings.search, topic };
            let report = StageRunner::new(&store).retry_batch(&mut step, &entities, &settings.retry).await;
            report.print();
            Ok(())
        }
        Commands::Scrape { topic } => {
            let Some(entities) = entities(&store)? else { return Ok(()) };
            let mut browser = browser::launch(&settings.browser)?;
            let mut step = ScrapeStep { browser: browser.as_mut(), store: &store, topic };
            let report = StageRunner::new(&store).retry_batch(&mut step, &entities, &settings.retry).await;
            report.print();
            Ok(())
        }
        Commands::Clean { topic } => {
            let Some(entities) = entities(&store)? else { return Ok(()) };
            let mut step = CleanStep { store: &store, topic };
            StageRunner::new(&store).run(&mut step, &entities).await.print();
            Ok(())
        }
        Commands::Convert { topic, input, output } => {
            let converter = Converter::new(&settings.pandoc_cmd, settings.suppress_raw_html);
            match (input, output) {
                (Some(input), Some(output)) => {
                    converter.convert_file(&input, &output).await?;
                    println!("Converted {} -> {}", input.display(), output.display());
                }
                _ => {
                    let Some(entities) = entities(&store)? else { return Ok(()) };
                    let mut step = ConvertStep { store: &store, converter: &converter, topic };
                    let report = StageRunner::new(&store).run(&mut step, &entities).await;
                    report.print();
                    report.ensure_not_aborted()?;
                }
            }
            Ok(())
        }
        Commands::Extract { topic } => {
            let Some(entities) = entities(&store)? else { return Ok(()) };
            let llm = ChatClient::new(&settings.llm, settings.audit_log_path())?;
            let mut step = ExtractStep { store: &store, llm: &llm, topic, max_tries: settings.llm.max_tries };
            let report = StageRunner::new(&store).retry_batch(&mut step, &entities, &settings.retry).await;
            report.print();
            Ok(())
        }
        Commands::Run { topic } => {
            let Some(entities) = entities(&store)? else { return Ok(()) };
            let mut browser = browser::launch(&settings.browser)?;
            let llm = ChatClient::new(&settings.llm, settings.audit_log_path())?;
            println!("Pipeline: {} for {} entities...", topic, entities.len());
            let runner = StageRunner::new(&store);
            let reports =
                pipeline::run_topic(&runner, &settings, browser.as_mut(), &llm, topic, &entities).await;
            for r in &reports {
                r.print();
            }
            reports.iter().try_for_each(BatchReport::ensure_not_aborted)
        }
        Commands::Aggregate { patterns, topic, filter, output, limit } => {
            let patterns = if patterns.is_empty() {
                let file = Stage::Extract(topic).file_name();
                vec![format!("{}/*/{}", store.root().display(), file)]
            } else {
                patterns
            };
            let table = aggregate::aggregate(&patterns, filter)?;
            if table.is_empty() {
                println!("No records found.");
                return Ok(());
            }
            if let Some(path) = &output {
                table.write(path)?;
                println!("Wrote {} rows to {}", table.rows.len(), path.display());
            }
            println!("{}", table.head(limit).render(settings.table_max_width));
            println!("\n{} records", table.rows.len());
            Ok(())
        }
        Commands::Scholar { command } => match command {
            ScholarCommand::Authors { authors } => {
                let names = read_lines(&authors)?;
                if names.is_empty() {
                    println!("No authors in {}.", authors.display());
                    return Ok(());
                }
                let out = store.root().join(scholar::RESULT_FILE);
                let mut browser = browser::launch(&settings.browser)?;
                let wait = Duration::from_secs(settings.browser.timeout_secs);
                println!("Searching {} authors on Google Scholar...", names.len());
                let report =
                    scholar::search_by_authors(browser.as_mut(), &settings.scholar, wait, &names, &out).await?;
                println!(
                    "Done: {} new articles, {} already present, {} failed -> {}",
                    report.appended,
                    report.skipped,
                    report.failed,
                    out.display()
                );
                Ok(())
            }
            ScholarCommand::Profiles { file, ids } => {
                let file = file.unwrap_or_else(|| store.root().join(scholar::RESULT_FILE));
                for url in scholar::list_profile_urls(&file)? {
                    if ids {
                        if let Some(id) = scholar::profile_id(&url) {
                            println!("{}", id);
                        }
                    } else {
                        println!("{}", url);
                    }
                }
                Ok(())
            }
        },
        Commands::Config { command } => match command {
            ConfigCommand::Get { key } => {
                match config::get_value(&config_file, &key)? {
                    Some(v) => println!("{}", serde_json::to_string_pretty(&v)?),
                    None => println!("{} is not set in {}", key, config_file.display()),
                }
                Ok(())
            }
            ConfigCommand::Set { key, value } => {
                config::set_value(&config_file, &key, &value)?;
                println!("Set {} in {}", key, config_file.display());
                Ok(())
            }
            ConfigCommand::Unset { key } => {
                if config::unset_value(&config_file, &key)? {
                    println!("Removed {} from {}", key, config_file.display());
                } else {
                    println!("{} is not set in {}", key, config_file.display());
                }
                Ok(())
            }
            ConfigCommand::Show => {
                println!("{}", serde_json::to_string_pretty(&settings)?);
                Ok(())
            }
        },
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Every initialised entity, or `None` (with a hint) when there are none.
fn entities(store: &ArtifactStore) -> anyhow::Result<Option<Vec<Seed>>> {
    if !store.root().exists() {
        println!("No entities in {}. Run 'init' first.", store.root().display());
        return Ok(None);
    }
    let seeds = seeds::load_entities(store)?;
    if seeds.is_empty() {
        println!("No entities in {}. Run 'init' first.", store.root().display());
        return Ok(None);
    }
    Ok(Some(seeds))
}

fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
