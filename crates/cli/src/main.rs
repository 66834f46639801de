use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use finder_core::audit;
use finder_core::config;
use finder_core::config::AppConfig;
use finder_core::pipeline::{self, Stores};
use finder_core::rate_limit::RateLimiter;
use finder_core::scoring::ScoringEngine;
use finder_core::selector::{Mode, SelectError, Selector};
use finder_core::snapshot;
use finder_core::sync::SyncStart;
use finder_core::votes::GOOD_VOTE_LEVELS;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use storage::Label;
use tracing_subscriber::EnvFilter;
mod render;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync { full, from, json } => {
            let start = match (full, from) {
                (_, Some(id)) => SyncStart::FromId(id),
                (true, None) => SyncStart::FromId(1),
                (false, None) => SyncStart::Resume,
            };
            run_sync(cfg, start, json).await
        }
        Commands::Vote { id, verdict } => run_vote(cfg, id, &verdict).await,
        Commands::Next {
            mode,
            count,
            require,
            exclude,
            json,
        } => run_next(cfg, mode, count, require, exclude, json).await,
        Commands::Predict {
            tags,
            explain,
            json,
        } => run_predict(cfg, tags, explain, json).await,
        Commands::Stats { json } => run_stats(cfg, json).await,
        Commands::Audit { sample, seed, json } => run_audit(cfg, sample, seed, json).await,
        Commands::Export { path } => run_export(cfg, path).await,
        Commands::Import { path, replace } => run_import(cfg, path, replace).await,
        Commands::Prune { dry_run } => run_prune(cfg, dry_run).await,
        Commands::ImportVotes { user, level, json } => run_import_votes(cfg, user, level, json).await,
        Commands::Reset { yes } => run_reset(cfg, yes).await,
    }
}

#[derive(Parser)]
#[command(name = "post-finder")]
#[command(about = "Mirror a booru index locally and rank unseen posts by your votes", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the local cache up to date with the remote
    Sync {
        /// Re-walk every id from 1, deleting records the remote no longer has
        #[arg(long, conflicts_with = "from")]
        full: bool,
        /// Start from this id instead of after the highest cached one
        #[arg(long)]
        from: Option<i64>,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Record a verdict on a post: good, bad or clear
    Vote { id: i64, verdict: String },
    /// Suggest the next post(s) to look at
    Next {
        /// Selection mode: best|random|hot
        #[arg(long, default_value = "best")]
        mode: Mode,
        /// Number of posts to suggest
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Only suggest posts carrying this tag (repeatable)
        #[arg(long = "require", value_name = "TAG")]
        require: Vec<String>,
        /// Never suggest posts carrying this tag (repeatable)
        #[arg(long = "exclude", value_name = "TAG")]
        exclude: Vec<String>,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Score an arbitrary tag set
    Predict {
        #[arg(required = true, num_args = 1..)]
        tags: Vec<String>,
        /// Show each tag's contribution
        #[arg(long)]
        explain: bool,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Cache and vote counts
    Stats {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a random sample of ids against the remote
    Audit {
        /// Number of ids to check
        #[arg(long, default_value_t = 300)]
        sample: usize,
        /// Seed for the id sample, for repeatable audits
        #[arg(long)]
        seed: Option<u64>,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the cache and votes to a JSON snapshot
    Export { path: PathBuf },
    /// Load a JSON snapshot into the database
    Import {
        path: PathBuf,
        /// Erase the cached posts and all votes before importing
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
    /// Remove votes for posts that are no longer cached
    Prune {
        /// Only list what would be removed
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Label good every post a remote user voted on
    ImportVotes {
        user: String,
        /// Vote level to import (repeatable): 3 favorite, 2 great, 1 good
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3), default_values_t = GOOD_VOTE_LEVELS)]
        level: Vec<u8>,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Erase the local post cache; votes are kept
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

async fn run_sync(cfg: AppConfig, start: SyncStart, json: bool) -> Result<()> {
    let report = pipeline::run_sync(&cfg, start).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render::sync_summary(&report));
    }
    Ok(())
}

async fn run_vote(cfg: AppConfig, id: i64, verdict: &str) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    if verdict.eq_ignore_ascii_case("clear") {
        if stores.feedback.clear(id).await? {
            println!("#{id}: cleared");
        } else {
            println!("#{id}: had no vote");
        }
        return Ok(());
    }
    let label: Label = verdict.parse()?;
    if !stores.cache.contains(id).await? {
        tracing::warn!(id, "Voting on a post that is not cached; it won't affect scoring until synced");
    }
    match stores.feedback.vote(id, label).await? {
        Some(previous) if previous != label => println!("#{id}: {previous} -> {label}"),
        Some(_) => println!("#{id}: already {label}"),
        None => println!("#{id}: {label}"),
    }
    Ok(())
}

async fn run_next(
    cfg: AppConfig,
    mode: Mode,
    count: usize,
    require: Vec<String>,
    exclude: Vec<String>,
    json: bool,
) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let mut selector = Selector::new(&stores.cache, &stores.feedback, &cfg.selector)
        .with_tag_filter(require, exclude);
    let mut picks = Vec::with_capacity(count);
    for _ in 0..count.max(1) {
        match selector.pick(mode).await {
            Ok(pick) => picks.push(pick),
            Err(SelectError::NoCandidates) => break,
            Err(SelectError::Storage(e)) => return Err(e),
        }
    }
    if json {
        let rows: Vec<serde_json::Value> = picks
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.record.id,
                    "prediction": p.prediction,
                    "mode": p.mode,
                    "url": p.record.page_url(&cfg.remote.base_url),
                    "record": p.record,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if picks.is_empty() {
        println!("Nothing left to suggest. Run `post-finder sync` to fetch new posts.");
    } else {
        for pick in &picks {
            println!("{}", render::pick_line(pick, &cfg.remote.base_url));
        }
    }
    Ok(())
}

async fn run_predict(cfg: AppConfig, tags: Vec<String>, explain: bool, json: bool) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let engine = ScoringEngine::build(&stores.feedback).await?;
    let prediction = engine.predict(&tags);
    let factors = if explain {
        engine.explain(&tags)
    } else {
        Vec::new()
    };
    if json {
        let out = serde_json::json!({
            "tags": tags,
            "prediction": prediction,
            "factors": factors,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{prediction:.6}");
        if explain {
            print!("{}", render::explain_table(engine.prior(), &factors));
        }
    }
    Ok(())
}

async fn run_stats(cfg: AppConfig, json: bool) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let stats = collect_stats(&stores).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", render::stats_table(&stats));
    }
    Ok(())
}

async fn collect_stats(stores: &Stores) -> Result<render::Stats> {
    let (good, bad) = stores.feedback.counts().await?;
    let engine = ScoringEngine::build(&stores.feedback).await?;
    Ok(render::Stats {
        cached: stores.cache.count().await?,
        highest_id: stores.cache.highest_id().await?,
        unlabeled: stores.cache.unlabeled_ids().await?.len(),
        good,
        bad,
        dangling_votes: stores.feedback.dangling().await?.len(),
        known_tags: engine.statistics().tag_count(),
        prior: engine.prior(),
    })
}

async fn run_audit(cfg: AppConfig, sample: usize, seed: Option<u64>, json: bool) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let remote = pipeline::build_remote(&cfg)?;
    let limiter = RateLimiter::from_config(&cfg.rate_limit);
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let report = audit::audit(&remote, &stores.cache, &limiter, sample, &mut rng).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render::audit_summary(&report));
    }
    if !report.is_clean() {
        bail!(
            "{} discrepancies found; `post-finder sync --full` repairs them",
            report.discrepancies.len()
        );
    }
    Ok(())
}

async fn run_export(cfg: AppConfig, path: PathBuf) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let snap = snapshot::export(&stores.cache, &stores.feedback, &path).await?;
    println!(
        "Exported {} posts, {} good, {} bad to {}",
        snap.records.len(),
        snap.good.len(),
        snap.bad.len(),
        path.display()
    );
    Ok(())
}

async fn run_import(cfg: AppConfig, path: PathBuf, replace: bool) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let snap = snapshot::read(&path).await?;
    let summary = snapshot::import(snap, &stores.cache, &stores.feedback, replace).await?;
    println!("{}", render::sync_summary(&summary.sync));
    println!("Votes: {} good, {} bad", summary.good, summary.bad);
    if !summary.conflicting.is_empty() {
        println!(
            "Skipped {} ids labeled both good and bad",
            summary.conflicting.len()
        );
    }
    Ok(())
}

async fn run_prune(cfg: AppConfig, dry_run: bool) -> Result<()> {
    let stores = pipeline::open_stores(&cfg).await?;
    let dangling = stores.feedback.dangling().await?;
    for (id, label) in &dangling {
        if dry_run {
            println!("would remove #{id} ({label})");
        } else {
            stores.feedback.clear(*id).await?;
            println!("removed #{id} ({label})");
        }
    }
    if dangling.is_empty() {
        println!("No dangling votes");
    }
    Ok(())
}

async fn run_import_votes(cfg: AppConfig, user: String, levels: Vec<u8>, json: bool) -> Result<()> {
    let summary = pipeline::run_vote_import(&cfg, &user, &levels).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}: {} voted posts, {} new good votes, {} already labeled",
            summary.user, summary.found, summary.added, summary.kept
        );
    }
    Ok(())
}

async fn run_reset(cfg: AppConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to erase the post cache without --yes");
    }
    let stores = pipeline::open_stores(&cfg).await?;
    let removed = stores.cache.clear().await?;
    println!("Erased {removed} cached posts. Votes were kept; run `post-finder sync` to refill.");
    Ok(())
}
