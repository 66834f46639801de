//! Picks the next record to show.

use crate::config::SelectorConfig;
use crate::record::Record;
use crate::scoring::ScoringEngine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use storage::{CacheStore, FeedbackStore, RecordRow};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Highest prediction not shown yet this session.
    Best,
    /// Uniform over unlabeled records.
    Random,
    /// Usually best, sometimes random.
    Hot,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Best => "best",
            Mode::Random => "random",
            Mode::Hot => "hot",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best" => Ok(Mode::Best),
            "random" => Ok(Mode::Random),
            "hot" => Ok(Mode::Hot),
            other => Err(format!("unknown mode `{other}` (expected best, random or hot)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no unlabeled records left to choose from")]
    NoCandidates,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct Pick {
    pub record: Record,
    pub prediction: f64,
    /// The mode that actually produced the record. A `hot` request reports
    /// `best` or `random`.
    pub mode: Mode,
}

pub struct Selector<'a> {
    cache: &'a CacheStore,
    feedback: &'a FeedbackStore,
    hot_chance: f64,
    rng: StdRng,
    seen: HashSet<i64>,
    engine: Option<ScoringEngine>,
    require: Vec<String>,
    exclude: Vec<String>,
    /// Candidates ordered worst to best, so the next pick is `pop()`.
    ranked: Option<Vec<(f64, Record)>>,
}

impl<'a> Selector<'a> {
    pub fn new(cache: &'a CacheStore, feedback: &'a FeedbackStore, cfg: &SelectorConfig) -> Self {
        Self::with_rng(cache, feedback, cfg, StdRng::from_entropy())
    }

    /// A selector whose random choices repeat for the same seed.
    pub fn seeded(
        cache: &'a CacheStore,
        feedback: &'a FeedbackStore,
        cfg: &SelectorConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(cache, feedback, cfg, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        cache: &'a CacheStore,
        feedback: &'a FeedbackStore,
        cfg: &SelectorConfig,
        rng: StdRng,
    ) -> Self {
        let hot_chance = if cfg.hot_random_chance.is_finite() {
            cfg.hot_random_chance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            cache,
            feedback,
            hot_chance,
            rng,
            seen: HashSet::new(),
            engine: None,
            require: Vec::new(),
            exclude: Vec::new(),
            ranked: None,
        }
    }

    /// Restricts candidates to records carrying every tag in `require` and
    /// none in `exclude`.
    pub fn with_tag_filter(mut self, require: Vec<String>, exclude: Vec<String>) -> Self {
        self.require = require;
        self.exclude = exclude;
        self.ranked = None;
        self
    }

    /// Drops the cached statistics and ranking. Call after a vote so the
    /// next pick reflects it. The seen set survives.
    pub fn invalidate(&mut self) {
        self.engine = None;
        self.ranked = None;
    }

    pub fn seen(&self) -> &HashSet<i64> {
        &self.seen
    }

    pub async fn pick(&mut self, mode: Mode) -> Result<Pick, SelectError> {
        match mode {
            Mode::Best => self.best().await,
            Mode::Random => self.random().await,
            Mode::Hot => self.hot().await,
        }
    }

    pub async fn best(&mut self) -> Result<Pick, SelectError> {
        if self.ranked.is_none() {
            self.ranked = Some(self.rank().await?);
        }
        let mut next = None;
        if let Some(ranked) = self.ranked.as_mut() {
            while let Some((_, record)) = ranked.pop() {
                // random picks land in `seen` after the ranking was built
                if self.seen.insert(record.id) {
                    next = Some(record);
                    break;
                }
            }
        }
        let record = next.ok_or(SelectError::NoCandidates)?;
        let prediction = self.engine().await?.predict_record(&record);
        Ok(Pick {
            record,
            prediction,
            mode: Mode::Best,
        })
    }

    pub async fn random(&mut self) -> Result<Pick, SelectError> {
        let mut candidates = self.candidates().await?;
        if candidates.is_empty() {
            return Err(SelectError::NoCandidates);
        }
        let index = self.rng.gen_range(0..candidates.len());
        let record = candidates.swap_remove(index);
        let prediction = self.engine().await?.predict_record(&record);
        self.seen.insert(record.id);
        Ok(Pick {
            record,
            prediction,
            mode: Mode::Random,
        })
    }

    pub async fn hot(&mut self) -> Result<Pick, SelectError> {
        if self.rng.gen_bool(self.hot_chance) {
            debug!("Hot pick went random");
            self.random().await
        } else {
            self.best().await
        }
    }

    async fn engine(&mut self) -> anyhow::Result<&ScoringEngine> {
        if self.engine.is_none() {
            self.engine = Some(ScoringEngine::build(self.feedback).await?);
        }
        Ok(self.engine.get_or_insert_with(ScoringEngine::default))
    }

    async fn rank(&mut self) -> anyhow::Result<Vec<(f64, Record)>> {
        let mut candidates = self.candidates().await?;
        candidates.retain(|r| !self.seen.contains(&r.id));
        let engine = self.engine().await?;
        let mut ranked: Vec<(f64, Record)> = candidates
            .into_iter()
            .map(|r| (engine.ln_predict(&r.tags), r))
            .collect();
        // ties go to the newer record
        ranked.sort_by(|(a, ra), (b, rb)| a.total_cmp(b).then(ra.id.cmp(&rb.id)));
        debug!(candidates = ranked.len(), "Ranked unlabeled records");
        Ok(ranked)
    }

    /// Unlabeled records that pass the tag filter, ascending by id.
    async fn candidates(&self) -> anyhow::Result<Vec<Record>> {
        Ok(self
            .cache
            .unlabeled()
            .await?
            .into_iter()
            .filter_map(to_record)
            .filter(|r| r.has_all(&self.require) && !r.has_any(&self.exclude))
            .collect())
    }
}

fn to_record(row: RecordRow) -> Option<Record> {
    let id = row.id;
    match Record::try_from(row) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(id, error = %e, "Skipping unreadable cached record");
            None
        }
    }
}
