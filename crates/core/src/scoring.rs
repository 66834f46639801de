//! Tag-based scoring.
//!
//! Treats tags as conditionally independent given the good/bad label:
//!
//! ```text
//! predict(T) = P(G) * prod over t in T of P(t | G) / P(t)
//! ```
//!
//! with `P(G) = good / labeled`, `P(t | G) = good_with_t / good` and
//! `P(t) = labeled_with_t / labeled`. Tags no labeled record carries are
//! neutral. The independence assumption is false for correlated tags, so
//! scores are not probabilities and can exceed 1.0; only their relative
//! order means anything.

use crate::record::Record;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use storage::{FeedbackStore, Label};

const NO_DATA_PRIOR: f64 = 0.5;
const NO_DATA_TAG_GIVEN_GOOD: f64 = 0.5;
const NO_DATA_TAG: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub good: usize,
    pub total: usize,
}

/// Label totals over every vote, and per-tag counts over the labeled
/// records whose tags are known.
#[derive(Debug, Clone, Default)]
pub struct TagStatistics {
    good: usize,
    total: usize,
    tags: HashMap<String, TagCount>,
}

impl TagStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one labeled item. Repeated tags count once.
    pub fn add<I, S>(&mut self, tags: I, label: Label)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.total += 1;
        if label.is_good() {
            self.good += 1;
        }
        let mut seen = HashSet::new();
        for tag in tags {
            let tag = tag.as_ref();
            if !seen.insert(tag.to_string()) {
                continue;
            }
            let count = self.tags.entry(tag.to_string()).or_default();
            count.total += 1;
            if label.is_good() {
                count.good += 1;
            }
        }
    }

    pub fn good(&self) -> usize {
        self.good
    }

    pub fn bad(&self) -> usize {
        self.total - self.good
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn tag(&self, tag: &str) -> Option<TagCount> {
        self.tags.get(tag).copied()
    }

    /// Number of distinct tags seen on labeled records.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagFactor {
    pub tag: String,
    pub good: usize,
    pub total: usize,
    pub factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    stats: TagStatistics,
}

impl ScoringEngine {
    pub fn new(stats: TagStatistics) -> Self {
        Self { stats }
    }

    pub fn from_labeled<I, T, S>(items: I) -> Self
    where
        I: IntoIterator<Item = (T, Label)>,
        T: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stats = TagStatistics::new();
        for (tags, label) in items {
            stats.add(tags, label);
        }
        Self { stats }
    }

    /// Rebuilds statistics from every vote. Votes on records that are no
    /// longer cached count toward `good` and `total` but add no tags.
    pub async fn build(feedback: &FeedbackStore) -> anyhow::Result<Self> {
        let labeled = feedback.labeled_records().await?;
        let mut engine = Self::from_labeled(
            labeled
                .iter()
                .map(|(row, label)| (row.tags.split_whitespace(), *label)),
        );
        for (_, label) in feedback.dangling().await? {
            engine.stats.add(std::iter::empty::<&str>(), label);
        }
        tracing::debug!(
            good = engine.stats.good(),
            bad = engine.stats.bad(),
            tags = engine.stats.tag_count(),
            "Built tag statistics"
        );
        Ok(engine)
    }

    pub fn statistics(&self) -> &TagStatistics {
        &self.stats
    }

    /// P(G): the share of labeled records that are good.
    pub fn prior(&self) -> f64 {
        if self.stats.total == 0 {
            return NO_DATA_PRIOR;
        }
        self.stats.good as f64 / self.stats.total as f64
    }

    /// P(t | G)
    pub fn p_tag_given_good(&self, tag: &str) -> f64 {
        if self.stats.good == 0 {
            return if self.stats.total > 0 {
                0.0
            } else {
                NO_DATA_TAG_GIVEN_GOOD
            };
        }
        let good = self.stats.tag(tag).map_or(0, |c| c.good);
        good as f64 / self.stats.good as f64
    }

    /// P(t)
    pub fn p_tag(&self, tag: &str) -> f64 {
        if self.stats.total == 0 {
            return NO_DATA_TAG;
        }
        let total = self.stats.tag(tag).map_or(0, |c| c.total);
        total as f64 / self.stats.total as f64
    }

    /// P(t | G) / P(t), or 1 for a tag no labeled record carries.
    pub fn factor(&self, tag: &str) -> f64 {
        match self.stats.tag(tag) {
            Some(c) if c.total > 0 => self.p_tag_given_good(tag) / self.p_tag(tag),
            _ => 1.0,
        }
    }

    pub fn predict<I, S>(&self, tags: I) -> f64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut prediction = self.prior();
        for tag in tags {
            let tag = tag.as_ref();
            if seen.insert(tag.to_string()) {
                prediction *= self.factor(tag);
            }
        }
        prediction
    }

    /// Natural log of [`predict`](Self::predict), summed rather than
    /// multiplied so long tag lists neither overflow nor underflow. Ranks
    /// identically to `predict` wherever `predict` is finite and non-zero.
    pub fn ln_predict<I, S>(&self, tags: I) -> f64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut score = self.prior().ln();
        for tag in tags {
            let tag = tag.as_ref();
            if seen.insert(tag.to_string()) {
                score += self.factor(tag).ln();
            }
        }
        score
    }

    pub fn predict_record(&self, record: &Record) -> f64 {
        self.predict(&record.tags)
    }

    /// The factor each recognised tag contributes, strongest influence
    /// first. Unrecognised tags are left out since they contribute nothing.
    pub fn explain<I, S>(&self, tags: I) -> Vec<TagFactor>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut factors: Vec<TagFactor> = tags
            .into_iter()
            .filter_map(|tag| {
                let tag = tag.as_ref();
                if !seen.insert(tag.to_string()) {
                    return None;
                }
                let count = self.stats.tag(tag)?;
                Some(TagFactor {
                    tag: tag.to_string(),
                    good: count.good,
                    total: count.total,
                    factor: self.factor(tag),
                })
            })
            .collect();
        factors.sort_by(|a, b| {
            b.factor
                .ln()
                .abs()
                .total_cmp(&a.factor.ln().abs())
                .then_with(|| a.tag.cmp(&b.tag))
        });
        factors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(good: &[&[&str]], bad: &[&[&str]]) -> ScoringEngine {
        ScoringEngine::from_labeled(
            good.iter()
                .map(|t| (t.iter().copied(), Label::Good))
                .chain(bad.iter().map(|t| (t.iter().copied(), Label::Bad))),
        )
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn worked_example() {
        let e = engine(&[&["a", "b"]], &[&["b"]]);
        assert!(close(e.prior(), 0.5));
        assert!(close(e.p_tag_given_good("a"), 1.0));
        assert!(close(e.p_tag("a"), 0.5));
        assert!(close(e.factor("a"), 2.0));
        assert!(close(e.predict(["a"]), 1.0));
        assert!(close(e.factor("b"), 1.0));
        assert!(close(e.predict(["b"]), 0.5));
    }

    #[test]
    fn no_data_is_a_constant_half() {
        let e = ScoringEngine::default();
        assert!(close(e.predict(Vec::<&str>::new()), 0.5));
        assert!(close(e.predict(["anything", "at", "all"]), 0.5));
    }

    #[test]
    fn unseen_tags_are_neutral() {
        let e = engine(&[&["a"]], &[&["b"], &["c"]]);
        let base = e.predict(["a"]);
        assert!(close(e.predict(["a", "never-seen"]), base));
        assert!(close(e.factor("never-seen"), 1.0));
    }

    #[test]
    fn without_good_votes_recognised_tags_score_zero() {
        let e = engine(&[], &[&["a"], &["b"]]);
        assert!(close(e.prior(), 0.0));
        assert!(close(e.predict(["a"]), 0.0));
        assert!(close(e.predict(["zzz"]), 0.0));
        assert_eq!(e.ln_predict(["a"]), f64::NEG_INFINITY);
    }

    #[test]
    fn adding_tags_that_beat_the_prior_never_lowers_the_score() {
        // x: 2 of 2 good, y: 2 of 3 good; prior is 3/6
        let e = engine(
            &[&["x", "y"], &["x", "y"], &["z"]],
            &[&["y"], &["z"], &["w"]],
        );
        let prior = e.prior();
        for tag in ["x", "y"] {
            let c = e.statistics().tag(tag).unwrap();
            assert!(c.good as f64 / c.total as f64 > prior);
        }
        let a = e.predict(["z"]);
        let b = e.predict(["z", "x"]);
        let c = e.predict(["z", "x", "y"]);
        assert!(b >= a);
        assert!(c >= b);
    }

    #[test]
    fn duplicate_tags_count_once() {
        let e = engine(&[&["a", "a"]], &[&["b"]]);
        assert_eq!(e.statistics().tag("a"), Some(TagCount { good: 1, total: 1 }));
        assert!(close(e.predict(["a", "a"]), e.predict(["a"])));
    }

    #[test]
    fn ln_predict_orders_like_predict() {
        let e = engine(&[&["a", "b"], &["a"]], &[&["b"], &["c"]]);
        let sets: [&[&str]; 4] = [&["a"], &["b"], &["a", "b"], &["c"]];
        for x in sets {
            for y in sets {
                let by_product = e.predict(x.iter()).partial_cmp(&e.predict(y.iter()));
                let by_log = e.ln_predict(x.iter()).partial_cmp(&e.ln_predict(y.iter()));
                assert_eq!(by_product, by_log, "{x:?} vs {y:?}");
            }
        }
    }

    #[test]
    fn explain_lists_strongest_influence_first() {
        let e = engine(&[&["a", "b"], &["a"]], &[&["b"], &["c"]]);
        let explained = e.explain(["c", "b", "a", "unknown"]);
        let tags: Vec<&str> = explained.iter().map(|f| f.tag.as_str()).collect();
        // c has factor 0, a has 2, b has 1
        assert_eq!(tags, vec!["c", "a", "b"]);
    }
}
