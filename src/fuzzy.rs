//! Fuzzy title ranking.
//!
//! Titles and queries are compared after normalization (lowercase, trimmed,
//! inner whitespace collapsed). A candidate's score is the better of:
//!
//! - the full Levenshtein ratio, `100 · (1 − distance / longer length)`;
//! - the best-window ratio, the same measure between the shorter string and
//!   every equally long window of the longer one, weighted by 0.9.
//!
//! The window score lets "fate" find "Fate/Stay Night" without letting a
//! substring hit outrank an exact match.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::background::deadline_after;
use crate::config::Config;
use crate::{GalcacheError, Result};

/// Weight applied to the best-window ratio.
const PARTIAL_WEIGHT: f64 = 0.9;

/// Candidates scored between cooperative yields.
const YIELD_EVERY: usize = 64;

/// Ordered mapping from canonical title to record.
///
/// Built once and replaced wholesale; lookups never see a half-updated index.
#[derive(Debug, Clone)]
pub struct TitleIndex<R> {
    entries: Vec<(String, R)>,
}

impl<R> TitleIndex<R> {
    pub fn new(entries: impl IntoIterator<Item = (String, R)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &R)> {
        self.entries.iter().map(|(title, record)| (title.as_str(), record))
    }
}

impl TitleIndex<()> {
    /// Index of bare titles.
    pub fn from_titles<S: Into<String>>(titles: impl IntoIterator<Item = S>) -> Self {
        Self::new(titles.into_iter().map(|t| (t.into(), ())))
    }
}

impl<R> FromIterator<(String, R)> for TitleIndex<R> {
    fn from_iter<I: IntoIterator<Item = (String, R)>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedTitle<R> {
    pub title: String,
    /// 0–100.
    pub score: u8,
    pub record: R,
}

/// Acceptance floor, truncation and time budget for one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    pub min_score: u8,
    pub max_results: usize,
    pub budget: Duration,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            min_score: 50,
            max_results: 10,
            budget: Duration::from_secs(10),
        }
    }
}

impl MatchOptions {
    /// Floor from [`Config::similarity_floor()`], limits from `search.*`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_score: config.similarity_floor(),
            max_results: config.search.max_results,
            budget: config.search.fuzzy_budget(),
        }
    }

    pub fn min_score(mut self, score: u8) -> Self {
        self.min_score = score.min(100);
        self
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }
}

/// Stateless ranker; safe to share across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyMatcher {
    options: MatchOptions,
}

impl FuzzyMatcher {
    pub fn new(options: MatchOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(MatchOptions::from_config(config))
    }

    pub fn options(&self) -> &MatchOptions {
        &self.options
    }

    /// Rank `index` against `query`.
    ///
    /// Returns candidates scoring at least the floor, best first, ties in
    /// index order, at most `max_results` of them. Fails with
    /// [`GalcacheError::SearchTimeout`] if scoring outlives the budget; no
    /// partial ranking is returned.
    pub async fn search<R: Clone>(
        &self,
        query: &str,
        index: &TitleIndex<R>,
    ) -> Result<Vec<RankedTitle<R>>> {
        let mut ranked = self.rank(query, index).await?;
        ranked.truncate(self.options.max_results);
        Ok(ranked)
    }

    /// Like [`search()`](Self::search), but a record indexed under several
    /// titles is kept once, at its best score. Duplicates are dropped before
    /// truncating, so up to `max_results` distinct records come back.
    pub async fn search_distinct<R, K, F>(
        &self,
        query: &str,
        index: &TitleIndex<R>,
        identity: F,
    ) -> Result<Vec<RankedTitle<R>>>
    where
        R: Clone,
        K: Eq + Hash,
        F: Fn(&R) -> K,
    {
        let ranked = self.rank(query, index).await?;
        let mut seen = HashSet::new();
        Ok(ranked
            .into_iter()
            .filter(|hit| seen.insert(identity(&hit.record)))
            .take(self.options.max_results)
            .collect())
    }

    /// Every candidate over the floor, best first, ties in index order.
    async fn rank<R: Clone>(&self, query: &str, index: &TitleIndex<R>) -> Result<Vec<RankedTitle<R>>> {
        let options = self.options;
        let deadline = deadline_after(Instant::now(), options.budget);
        let query = normalize(query);
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<char> = query.chars().collect();

        let mut ranked = Vec::new();
        for (i, (title, record)) in index.entries.iter().enumerate() {
            if Instant::now() >= deadline {
                debug!(scored = i, candidates = index.len(), "fuzzy search out of budget");
                return Err(GalcacheError::SearchTimeout(options.budget));
            }
            if i > 0 && i % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            let candidate: Vec<char> = normalize(title).chars().collect();
            let score = score_chars(&query, &candidate);
            if score >= options.min_score {
                ranked.push(RankedTitle {
                    title: title.clone(),
                    score,
                    record: record.clone(),
                });
            }
        }

        // sort_by is stable, so equal scores keep index order
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        Ok(ranked)
    }
}

/// Similarity of `query` and `title`, 0–100.
pub fn score(query: &str, title: &str) -> u8 {
    let query: Vec<char> = normalize(query).chars().collect();
    let title: Vec<char> = normalize(title).chars().collect();
    score_chars(&query, &title)
}

/// Lowercase, trim, collapse runs of whitespace to one space.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn score_chars(a: &[char], b: &[char]) -> u8 {
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    let full = ratio(a, b);
    let partial = partial_ratio(a, b) * PARTIAL_WEIGHT;
    full.max(partial).round().clamp(0.0, 100.0) as u8
}

fn ratio(a: &[char], b: &[char]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 100.0;
    }
    100.0 * (1.0 - levenshtein_distance(a, b) as f64 / longest as f64)
}

/// Best [`ratio`] between the shorter input and any window of the longer
/// one with the same length.
fn partial_ratio(a: &[char], b: &[char]) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.is_empty() {
        return 0.0;
    }
    let mut best: f64 = 0.0;
    for window in long.windows(short.len()) {
        best = best.max(ratio(short, window));
        if best >= 100.0 {
            break;
        }
    }
    best
}

fn levenshtein_distance(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two rolling rows of the edit-distance matrix.
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, a_char) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
