use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use strsim::jaro_winkler;
use swill_core::{SwillError, SwillResult, UserReview};
use swill_storage::ReviewStore;

/// Finds cached rows of a user that plausibly are the beer named `beer_name`,
/// best candidate first.
#[async_trait]
pub trait CandidateMatcher: Send + Sync {
    async fn candidates(
        &self,
        username: &str,
        beer_name: &str,
        limit: usize,
    ) -> SwillResult<Vec<UserReview>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Substring,
    Similarity,
}

impl MatcherKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "substring" | "ilike" => Some(Self::Substring),
            "similarity" | "jaro-winkler" | "fuzzy" => Some(Self::Similarity),
            _ => None,
        }
    }

    pub fn build(self, reviews: Arc<dyn ReviewStore>) -> Arc<dyn CandidateMatcher> {
        match self {
            Self::Substring => Arc::new(SubstringMatcher::new(reviews)),
            Self::Similarity => Arc::new(SimilarityMatcher::new(reviews, SimilarityMatcher::DEFAULT_THRESHOLD)),
        }
    }
}

/// Case-insensitive substring match on the cached `"<brewery> - <beer>"` name.
pub struct SubstringMatcher {
    reviews: Arc<dyn ReviewStore>,
}

impl SubstringMatcher {
    pub fn new(reviews: Arc<dyn ReviewStore>) -> Self {
        Self { reviews }
    }
}

#[async_trait]
impl CandidateMatcher for SubstringMatcher {
    async fn candidates(
        &self,
        username: &str,
        beer_name: &str,
        limit: usize,
    ) -> SwillResult<Vec<UserReview>> {
        self.reviews
            .find_by_name(username, beer_name, limit)
            .await
            .map_err(|err| SwillError::database("Looking for beer by name", err))
    }
}

/// Scores every cached row of the user with Jaro-Winkler over normalized names.
pub struct SimilarityMatcher {
    reviews: Arc<dyn ReviewStore>,
    threshold: f64,
}

impl SimilarityMatcher {
    pub const DEFAULT_THRESHOLD: f64 = 0.88;

    pub fn new(reviews: Arc<dyn ReviewStore>, threshold: f64) -> Self {
        Self { reviews, threshold }
    }

    pub fn normalize(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 1.0 when one normalized name contains the other, otherwise the best of
    /// the full name and the part after the brewery.
    pub fn score(query: &str, cached_name: &str) -> f64 {
        let query = Self::normalize(query);
        let full = Self::normalize(cached_name);
        if query.is_empty() || full.is_empty() {
            return 0.0;
        }
        if full.contains(&query) || query.contains(&full) {
            return 1.0;
        }
        let beer_only = cached_name
            .split_once(" - ")
            .map(|(_, beer)| Self::normalize(beer))
            .unwrap_or_else(|| full.clone());
        jaro_winkler(&query, &full).max(jaro_winkler(&query, &beer_only))
    }
}

#[async_trait]
impl CandidateMatcher for SimilarityMatcher {
    async fn candidates(
        &self,
        username: &str,
        beer_name: &str,
        limit: usize,
    ) -> SwillResult<Vec<UserReview>> {
        let rows = self
            .reviews
            .list_for_user(username)
            .await
            .map_err(|err| SwillError::database("Looking for beer by name", err))?;

        let mut scored: Vec<(f64, UserReview)> = rows
            .into_iter()
            .map(|row| (Self::score(beer_name, &row.beer_name), row))
            .filter(|(score, _)| *score >= self.threshold)
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.rank.cmp(&a.rank))
        });
        Ok(scored.into_iter().take(limit).map(|(_, row)| row).collect())
    }
}
