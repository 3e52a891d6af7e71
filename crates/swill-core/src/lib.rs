//! Core domain model, error taxonomy and rank arithmetic for Swillbot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "swill-core";

/// One cached (user, beer) fact, as stored in `user_reviews`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReview {
    pub username: String,
    pub beer_id: i64,
    pub beer_name: String,
    pub recent_checkin_id: i64,
    pub recent_checkin_timestamp: DateTime<Utc>,
    pub count: i32,
    pub rating: f64,
    pub rank: i64,
}

impl UserReview {
    /// Builds the row for an upstream item seen at `rank` in `username`'s list.
    pub fn from_item(username: &str, item: &UserBeerItem, rank: i64) -> Self {
        Self {
            username: username.to_string(),
            beer_id: item.beer_id,
            beer_name: item.display_name(),
            recent_checkin_id: item.recent_checkin_id,
            recent_checkin_timestamp: item.recent_checkin_timestamp,
            count: item.count,
            rating: item.rating,
            rank,
        }
    }
}

/// Slack user → Untappd user, plus the bulk-sync high-water mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMapping {
    pub slack_user_id: String,
    pub untappd_username: String,
    pub last_review_fetch_timestamp: Option<DateTime<Utc>>,
}

impl UserMapping {
    /// True when `timestamp` predates the last completed bulk sync.
    pub fn is_already_synced(&self, timestamp: DateTime<Utc>) -> bool {
        self.last_review_fetch_timestamp
            .is_some_and(|mark| timestamp < mark)
    }
}

/// One entry of an upstream "user's unique beers" page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBeerItem {
    pub beer_id: i64,
    pub beer_name: String,
    pub brewery_name: String,
    pub recent_checkin_id: i64,
    pub recent_checkin_timestamp: DateTime<Utc>,
    pub count: i32,
    pub rating: f64,
}

impl UserBeerItem {
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.brewery_name, self.beer_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBeersPage {
    pub total_count: i64,
    pub items: Vec<UserBeerItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BeerInfo {
    pub bid: i64,
    pub beer_name: String,
    pub beer_slug: String,
    pub beer_label: Option<String>,
    pub beer_style: String,
    pub beer_abv: f64,
    pub beer_ibu: Option<f64>,
    pub beer_description: Option<String>,
    pub rating_score: f64,
    pub rating_count: i64,
    pub weighted_rating_score: Option<f64>,
    pub brewery_name: Option<String>,
    /// Variant or vintage parent, when this beer is a child of another.
    pub parent_id: Option<i64>,
    pub vintage_ids: Vec<i64>,
}

impl BeerInfo {
    /// Name in the `"<brewery> - <beer>"` shape used by cached rows.
    pub fn display_name(&self) -> String {
        match &self.brewery_name {
            Some(brewery) => format!("{brewery} - {}", self.beer_name),
            None => self.beer_name.clone(),
        }
    }

    pub fn title(&self) -> String {
        match &self.brewery_name {
            Some(brewery) => format!("{brewery} – {}", self.beer_name),
            None => self.beer_name.clone(),
        }
    }

    pub fn untappd_url(&self) -> String {
        format!("https://untappd.com/b/{}/{}", self.beer_slug, self.bid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CheckinDetail {
    pub checkin_id: i64,
    pub comment: String,
    pub photo_url: Option<String>,
}

/// A resolved review with its check-in comment attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDetail {
    pub review: UserReview,
    pub comment: String,
    pub photo_url: Option<String>,
}

/// Rank of the `index`-th item of the page fetched at `offset`.
pub fn rank_at(total_count: i64, offset: i64, index: i64) -> i64 {
    total_count - offset - index
}

/// Offsets `[initial_offset, stop_offset)` a cache fill walks, `page_size` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub initial_offset: i64,
    pub stop_offset: i64,
    pub page_size: i64,
}

impl ScanWindow {
    pub fn full(total_count: i64, page_size: i64) -> Self {
        Self {
            initial_offset: 0,
            stop_offset: total_count.max(0),
            page_size: page_size.max(1),
        }
    }

    /// Window of one page centered on where `known_rank` sat when it was cached.
    pub fn around_rank(total_count: i64, known_rank: i64, page_size: i64) -> Self {
        let page_size = page_size.max(1);
        let total_count = total_count.max(0);
        let initial_offset = (total_count - (known_rank - 1) - page_size / 2).max(0);
        let stop_offset = (initial_offset + page_size).min(total_count);
        Self {
            initial_offset: initial_offset.min(stop_offset),
            stop_offset,
            page_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.initial_offset >= self.stop_offset
    }
}

/// Failure conditions of Untappd calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("API limit busted! Sorry, wait an hour before trying again.")]
    LimitBusted,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SwillError {
    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: UpstreamError,
    },
    #[error("{context}: {message}")]
    Database { context: String, message: String },
    #[error("{context}: No user found in database! Did you forget to register using `/username`?")]
    UnregisteredUser { context: String },
    #[error("{context}: {message}")]
    NotTried { context: String, message: String },
    #[error("{context}: {message}")]
    InvalidInput { context: String, message: String },
}

impl SwillError {
    pub fn upstream(context: impl Into<String>, source: UpstreamError) -> Self {
        Self::Upstream {
            context: context.into(),
            source,
        }
    }

    pub fn database(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Database {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Human description of the operation that failed.
    pub fn context(&self) -> &str {
        match self {
            Self::Upstream { context, .. }
            | Self::Database { context, .. }
            | Self::UnregisteredUser { context }
            | Self::NotTried { context, .. }
            | Self::InvalidInput { context, .. } => context,
        }
    }

    /// What went wrong, without the operation prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::Upstream { source, .. } => source.to_string(),
            Self::Database { message, .. }
            | Self::NotTried { message, .. }
            | Self::InvalidInput { message, .. } => message.clone(),
            Self::UnregisteredUser { .. } => {
                "No user found in database! Did you forget to register using `/username`?"
                    .to_string()
            }
        }
    }

    /// Whether trying the same command later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream {
                source: UpstreamError::LimitBusted | UpstreamError::Transport(_),
                ..
            } | Self::Database { .. }
        )
    }
}

pub type SwillResult<T> = Result<T, SwillError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn item(beer_id: i64) -> UserBeerItem {
        UserBeerItem {
            beer_id,
            beer_name: "Tripel Karmeliet".to_string(),
            brewery_name: "Brouwerij Bosteels".to_string(),
            recent_checkin_id: 900,
            recent_checkin_timestamp: DateTime::parse_from_rfc3339("2024-03-01T20:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            count: 2,
            rating: 4.25,
        }
    }

    #[test]
    fn window_around_rank_matches_worked_example() {
        let window = ScanWindow::around_rank(120, 40, 10);
        assert_eq!(window.initial_offset, 76);
        assert_eq!(window.stop_offset, 86);
    }

    #[test]
    fn window_bounds_are_clamped() {
        for total in [0, 1, 5, 9, 10, 11, 120] {
            for rank in [-3, 0, 1, 2, 5, 40, 119, 120, 121, 500] {
                for page in [1, 2, 10, 50] {
                    let window = ScanWindow::around_rank(total, rank, page);
                    assert!(window.initial_offset >= 0, "{total}/{rank}/{page}");
                    assert!(window.stop_offset <= total, "{total}/{rank}/{page}");
                    assert!(window.initial_offset <= window.stop_offset);
                }
            }
        }
    }

    #[test]
    fn full_window_covers_the_whole_list() {
        let window = ScanWindow::full(120, 50);
        assert_eq!((window.initial_offset, window.stop_offset), (0, 120));
        assert!(ScanWindow::full(0, 50).is_empty());
    }

    #[test]
    fn ranks_strictly_decrease_within_a_fetch() {
        let total = 120;
        let mut seen = Vec::new();
        for offset in (0..total).step_by(50) {
            for index in 0..50.min(total - offset) {
                seen.push(rank_at(total, offset, index));
            }
        }
        assert_eq!(seen.first(), Some(&120));
        assert_eq!(seen.last(), Some(&1));
        assert!(seen.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn review_row_mirrors_the_upstream_item() {
        let review = UserReview::from_item("alice", &item(555), 40);
        assert_eq!(review.beer_name, "Brouwerij Bosteels - Tripel Karmeliet");
        assert_eq!(review.beer_id, 555);
        assert_eq!(review.rank, 40);
        assert_eq!(review.count, 2);
    }

    #[test]
    fn high_water_mark_comparison() {
        let ts = item(1).recent_checkin_timestamp;
        let mut user = UserMapping {
            slack_user_id: "U1".to_string(),
            untappd_username: "alice".to_string(),
            last_review_fetch_timestamp: None,
        };
        assert!(!user.is_already_synced(ts));
        user.last_review_fetch_timestamp = Some(ts + chrono::Duration::hours(1));
        assert!(user.is_already_synced(ts));
        user.last_review_fetch_timestamp = Some(ts);
        assert!(!user.is_already_synced(ts));
    }

    #[test]
    fn errors_carry_context_and_user_detail() {
        let err = SwillError::upstream("Search for beer 'foo'", UpstreamError::LimitBusted);
        assert_eq!(err.context(), "Search for beer 'foo'");
        assert!(err.detail().starts_with("API limit busted"));
        assert!(err.is_retryable());

        let err = SwillError::UnregisteredUser {
            context: "Finding Untappd username for Slack user ID U1".to_string(),
        };
        assert!(err.detail().contains("/username"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn beer_info_names() {
        let info = BeerInfo {
            bid: 3,
            beer_name: "Heady Topper".to_string(),
            beer_slug: "the-alchemist-heady-topper".to_string(),
            brewery_name: Some("The Alchemist".to_string()),
            ..Default::default()
        };
        assert_eq!(info.display_name(), "The Alchemist - Heady Topper");
        assert_eq!(info.title(), "The Alchemist – Heady Topper");
        assert_eq!(
            info.untappd_url(),
            "https://untappd.com/b/the-alchemist-heady-topper/3"
        );
    }
}
