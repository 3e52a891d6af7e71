use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swill_core::{UserMapping, UserReview};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no mapping for Untappd user {0}")]
    UnknownUsername(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Cached `(username, beer_id)` review rows.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn find_review(&self, username: &str, beer_id: i64) -> Result<Option<UserReview>, StoreError>;

    /// Rows whose beer id is any of `beer_ids`, highest rank first.
    async fn find_any_of(&self, username: &str, beer_ids: &[i64]) -> Result<Vec<UserReview>, StoreError>;

    /// Case-insensitive substring match on `beer_name`, highest rank first.
    async fn find_by_name(
        &self,
        username: &str,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<UserReview>, StoreError>;

    async fn list_for_user(&self, username: &str) -> Result<Vec<UserReview>, StoreError>;

    /// `limit` rows starting `offset` rows down from the highest rank.
    async fn list_page(
        &self,
        username: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserReview>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn ReviewTransaction>, StoreError>;
}

/// A batch of upserts that becomes visible on `commit` only.
///
/// Dropping a transaction without committing discards its upserts.
#[async_trait]
pub trait ReviewTransaction: Send {
    /// Insert, or update every non-key column on `(username, beer_id)` conflict.
    async fn upsert(&mut self, review: &UserReview) -> Result<(), StoreError>;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserMappingStore: Send + Sync {
    async fn find_user(&self, slack_user_id: &str) -> Result<Option<UserMapping>, StoreError>;
    async fn list_users(&self) -> Result<Vec<UserMapping>, StoreError>;

    /// Creates or re-points a mapping; an existing high-water mark is kept.
    async fn register_user(
        &self,
        slack_user_id: &str,
        untappd_username: &str,
    ) -> Result<UserMapping, StoreError>;

    async fn set_last_review_fetch(
        &self,
        untappd_username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// `ILIKE` pattern matching `fragment` anywhere, with wildcards in it escaped.
pub fn like_pattern(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 2);
    out.push('%');
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_wraps_and_escapes() {
        assert_eq!(like_pattern("Heady Topper"), "%Heady Topper%");
        assert_eq!(like_pattern("100%_pure\\"), "%100\\%\\_pure\\\\%");
    }
}
