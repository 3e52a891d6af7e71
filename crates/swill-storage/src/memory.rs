use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swill_core::{UserMapping, UserReview};
use tokio::sync::RwLock;

use crate::store::{ReviewStore, ReviewTransaction, StoreError, UserMappingStore};

#[derive(Debug, Default)]
struct MemoryState {
    reviews: BTreeMap<(String, i64), UserReview>,
    users: BTreeMap<String, UserMapping>,
    commits: usize,
    fail_upsert_after: Option<usize>,
}

/// In-process store with the same visibility rules as [`crate::PgStore`]:
/// upserts land only when their transaction commits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a row directly, bypassing transactions.
    pub async fn seed_review(&self, review: UserReview) {
        let mut state = self.state.write().await;
        state
            .reviews
            .insert((review.username.clone(), review.beer_id), review);
    }

    pub async fn seed_user(&self, user: UserMapping) {
        let mut state = self.state.write().await;
        state.users.insert(user.slack_user_id.clone(), user);
    }

    pub async fn review_count(&self, username: &str) -> usize {
        let state = self.state.read().await;
        state.reviews.keys().filter(|(user, _)| user == username).count()
    }

    /// Makes every later transaction reject its upsert after `accepted` good ones.
    pub async fn fail_upserts_after(&self, accepted: usize) {
        self.state.write().await.fail_upsert_after = Some(accepted);
    }

    /// Number of transactions committed so far.
    pub async fn commit_count(&self) -> usize {
        self.state.read().await.commits
    }

    fn sorted_by_rank(mut rows: Vec<UserReview>) -> Vec<UserReview> {
        rows.sort_by(|a, b| b.rank.cmp(&a.rank));
        rows
    }
}

#[async_trait]
impl ReviewStore for InMemoryStore {
    async fn find_review(&self, username: &str, beer_id: i64) -> Result<Option<UserReview>, StoreError> {
        let state = self.state.read().await;
        Ok(state.reviews.get(&(username.to_string(), beer_id)).cloned())
    }

    async fn find_any_of(&self, username: &str, beer_ids: &[i64]) -> Result<Vec<UserReview>, StoreError> {
        let state = self.state.read().await;
        let rows = state
            .reviews
            .values()
            .filter(|r| r.username == username && beer_ids.contains(&r.beer_id))
            .cloned()
            .collect();
        Ok(Self::sorted_by_rank(rows))
    }

    async fn find_by_name(
        &self,
        username: &str,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<UserReview>, StoreError> {
        let needle = fragment.to_lowercase();
        let state = self.state.read().await;
        let rows = state
            .reviews
            .values()
            .filter(|r| r.username == username && r.beer_name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        Ok(Self::sorted_by_rank(rows).into_iter().take(limit).collect())
    }

    async fn list_for_user(&self, username: &str) -> Result<Vec<UserReview>, StoreError> {
        let state = self.state.read().await;
        let rows = state
            .reviews
            .values()
            .filter(|r| r.username == username)
            .cloned()
            .collect();
        Ok(Self::sorted_by_rank(rows))
    }

    async fn list_page(
        &self,
        username: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserReview>, StoreError> {
        let rows = self.list_for_user(username).await?;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn begin(&self) -> Result<Box<dyn ReviewTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    pending: Vec<UserReview>,
}

#[async_trait]
impl ReviewTransaction for MemoryTransaction {
    async fn upsert(&mut self, review: &UserReview) -> Result<(), StoreError> {
        if self.state.read().await.fail_upsert_after == Some(self.pending.len()) {
            return Err(StoreError::Rejected(format!(
                "upsert of ({}, {})",
                review.username, review.beer_id
            )));
        }
        self.pending.push(review.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { state, pending } = *self;
        let mut state = state.write().await;
        for review in pending {
            state
                .reviews
                .insert((review.username.clone(), review.beer_id), review);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl UserMappingStore for InMemoryStore {
    async fn find_user(&self, slack_user_id: &str) -> Result<Option<UserMapping>, StoreError> {
        Ok(self.state.read().await.users.get(slack_user_id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserMapping>, StoreError> {
        let mut users: Vec<_> = self.state.read().await.users.values().cloned().collect();
        users.sort_by(|a, b| a.untappd_username.cmp(&b.untappd_username));
        Ok(users)
    }

    async fn register_user(
        &self,
        slack_user_id: &str,
        untappd_username: &str,
    ) -> Result<UserMapping, StoreError> {
        let mut state = self.state.write().await;
        let entry = state
            .users
            .entry(slack_user_id.to_string())
            .or_insert_with(|| UserMapping {
                slack_user_id: slack_user_id.to_string(),
                untappd_username: untappd_username.to_string(),
                last_review_fetch_timestamp: None,
            });
        entry.untappd_username = untappd_username.to_string();
        Ok(entry.clone())
    }

    async fn set_last_review_fetch(
        &self,
        untappd_username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut updated = 0usize;
        for user in state
            .users
            .values_mut()
            .filter(|u| u.untappd_username == untappd_username)
        {
            user.last_review_fetch_timestamp = Some(at);
            updated += 1;
        }
        if updated == 0 {
            return Err(StoreError::UnknownUsername(untappd_username.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(beer_id: i64, name: &str, rank: i64) -> UserReview {
        UserReview {
            username: "alice".to_string(),
            beer_id,
            beer_name: name.to_string(),
            recent_checkin_id: beer_id * 10,
            recent_checkin_timestamp: Utc::now(),
            count: 1,
            rating: 3.5,
            rank,
        }
    }

    #[tokio::test]
    async fn upserts_are_invisible_until_commit() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&review(1, "Dieu du Ciel - Péché Mortel", 1))
            .await
            .expect("upsert");
        assert_eq!(store.review_count("alice").await, 0);
        tx.commit().await.expect("commit");
        assert_eq!(store.review_count("alice").await, 1);
        assert_eq!(store.commit_count().await, 1);
    }

    #[tokio::test]
    async fn rejected_upsert_leaves_earlier_ones_pending_only() {
        let store = InMemoryStore::new();
        store.fail_upserts_after(1).await;
        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&review(1, "a", 2)).await.expect("first upsert");
        let err = tx.upsert(&review(2, "b", 1)).await.expect_err("second upsert");
        assert!(matches!(err, StoreError::Rejected(_)));
        tx.rollback().await.expect("rollback");
        assert_eq!(store.review_count("alice").await, 0);
    }

    #[tokio::test]
    async fn pages_walk_rows_from_the_highest_rank() {
        let store = InMemoryStore::new();
        for (beer_id, rank) in [(10, 1), (11, 2), (12, 3), (13, 4)] {
            store.seed_review(review(beer_id, "x", rank)).await;
        }
        let ids = |rows: Vec<UserReview>| rows.iter().map(|r| r.beer_id).collect::<Vec<_>>();
        assert_eq!(ids(store.list_page("alice", 1, 2).await.expect("page")), vec![12, 11]);
        assert_eq!(ids(store.list_page("alice", 3, 10).await.expect("page")), vec![10]);
        assert!(store.list_page("alice", 9, 10).await.expect("page").is_empty());
        assert!(store.list_page("bob", 0, 10).await.expect("page").is_empty());
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_pending_rows() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&review(1, "a", 1)).await.expect("upsert");
        tx.rollback().await.expect("rollback");

        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&review(2, "b", 2)).await.expect("upsert");
        drop(tx);

        assert_eq!(store.review_count("alice").await, 0);
    }

    #[tokio::test]
    async fn upsert_replaces_non_key_columns() {
        let store = InMemoryStore::new();
        store.seed_review(review(7, "Old Name", 3)).await;
        let mut updated = review(7, "New Name", 9);
        updated.rating = 4.75;
        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&updated).await.expect("upsert");
        tx.commit().await.expect("commit");

        let row = store.find_review("alice", 7).await.expect("find").expect("row");
        assert_eq!(row, updated);
    }

    #[tokio::test]
    async fn name_search_is_case_insensitive_and_capped() {
        let store = InMemoryStore::new();
        store.seed_review(review(1, "Trillium - Fort Point", 1)).await;
        store.seed_review(review(2, "Trillium - Congress Street", 2)).await;
        store.seed_review(review(3, "Tree House - Julius", 3)).await;

        let rows = store.find_by_name("alice", "trillium", 10).await.expect("search");
        assert_eq!(rows.iter().map(|r| r.beer_id).collect::<Vec<_>>(), vec![2, 1]);

        let rows = store.find_by_name("alice", "TRILLIUM", 1).await.expect("search");
        assert_eq!(rows.len(), 1);
        assert!(store.find_by_name("bob", "trillium", 10).await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn registering_twice_keeps_the_high_water_mark() {
        let store = InMemoryStore::new();
        store.register_user("U1", "alice").await.expect("register");
        let mark = Utc::now();
        store.set_last_review_fetch("alice", mark).await.expect("mark");
        let user = store.register_user("U1", "alice2").await.expect("re-register");
        assert_eq!(user.untappd_username, "alice2");
        assert_eq!(user.last_review_fetch_timestamp, Some(mark));
        assert!(matches!(
            store.set_last_review_fetch("nobody", mark).await,
            Err(StoreError::UnknownUsername(_))
        ));
    }
}
