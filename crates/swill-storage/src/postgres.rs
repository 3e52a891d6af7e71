use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use swill_core::{UserMapping, UserReview};
use tracing::debug;

use crate::store::{like_pattern, ReviewStore, ReviewTransaction, StoreError, UserMappingStore};

const CREATE_USER_REVIEWS: &str = r#"
CREATE TABLE IF NOT EXISTS user_reviews (
    username TEXT NOT NULL,
    beer_id BIGINT NOT NULL,
    beer_name TEXT NOT NULL,
    recent_checkin_id BIGINT NOT NULL,
    recent_checkin_timestamp TIMESTAMPTZ NOT NULL,
    count INTEGER NOT NULL,
    rating DOUBLE PRECISION NOT NULL,
    rank BIGINT NOT NULL,
    PRIMARY KEY (username, beer_id)
)
"#;

const CREATE_USER_MAPPING: &str = r#"
CREATE TABLE IF NOT EXISTS user_mapping (
    slack_user_id TEXT PRIMARY KEY,
    untappd_username TEXT NOT NULL,
    last_review_fetch_timestamp TIMESTAMPTZ
)
"#;

const REVIEW_COLUMNS: &str = "username, beer_id, beer_name, recent_checkin_id, \
     recent_checkin_timestamp, count, rating, rank";

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Postgres-backed review cache and user mapping.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and creates the tables if they do not exist yet.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let store = Self::new(connect_pool(database_url, 5).await?);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_USER_REVIEWS).execute(&self.pool).await?;
        sqlx::query(CREATE_USER_MAPPING).execute(&self.pool).await?;
        debug!("user_reviews and user_mapping tables are present");
        Ok(())
    }
}

fn review_from_row(row: &PgRow) -> Result<UserReview, StoreError> {
    Ok(UserReview {
        username: row.try_get("username")?,
        beer_id: row.try_get("beer_id")?,
        beer_name: row.try_get("beer_name")?,
        recent_checkin_id: row.try_get("recent_checkin_id")?,
        recent_checkin_timestamp: row.try_get("recent_checkin_timestamp")?,
        count: row.try_get("count")?,
        rating: row.try_get("rating")?,
        rank: row.try_get("rank")?,
    })
}

fn mapping_from_row(row: &PgRow) -> Result<UserMapping, StoreError> {
    Ok(UserMapping {
        slack_user_id: row.try_get("slack_user_id")?,
        untappd_username: row.try_get("untappd_username")?,
        last_review_fetch_timestamp: row.try_get("last_review_fetch_timestamp")?,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn find_review(&self, username: &str, beer_id: i64) -> Result<Option<UserReview>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM user_reviews WHERE username = $1 AND beer_id = $2"
        ))
        .bind(username)
        .bind(beer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn find_any_of(&self, username: &str, beer_ids: &[i64]) -> Result<Vec<UserReview>, StoreError> {
        if beer_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM user_reviews \
             WHERE username = $1 AND beer_id = ANY($2) \
             ORDER BY rank DESC"
        ))
        .bind(username)
        .bind(beer_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn find_by_name(
        &self,
        username: &str,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<UserReview>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM user_reviews \
             WHERE username = $1 AND beer_name ILIKE $2 \
             ORDER BY rank DESC \
             LIMIT $3"
        ))
        .bind(username)
        .bind(like_pattern(fragment))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn list_for_user(&self, username: &str) -> Result<Vec<UserReview>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM user_reviews WHERE username = $1 ORDER BY rank DESC"
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn list_page(
        &self,
        username: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserReview>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM user_reviews WHERE username = $1 \
             ORDER BY rank DESC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(username)
        .bind(sql_limit(limit))
        .bind(sql_limit(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn ReviewTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgReviewTransaction { tx }))
    }
}

struct PgReviewTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ReviewTransaction for PgReviewTransaction {
    async fn upsert(&mut self, review: &UserReview) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_reviews
                (username, beer_id, beer_name, recent_checkin_id, recent_checkin_timestamp, count, rating, rank)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (username, beer_id) DO UPDATE SET
                beer_name = EXCLUDED.beer_name,
                recent_checkin_id = EXCLUDED.recent_checkin_id,
                recent_checkin_timestamp = EXCLUDED.recent_checkin_timestamp,
                count = EXCLUDED.count,
                rating = EXCLUDED.rating,
                rank = EXCLUDED.rank
            "#,
        )
        .bind(&review.username)
        .bind(review.beer_id)
        .bind(&review.beer_name)
        .bind(review.recent_checkin_id)
        .bind(review.recent_checkin_timestamp)
        .bind(review.count)
        .bind(review.rating)
        .bind(review.rank)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl UserMappingStore for PgStore {
    async fn find_user(&self, slack_user_id: &str) -> Result<Option<UserMapping>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT slack_user_id, untappd_username, last_review_fetch_timestamp
              FROM user_mapping
             WHERE slack_user_id = $1
            "#,
        )
        .bind(slack_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn list_users(&self) -> Result<Vec<UserMapping>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT slack_user_id, untappd_username, last_review_fetch_timestamp
              FROM user_mapping
             ORDER BY untappd_username
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn register_user(
        &self,
        slack_user_id: &str,
        untappd_username: &str,
    ) -> Result<UserMapping, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_mapping (slack_user_id, untappd_username)
            VALUES ($1, $2)
            ON CONFLICT (slack_user_id) DO UPDATE SET untappd_username = EXCLUDED.untappd_username
            RETURNING slack_user_id, untappd_username, last_review_fetch_timestamp
            "#,
        )
        .bind(slack_user_id)
        .bind(untappd_username)
        .fetch_one(&self.pool)
        .await?;
        mapping_from_row(&row)
    }

    async fn set_last_review_fetch(
        &self,
        untappd_username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE user_mapping
               SET last_review_fetch_timestamp = $1
             WHERE untappd_username = $2
            "#,
        )
        .bind(at)
        .bind(untappd_username)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownUsername(untappd_username.to_string()));
        }
        Ok(())
    }
}
