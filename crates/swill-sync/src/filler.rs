use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use swill_core::{rank_at, ScanWindow, SwillError, SwillResult, UserMapping, UserReview};
use swill_storage::{ReviewStore, ReviewTransaction, UserMappingStore};
use swill_untappd::UntappdApi;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillerConfig {
    pub bulk_page_size: i64,
    pub targeted_page_size: i64,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            bulk_page_size: 50,
            targeted_page_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Whole list from the newest item, bounded by the high-water mark.
    Bulk,
    /// One page centered on a rank seen in an earlier fetch.
    Targeted { known_rank: i64 },
}

impl FillMode {
    pub fn from_known_rank(known_rank: Option<i64>) -> Self {
        match known_rank {
            Some(known_rank) => Self::Targeted { known_rank },
            None => Self::Bulk,
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, Self::Bulk)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FillOutcome {
    /// The row upserted for the target beer, if the scan visited it.
    pub found: Option<UserReview>,
    pub upserted: usize,
    /// New high-water mark, set only when a bulk sync committed.
    pub high_water_mark: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ScanResult {
    found: Option<UserReview>,
    upserted: usize,
}

/// Pages through a user's unique beers on Untappd and upserts every visited
/// item into the review cache, one transaction per fill.
pub struct RankCacheFiller {
    untappd: Arc<dyn UntappdApi>,
    reviews: Arc<dyn ReviewStore>,
    users: Arc<dyn UserMappingStore>,
    config: FillerConfig,
    per_user: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RankCacheFiller {
    pub fn new(
        untappd: Arc<dyn UntappdApi>,
        reviews: Arc<dyn ReviewStore>,
        users: Arc<dyn UserMappingStore>,
        config: FillerConfig,
    ) -> Self {
        Self {
            untappd,
            reviews,
            users,
            config,
            per_user: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> FillerConfig {
        self.config
    }

    async fn user_lock(&self, username: &str) -> Arc<Mutex<()>> {
        let mut map = self.per_user.lock().await;
        map.entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forgets the lock of `username` once no other fill holds or awaits it.
    async fn release_user_lock(&self, username: &str, lock: Arc<Mutex<()>>) {
        let mut map = self.per_user.lock().await;
        // the map and `lock` are the only two owners left
        if Arc::strong_count(&lock) == 2 {
            map.remove(username);
        }
    }

    #[cfg(test)]
    async fn tracked_users(&self) -> usize {
        self.per_user.lock().await.len()
    }

    /// Bulk sync with no beer to look for. Untappd beer ids start at 1.
    pub async fn bulk_sync(&self, user: &UserMapping) -> SwillResult<FillOutcome> {
        self.fill(user, 0, None).await
    }

    /// Bulk sync when `known_rank` is `None`, targeted refresh around it otherwise.
    ///
    /// Fills for the same Untappd username run one at a time. Any error after
    /// the transaction is opened rolls back every upsert of this call.
    pub async fn fill(
        &self,
        user: &UserMapping,
        target_beer_id: i64,
        known_rank: Option<i64>,
    ) -> SwillResult<FillOutcome> {
        let mode = FillMode::from_known_rank(known_rank);
        let span = info_span!(
            "rank_fill",
            fill_id = %Uuid::new_v4(),
            username = %user.untappd_username,
            target_beer_id,
            mode = ?mode,
        );
        self.fill_serialized(user, target_beer_id, mode)
            .instrument(span)
            .await
    }

    async fn fill_serialized(
        &self,
        user: &UserMapping,
        target_beer_id: i64,
        mode: FillMode,
    ) -> SwillResult<FillOutcome> {
        let lock = self.user_lock(&user.untappd_username).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.fill_locked(user, target_beer_id, mode).await
        };
        self.release_user_lock(&user.untappd_username, lock).await;
        outcome
    }

    async fn fill_locked(
        &self,
        user: &UserMapping,
        target_beer_id: i64,
        mode: FillMode,
    ) -> SwillResult<FillOutcome> {
        let context = format!(
            "Find beer reviews for user {} and beer ID {target_beer_id}",
            user.untappd_username
        );

        // A bulk sync that waited behind another one must see the mark it left.
        let user = if mode.is_bulk() {
            self.users
                .find_user(&user.slack_user_id)
                .await
                .map_err(|err| SwillError::database(&context, err))?
                .unwrap_or_else(|| user.clone())
        } else {
            user.clone()
        };
        let username = user.untappd_username.as_str();

        let head = self
            .untappd
            .user_beers(username, 1, 0)
            .await
            .map_err(|err| SwillError::upstream(&context, err))?;
        let Some(newest) = head.items.first() else {
            info!("user has no unique beers yet");
            return Ok(FillOutcome::default());
        };
        if head.total_count <= 0 {
            info!("user has no unique beers yet");
            return Ok(FillOutcome::default());
        }
        if mode.is_bulk() && user.is_already_synced(newest.recent_checkin_timestamp) {
            info!(
                newest = %newest.recent_checkin_timestamp,
                "already up to date, nothing newer than the last sync"
            );
            return Ok(FillOutcome::default());
        }

        let total = head.total_count;
        let window = match mode {
            FillMode::Bulk => ScanWindow::full(total, self.config.bulk_page_size),
            FillMode::Targeted { known_rank } => {
                ScanWindow::around_rank(total, known_rank, self.config.targeted_page_size)
            }
        };
        debug!(
            total,
            initial_offset = window.initial_offset,
            stop_offset = window.stop_offset,
            "scan window"
        );

        let mut tx = self
            .reviews
            .begin()
            .await
            .map_err(|err| SwillError::database(&context, err))?;
        let scanned = self
            .scan(tx.as_mut(), &user, target_beer_id, mode, total, window, &context)
            .await;
        let scan = match scanned {
            Ok(scan) => scan,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                return Err(err);
            }
        };
        tx.commit()
            .await
            .map_err(|err| SwillError::database(&context, err))?;
        if scan.upserted > 0 {
            info!(upserted = scan.upserted, "upserted rows");
        }

        let mut high_water_mark = None;
        if mode.is_bulk() {
            let now = Utc::now();
            self.users
                .set_last_review_fetch(username, now)
                .await
                .map_err(|err| {
                    SwillError::database(
                        format!("Update last review fetch timestamp for {username} to {now}"),
                        err,
                    )
                })?;
            high_water_mark = Some(now);
        }

        Ok(FillOutcome {
            found: scan.found,
            upserted: scan.upserted,
            high_water_mark,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan(
        &self,
        tx: &mut dyn ReviewTransaction,
        user: &UserMapping,
        target_beer_id: i64,
        mode: FillMode,
        total: i64,
        window: ScanWindow,
        context: &str,
    ) -> SwillResult<ScanResult> {
        let username = user.untappd_username.as_str();
        let mut result = ScanResult::default();
        let mut cursor = window.initial_offset;

        'pages: while cursor < window.stop_offset {
            let page = self
                .untappd
                .user_beers(username, window.page_size, cursor)
                .await
                .map_err(|err| SwillError::upstream(context, err))?;
            if page.items.is_empty() {
                debug!(cursor, "empty page, ending scan");
                break;
            }

            for (index, item) in page.items.iter().enumerate() {
                if mode.is_bulk() && user.is_already_synced(item.recent_checkin_timestamp) {
                    info!(
                        checked_in_at = %item.recent_checkin_timestamp,
                        "stopped fetching at an item older than the last sync"
                    );
                    break 'pages;
                }

                let rank = rank_at(total, cursor, index as i64);
                let review = UserReview::from_item(username, item, rank);
                tx.upsert(&review).await.map_err(|err| {
                    SwillError::database(
                        format!(
                            "Add user review for user {username} and beer ID {}",
                            item.beer_id
                        ),
                        err,
                    )
                })?;
                result.upserted += 1;

                if item.beer_id == target_beer_id {
                    info!(beer = %review.beer_name, rank, ?mode, "found target beer");
                    result.found = Some(review);
                }
            }

            cursor += page.items.len() as i64;
        }

        Ok(result)
    }
}
