//! Scriptable in-memory Untappd used by tests and local runs without credentials.

use std::collections::HashMap;

use async_trait::async_trait;
use swill_core::{BeerInfo, CheckinDetail, UpstreamError, UserBeerItem, UserBeersPage};
use tokio::sync::Mutex;

use crate::UntappdApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Default)]
struct FakeState {
    user_beers: HashMap<String, Vec<UserBeerItem>>,
    searches: HashMap<String, i64>,
    beers: HashMap<i64, BeerInfo>,
    checkins: HashMap<i64, CheckinDetail>,
    page_requests: Vec<PageRequest>,
    fail_page_request: Option<usize>,
}

#[derive(Debug, Default)]
pub struct FakeUntappd {
    state: Mutex<FakeState>,
}

impl FakeUntappd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `username`'s unique-beer list; `items` are newest first.
    pub async fn set_user_beers(&self, username: &str, items: Vec<UserBeerItem>) {
        self.state
            .lock()
            .await
            .user_beers
            .insert(username.to_string(), items);
    }

    /// Simulates a new check-in: the beer moves (or is added) to the top of the list.
    pub async fn log_checkin(&self, username: &str, item: UserBeerItem) {
        let mut state = self.state.lock().await;
        let list = state.user_beers.entry(username.to_string()).or_default();
        list.retain(|existing| existing.beer_id != item.beer_id);
        list.insert(0, item);
    }

    /// Registers `info` as the search result for `query` (case-insensitive).
    pub async fn add_beer(&self, query: &str, info: BeerInfo) {
        let mut state = self.state.lock().await;
        state.searches.insert(query.to_lowercase(), info.bid);
        state.beers.insert(info.bid, info);
    }

    pub async fn add_checkin(&self, detail: CheckinDetail) {
        self.state
            .lock()
            .await
            .checkins
            .insert(detail.checkin_id, detail);
    }

    /// Makes the `n`-th (1-based) user-beers request answer with a busted limit.
    pub async fn fail_page_request(&self, n: usize) {
        self.state.lock().await.fail_page_request = Some(n);
    }

    pub async fn page_requests(&self) -> Vec<PageRequest> {
        self.state.lock().await.page_requests.clone()
    }

    pub async fn clear_page_requests(&self) {
        self.state.lock().await.page_requests.clear();
    }
}

#[async_trait]
impl UntappdApi for FakeUntappd {
    async fn user_beers(
        &self,
        username: &str,
        limit: i64,
        offset: i64,
    ) -> Result<UserBeersPage, UpstreamError> {
        let mut state = self.state.lock().await;
        state.page_requests.push(PageRequest { limit, offset });
        if state.fail_page_request == Some(state.page_requests.len()) {
            return Err(UpstreamError::LimitBusted);
        }

        let list = state.user_beers.get(username).cloned().unwrap_or_default();
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX).min(list.len());
        let take = usize::try_from(limit.max(0)).unwrap_or(0);
        Ok(UserBeersPage {
            total_count: i64::try_from(list.len()).unwrap_or(i64::MAX),
            items: list.into_iter().skip(start).take(take).collect(),
        })
    }

    async fn search_beer(&self, query: &str) -> Result<i64, UpstreamError> {
        self.state
            .lock()
            .await
            .searches
            .get(&query.to_lowercase())
            .copied()
            .ok_or_else(|| UpstreamError::NotFound("Couldn't find matching beer!".to_string()))
    }

    async fn beer_info(&self, beer_id: i64) -> Result<BeerInfo, UpstreamError> {
        self.state
            .lock()
            .await
            .beers
            .get(&beer_id)
            .cloned()
            .ok_or(UpstreamError::LimitBusted)
    }

    async fn checkin(&self, checkin_id: i64) -> Result<CheckinDetail, UpstreamError> {
        self.state
            .lock()
            .await
            .checkins
            .get(&checkin_id)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound("Couldn't find matching check-in!".to_string()))
    }
}
