use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swill_core::{BeerInfo, CheckinDetail, UserBeerItem, UserMapping};
use swill_storage::InMemoryStore;
use swill_sync::{FillerConfig, MatcherKind, SwillServices};
use swill_untappd::FakeUntappd;
use tokio::sync::Mutex;

use crate::{AppState, ResponseSink, SlackMessage};

pub const TOKEN: &str = "s3cr3t";

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, SlackMessage)>>,
}

impl RecordingSink {
    pub async fn sent(&self) -> Vec<(String, SlackMessage)> {
        self.sent.lock().await.clone()
    }

    /// Waits for the background command task to deliver exactly one message.
    pub async fn wait_for_one(sink: &Arc<Self>) -> (String, SlackMessage) {
        for _ in 0..200 {
            let sent = sink.sent().await;
            if let Some(first) = sent.into_iter().next() {
                return first;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no delayed response was delivered");
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn deliver(&self, response_url: &str, message: &SlackMessage) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((response_url.to_string(), message.clone()));
        Ok(())
    }
}

pub struct Fixture {
    pub fake: Arc<FakeUntappd>,
    pub store: InMemoryStore,
    pub services: SwillServices,
    pub sink: Arc<RecordingSink>,
}

impl Fixture {
    pub fn state(&self) -> AppState {
        AppState::new(self.services.clone(), TOKEN, self.sink.clone())
    }
}

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).expect("ts").with_timezone(&Utc)
}

pub fn item(beer_id: i64, brewery: &str, beer: &str, rating: f64, checked_in: &str) -> UserBeerItem {
    UserBeerItem {
        beer_id,
        beer_name: beer.to_string(),
        brewery_name: brewery.to_string(),
        recent_checkin_id: beer_id * 10,
        recent_checkin_timestamp: at(checked_in),
        count: 1,
        rating,
    }
}

pub fn beer(bid: i64, brewery: &str, name: &str, rating_score: f64) -> BeerInfo {
    BeerInfo {
        bid,
        beer_name: name.to_string(),
        beer_slug: name.to_lowercase().replace(' ', "-"),
        beer_style: "IPA - American".to_string(),
        beer_abv: 6.5,
        rating_score,
        rating_count: 1000,
        brewery_name: Some(brewery.to_string()),
        ..BeerInfo::default()
    }
}

fn user(slack_user_id: &str, untappd_username: &str) -> UserMapping {
    UserMapping {
        slack_user_id: slack_user_id.to_string(),
        untappd_username: untappd_username.to_string(),
        last_review_fetch_timestamp: None,
    }
}

/// alice has had Heady Topper and two Trillium beers; bob has had Focal Banger
/// only. Search knows Heady Topper, Focal Banger and Fort Point.
pub async fn fixture() -> Fixture {
    let fake = Arc::new(FakeUntappd::new());
    fake.set_user_beers(
        "alice",
        vec![
            item(4691, "The Alchemist", "Heady Topper", 4.5, "2024-05-03T19:00:00Z"),
            item(2001, "Trillium", "Congress Street", 4.0, "2024-04-02T19:00:00Z"),
            item(2002, "Trillium", "Fort Point", 4.25, "2024-03-01T19:00:00Z"),
        ],
    )
    .await;
    fake.set_user_beers(
        "bob",
        vec![item(5000, "The Alchemist", "Focal Banger", 3.75, "2024-02-01T19:00:00Z")],
    )
    .await;
    fake.add_beer("heady topper", beer(4691, "The Alchemist", "Heady Topper", 4.47))
        .await;
    fake.add_beer("focal banger", beer(5000, "The Alchemist", "Focal Banger", 4.3))
        .await;
    fake.add_beer("fort point", beer(2002, "Trillium", "Fort Point", 4.1))
        .await;
    fake.add_checkin(CheckinDetail {
        checkin_id: 46910,
        comment: "So fresh.".to_string(),
        photo_url: None,
    })
    .await;
    fake.add_checkin(CheckinDetail {
        checkin_id: 50000,
        comment: "Crushable.".to_string(),
        photo_url: Some("https://photos.untappd.com/focal.jpg".to_string()),
    })
    .await;

    let store = InMemoryStore::new();
    store.seed_user(user("U_ALICE", "alice")).await;
    store.seed_user(user("U_BOB", "bob")).await;

    let services = SwillServices::assemble(
        fake.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        FillerConfig::default(),
        MatcherKind::Substring,
    );
    Fixture {
        fake,
        store,
        services,
        sink: Arc::new(RecordingSink::default()),
    }
}
