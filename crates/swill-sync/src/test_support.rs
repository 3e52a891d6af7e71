use chrono::{DateTime, Duration, Utc};
use swill_core::{UserBeerItem, UserMapping};

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .expect("ts")
        .with_timezone(&Utc)
}

/// `count` items, newest first: beer `n` is named "Beer n" and was checked in
/// `n` hours after [`base_time`], so it lands at rank `n`.
pub fn history(count: i64) -> Vec<UserBeerItem> {
    (1..=count)
        .rev()
        .map(|n| UserBeerItem {
            beer_id: n,
            beer_name: format!("Beer {n}"),
            brewery_name: "Brasserie Dunham".to_string(),
            recent_checkin_id: 10_000 + n,
            recent_checkin_timestamp: base_time() + Duration::hours(n),
            count: 1,
            rating: 3.0 + (n % 5) as f64 / 4.0,
        })
        .collect()
}

pub fn alice(mark: Option<DateTime<Utc>>) -> UserMapping {
    UserMapping {
        slack_user_id: "U_ALICE".to_string(),
        untappd_username: "alice".to_string(),
        last_review_fetch_timestamp: mark,
    }
}
