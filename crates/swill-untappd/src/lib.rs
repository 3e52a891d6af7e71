//! Untappd API contract, JSON decoding, and the reqwest-backed client.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use swill_core::{BeerInfo, CheckinDetail, UpstreamError, UserBeerItem, UserBeersPage};
use swill_storage::{FetchError, HttpFetcher};
use tracing::debug;

pub mod fake;

pub use fake::{FakeUntappd, PageRequest};

pub const CRATE_NAME: &str = "swill-untappd";
pub const DEFAULT_BASE_URL: &str = "https://api.untappd.com/v4";

/// The slice of the Untappd API Swillbot consumes.
#[async_trait]
pub trait UntappdApi: Send + Sync {
    /// One page of `username`'s unique beers, most recently checked-in first.
    async fn user_beers(
        &self,
        username: &str,
        limit: i64,
        offset: i64,
    ) -> Result<UserBeersPage, UpstreamError>;

    /// Id of the first beer (or homebrew) matching `query`.
    async fn search_beer(&self, query: &str) -> Result<i64, UpstreamError>;

    async fn beer_info(&self, beer_id: i64) -> Result<BeerInfo, UpstreamError>;

    async fn checkin(&self, checkin_id: i64) -> Result<CheckinDetail, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct UntappdCredentials {
    pub client_id: String,
    pub client_secret: String,
}

pub struct UntappdClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    credentials: UntappdCredentials,
}

impl UntappdClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, credentials: UntappdCredentials) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// Joins `segments` onto the base URL, percent-encoding each one, then
    /// appends `params` and the credentials.
    fn url(&self, segments: &[&str], params: &[(&str, String)]) -> Result<reqwest::Url, UpstreamError> {
        let invalid = |reason: String| {
            UpstreamError::Transport(format!("invalid Untappd URL for /{}: {reason}", segments.join("/")))
        };
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|err| invalid(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", &self.credentials.client_secret);
        Ok(url)
    }

    /// GETs the endpoint at `segments` and returns the `response` member of
    /// the Untappd envelope.
    async fn get_response(&self, segments: &[&str], params: &[(&str, String)]) -> Result<JsonValue, UpstreamError> {
        let url = self.url(segments, params)?;
        let fetched = self
            .http
            .fetch_bytes(url.as_str())
            .await
            .map_err(map_fetch_error)?;
        debug!(
            path = %fetched.path,
            bytes = fetched.body.len(),
            remaining = ?fetched.rate_limit_remaining,
            "untappd response"
        );
        decode_envelope(&fetched.body)
    }
}

#[async_trait]
impl UntappdApi for UntappdClient {
    async fn user_beers(
        &self,
        username: &str,
        limit: i64,
        offset: i64,
    ) -> Result<UserBeersPage, UpstreamError> {
        let response = self
            .get_response(
                &["user", "beers", username],
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await?;
        parse_user_beers(&response)
    }

    async fn search_beer(&self, query: &str) -> Result<i64, UpstreamError> {
        let response = self
            .get_response(
                &["search", "beer"],
                &[("q", query.to_string()), ("limit", "1".to_string())],
            )
            .await?;
        parse_search(&response)
    }

    async fn beer_info(&self, beer_id: i64) -> Result<BeerInfo, UpstreamError> {
        let beer_id = beer_id.to_string();
        let response = self.get_response(&["beer", "info", beer_id.as_str()], &[]).await?;
        parse_beer_info(&response)
    }

    async fn checkin(&self, checkin_id: i64) -> Result<CheckinDetail, UpstreamError> {
        let id = checkin_id.to_string();
        let response = self
            .get_response(&["checkin", "view", id.as_str()], &[])
            .await?;
        parse_checkin(checkin_id, &response)
    }
}

pub fn map_fetch_error(err: FetchError) -> UpstreamError {
    match err {
        FetchError::RateLimited { .. } => UpstreamError::LimitBusted,
        FetchError::HttpStatus { status: 404, path } => {
            UpstreamError::NotFound(format!("nothing found at {path}"))
        }
        other => UpstreamError::Transport(other.to_string()),
    }
}

pub fn decode_envelope(body: &[u8]) -> Result<JsonValue, UpstreamError> {
    let mut envelope: JsonValue = serde_json::from_slice(body)
        .map_err(|err| UpstreamError::Malformed(format!("invalid JSON: {err}")))?;
    match envelope.get_mut("response") {
        Some(response) => Ok(response.take()),
        None => Err(UpstreamError::Malformed("missing `response` member".to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct UserBeerDto {
    recent_checkin_id: i64,
    recent_created_at: String,
    #[serde(default)]
    count: i32,
    #[serde(default)]
    rating_score: f64,
    beer: BeerRefDto,
    brewery: BreweryRefDto,
}

#[derive(Debug, Deserialize)]
struct BeerRefDto {
    bid: i64,
    #[serde(default)]
    beer_name: String,
}

#[derive(Debug, Deserialize)]
struct BreweryRefDto {
    #[serde(default)]
    brewery_name: String,
}

/// Parses Untappd's RFC 2822 check-in timestamps (RFC 3339 accepted too).
pub fn parse_untappd_timestamp(raw: &str) -> Result<DateTime<Utc>, UpstreamError> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| UpstreamError::Malformed(format!("bad timestamp {raw:?}: {err}")))
}

/// A `response` without a `beers` collection is how Untappd signals a busted limit.
pub fn parse_user_beers(response: &JsonValue) -> Result<UserBeersPage, UpstreamError> {
    let beers = response
        .get("beers")
        .filter(|v| v.is_object())
        .ok_or(UpstreamError::LimitBusted)?;
    let total_count = json_i64(response, &["total_count"]).unwrap_or(0);
    let raw_items = beers
        .get("items")
        .and_then(JsonValue::as_array)
        .ok_or(UpstreamError::LimitBusted)?;

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        let dto: UserBeerDto = serde_json::from_value(raw.clone())
            .map_err(|err| UpstreamError::Malformed(format!("user beer item: {err}")))?;
        items.push(UserBeerItem {
            beer_id: dto.beer.bid,
            beer_name: dto.beer.beer_name,
            brewery_name: dto.brewery.brewery_name,
            recent_checkin_id: dto.recent_checkin_id,
            recent_checkin_timestamp: parse_untappd_timestamp(&dto.recent_created_at)?,
            count: dto.count,
            rating: dto.rating_score,
        });
    }
    Ok(UserBeersPage { total_count, items })
}

pub fn parse_search(response: &JsonValue) -> Result<i64, UpstreamError> {
    if !response.get("beers").is_some_and(JsonValue::is_object) {
        return Err(UpstreamError::LimitBusted);
    }
    ["beers", "homebrew"]
        .into_iter()
        .filter(|kind| json_i64(response, &[*kind, "count"]).unwrap_or(0) > 0)
        .find_map(|kind| {
            response
                .get(kind)?
                .get("items")?
                .as_array()?
                .first()
                .and_then(|item| json_i64(item, &["beer", "bid"]))
        })
        .ok_or_else(|| UpstreamError::NotFound("Couldn't find matching beer!".to_string()))
}

pub fn parse_beer_info(response: &JsonValue) -> Result<BeerInfo, UpstreamError> {
    let beer = response
        .get("beer")
        .filter(|v| v.is_object())
        .ok_or(UpstreamError::LimitBusted)?;
    let bid = json_i64(beer, &["bid"])
        .ok_or_else(|| UpstreamError::Malformed("beer info without `bid`".to_string()))?;

    let parent_id = ["variant_parent", "vintage_parent"]
        .into_iter()
        .find_map(|key| json_i64(beer, &[key, "beer", "bid"]));
    let vintage_ids = beer
        .get("vintages")
        .and_then(|v| v.get("items"))
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| json_i64(item, &["beer", "bid"]))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(BeerInfo {
        bid,
        beer_name: json_str(beer, &["beer_name"]).unwrap_or_default().to_string(),
        beer_slug: json_str(beer, &["beer_slug"]).unwrap_or_default().to_string(),
        beer_label: json_str(beer, &["beer_label"]).map(ToString::to_string),
        beer_style: json_str(beer, &["beer_style"]).unwrap_or_default().to_string(),
        beer_abv: json_f64(beer, &["beer_abv"]).unwrap_or(0.0),
        beer_ibu: json_f64(beer, &["beer_ibu"]).filter(|ibu| *ibu > 0.0),
        beer_description: json_str(beer, &["beer_description"])
            .filter(|d| !d.trim().is_empty())
            .map(ToString::to_string),
        rating_score: json_f64(beer, &["rating_score"]).unwrap_or(0.0),
        rating_count: json_i64(beer, &["rating_count"]).unwrap_or(0),
        weighted_rating_score: json_f64(beer, &["weighted_rating_score"]),
        brewery_name: json_str(beer, &["brewery", "brewery_name"]).map(ToString::to_string),
        parent_id,
        vintage_ids,
    })
}

pub fn parse_checkin(checkin_id: i64, response: &JsonValue) -> Result<CheckinDetail, UpstreamError> {
    let checkin = response
        .get("checkin")
        .filter(|v| v.is_object())
        .ok_or_else(|| UpstreamError::NotFound("Couldn't find matching check-in!".to_string()))?;
    let photo_url = checkin
        .get("media")
        .and_then(|m| m.get("items"))
        .and_then(JsonValue::as_array)
        .and_then(|items| items.first())
        .and_then(|item| json_str(item, &["photo", "photo_img_sm"]))
        .map(ToString::to_string);
    Ok(CheckinDetail {
        checkin_id,
        comment: json_str(checkin, &["checkin_comment"]).unwrap_or_default().to_string(),
        photo_url,
    })
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_path(value, path)?.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_path(value, path)?;
    v.as_i64().or_else(|| v.as_str()?.parse().ok())
}
