use std::sync::Arc;

use swill_core::{BeerInfo, ReviewDetail, SwillError, SwillResult, UserMapping, UserReview};
use swill_storage::ReviewStore;
use swill_untappd::UntappdApi;
use tracing::{debug, info};

use crate::filler::RankCacheFiller;
use crate::matcher::CandidateMatcher;

pub const GATHER_CAP: usize = 50;

/// The beer a command is asking about, as resolved on Untappd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeerRef {
    pub beer_id: i64,
    /// `"<brewery> - <beer>"`, the shape cached rows are named with.
    pub beer_name: String,
    pub parent_id: Option<i64>,
    pub vintage_ids: Vec<i64>,
}

impl BeerRef {
    fn related_ids(&self) -> Vec<i64> {
        self.parent_id
            .into_iter()
            .chain(self.vintage_ids.iter().copied())
            .collect()
    }
}

impl From<&BeerInfo> for BeerRef {
    fn from(info: &BeerInfo) -> Self {
        Self {
            beer_id: info.bid,
            beer_name: info.display_name(),
            parent_id: info.parent_id,
            vintage_ids: info.vintage_ids.clone(),
        }
    }
}

/// Answers "has this user had this beer, and how did they rate it" from the
/// cache, refreshing it through the filler on every lookup.
pub struct ReviewResolver {
    filler: Arc<RankCacheFiller>,
    reviews: Arc<dyn ReviewStore>,
    untappd: Arc<dyn UntappdApi>,
    matcher: Arc<dyn CandidateMatcher>,
}

impl ReviewResolver {
    pub fn new(
        filler: Arc<RankCacheFiller>,
        reviews: Arc<dyn ReviewStore>,
        untappd: Arc<dyn UntappdApi>,
        matcher: Arc<dyn CandidateMatcher>,
    ) -> Self {
        Self {
            filler,
            reviews,
            untappd,
            matcher,
        }
    }

    pub fn filler(&self) -> &Arc<RankCacheFiller> {
        &self.filler
    }

    /// Direct row, then bulk sync, then vintages/variants, then name matching.
    /// `None` means the user has not tried the beer.
    pub async fn resolve(&self, user: &UserMapping, beer: &BeerRef) -> SwillResult<Option<UserReview>> {
        let username = user.untappd_username.as_str();
        let context = format!(
            "Find beer reviews for user {username} and beer ID {}",
            beer.beer_id
        );

        let direct = self
            .reviews
            .find_review(username, beer.beer_id)
            .await
            .map_err(|err| SwillError::database(&context, err))?;

        let mut found = match &direct {
            Some(row) => {
                debug!(username, rank = row.rank, "cached check-in found, refreshing around it");
                match self.filler.fill(user, beer.beer_id, Some(row.rank)).await?.found {
                    Some(review) => Some(review),
                    None => {
                        info!(username, "beer moved since it was cached, syncing");
                        self.filler.fill(user, beer.beer_id, None).await?.found
                    }
                }
            }
            None => {
                debug!(username, "no cached check-in, syncing");
                self.filler.fill(user, beer.beer_id, None).await?.found
            }
        };

        let related = beer.related_ids();
        if found.is_none() && !related.is_empty() {
            debug!(username, ?related, "trying vintages and variants");
            let relatives = self
                .reviews
                .find_any_of(username, &related)
                .await
                .map_err(|err| SwillError::database("Looking for vintages", err))?;
            if let Some(relative) = relatives.first() {
                info!(
                    username,
                    query = %beer.beer_name,
                    matched = %relative.beer_name,
                    rank = relative.rank,
                    "matched as vintage or variant"
                );
                found = self
                    .filler
                    .fill(user, relative.beer_id, Some(relative.rank))
                    .await?
                    .found;
            }
        }

        if found.is_none() && direct.is_none() {
            debug!(username, query = %beer.beer_name, "trying name match");
            let candidates = self.matcher.candidates(username, &beer.beer_name, 1).await?;
            if let Some(candidate) = candidates.first() {
                info!(username, query = %beer.beer_name, matched = %candidate.beer_name, "matched by name");
                found = self
                    .filler
                    .fill(user, candidate.beer_id, Some(candidate.rank))
                    .await?
                    .found;
            }
        }

        if found.is_none() {
            info!(username, beer_id = beer.beer_id, "not found after every fallback");
        }
        Ok(found)
    }

    /// [`Self::resolve`] plus the comment and photo of the user's latest check-in.
    pub async fn find_review(&self, user: &UserMapping, beer: &BeerRef) -> SwillResult<Option<ReviewDetail>> {
        let Some(review) = self.resolve(user, beer).await? else {
            return Ok(None);
        };
        let checkin_id = review.recent_checkin_id;
        let checkin = self
            .untappd
            .checkin(checkin_id)
            .await
            .map_err(|err| SwillError::upstream(format!("Get check-in comment for #{checkin_id}"), err))?;
        Ok(Some(ReviewDetail {
            review,
            comment: checkin.comment,
            photo_url: checkin.photo_url,
        }))
    }

    /// Every cached beer of the user matching `name` (at most `cap`), each
    /// refreshed around its rank, best rated first.
    pub async fn gather(&self, user: &UserMapping, name: &str, cap: usize) -> SwillResult<Vec<UserReview>> {
        let username = user.untappd_username.as_str();
        let candidates = self.matcher.candidates(username, name, cap).await?;
        debug!(username, query = name, candidates = candidates.len(), "gathering");

        let mut gathered = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(review) = self
                .filler
                .fill(user, candidate.beer_id, Some(candidate.rank))
                .await?
                .found
            {
                gathered.push(review);
            }
        }
        gathered.sort_by(|a, b| b.rating.total_cmp(&a.rating));
        Ok(gathered)
    }
}
