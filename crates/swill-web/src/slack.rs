//! Slack slash-command payloads, message shapes and formatting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use swill_core::{BeerInfo, ReviewDetail, SwillError, UserReview};
use tracing::warn;

pub const COLOR_BEER: &str = "#ffcc00";
pub const COLOR_ERROR: &str = "#ff0000";
pub const COLOR_TICKED: &str = "#00ff00";
pub const COLOR_UNTICKED: &str = "#fc7f03";

/// Form body Slack posts for every slash command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlashCommand {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub response_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    InChannel,
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_url: Option<String>,
    #[serde(default)]
    pub text: String,
}

impl Attachment {
    fn colored(color: &str) -> Self {
        Self {
            color: Some(color.to_string()),
            ..Self::default()
        }
    }
}

pub fn receipt() -> SlackMessage {
    SlackMessage {
        response_type: ResponseType::Ephemeral,
        text: Some("Working... :hourglass_flowing_sand:".to_string()),
        attachments: Vec::new(),
    }
}

pub fn error_message_parts(context: &str, detail: &str) -> SlackMessage {
    SlackMessage {
        response_type: ResponseType::Ephemeral,
        text: Some(format!(
            "Oops! Something went wrong with this operation : '{context}'."
        )),
        attachments: vec![Attachment {
            text: detail.to_string(),
            ..Attachment::colored(COLOR_ERROR)
        }],
    }
}

pub fn error_message(err: &SwillError) -> SlackMessage {
    warn!(context = err.context(), error = %err, retryable = err.is_retryable(), "command failed");
    error_message_parts(err.context(), &err.detail())
}

/// Beer emoji for the whole part of `rating`, a fractional one for the rest,
/// then the number in bold.
pub fn rating_string(rating: f64) -> String {
    let whole = rating.floor();
    let mut out = ":fullbeer:".repeat(whole.max(0.0) as usize);
    let fraction = rating - whole;
    if fraction >= 0.75 {
        out.push_str(":threequarterbeer:");
    } else if fraction >= 0.5 {
        out.push_str(":halfbeer:");
    } else if fraction >= 0.25 {
        out.push_str(":quarterbeer:");
    }
    out.push_str(&format!(" *{rating}*"));
    out
}

fn short_date(at: DateTime<Utc>) -> String {
    at.format("%Y/%-m/%-d").to_string()
}

fn checkins_label(count: i32) -> String {
    if count > 1 {
        format!("{count} check-ins")
    } else {
        format!("{count} check-in")
    }
}

fn variant_line(review: &UserReview, beer: &BeerInfo) -> Option<String> {
    (review.beer_id != beer.bid).then(|| format!("_Vintage or variant : *{}*_\n", review.beer_name))
}

/// `/review`: one block per user who has had the beer; the first block
/// carries the beer's title, link and label.
pub fn review_message(
    requester: &str,
    text: &str,
    beer: &BeerInfo,
    reviews: &[(String, ReviewDetail)],
) -> SlackMessage {
    let attachments = reviews
        .iter()
        .enumerate()
        .map(|(index, (username, detail))| {
            let review = &detail.review;
            let mut body = variant_line(review, beer).unwrap_or_default();
            body.push_str(&format!(
                "{} ({})",
                rating_string(review.rating),
                checkins_label(review.count)
            ));
            body.push_str(&format!("\n{}", detail.comment));
            body.push_str(&format!(
                "\n\t- _{username}_, <https://untappd.com/user/{username}/checkin/{}|{}>",
                review.recent_checkin_id,
                short_date(review.recent_checkin_timestamp)
            ));

            let mut attachment = Attachment {
                text: body,
                thumb_url: detail.photo_url.clone(),
                ..Attachment::colored(COLOR_BEER)
            };
            if index == 0 {
                attachment.pretext = Some(format!("<@{requester}>: `/review {text}`"));
                attachment.title = Some(beer.title());
                attachment.title_link = Some(beer.untappd_url());
                if attachment.thumb_url.is_none() {
                    attachment.thumb_url = beer.beer_label.clone();
                }
            }
            attachment
        })
        .collect();

    SlackMessage {
        response_type: ResponseType::InChannel,
        text: None,
        attachments,
    }
}

/// Outcome of one `/tick` query.
#[derive(Debug, Clone)]
pub enum TickResult {
    Found {
        query: String,
        beer: BeerInfo,
        review: Option<UserReview>,
    },
    Failed {
        query: String,
        message: String,
    },
}

fn failed_query_attachment(query: &str, message: &str) -> Attachment {
    Attachment {
        text: format!("*Couldn't find matching beer for :* `{query}` (_{message}_)"),
        ..Attachment::colored(COLOR_ERROR)
    }
}

/// Global rating, weighted rating and rating count of a beer.
fn beer_stats(beer: &BeerInfo) -> String {
    let mut out = rating_string(beer.rating_score);
    if let Some(weighted) = beer.weighted_rating_score {
        out.push_str(&format!(" (*{weighted:.2}* weighted)"));
    }
    out.push_str(&format!(" ({} ratings)", beer.rating_count));
    out
}

fn style_line(beer: &BeerInfo) -> String {
    let ibu = beer
        .beer_ibu
        .map(|ibu| format!(" — {ibu} IBU"))
        .unwrap_or_default();
    format!("_{} — {}% ABV{ibu}_", beer.beer_style, beer.beer_abv)
}

/// `/tick`: failed queries first, then beers by global rating, ticked ones
/// marked with the user's own rating.
pub fn tick_message(requester: &str, text: &str, results: &[TickResult]) -> SlackMessage {
    let mut attachments: Vec<Attachment> = results
        .iter()
        .filter_map(|result| match result {
            TickResult::Failed { query, message } => Some(failed_query_attachment(query, message)),
            TickResult::Found { .. } => None,
        })
        .collect();

    let mut found: Vec<(&String, &BeerInfo, &Option<UserReview>)> = results
        .iter()
        .filter_map(|result| match result {
            TickResult::Found {
                query,
                beer,
                review,
            } => Some((query, beer, review)),
            TickResult::Failed { .. } => None,
        })
        .collect();
    found.sort_by(|a, b| b.1.rating_score.total_cmp(&a.1.rating_score));
    let several = found.len() > 1;

    for (query, beer, review) in found {
        let mut body = beer_stats(beer);
        if several {
            body = format!(":mag: `{query}`\n{body}");
        }

        let mut attachment = Attachment {
            title_link: Some(beer.untappd_url()),
            thumb_url: beer.beer_label.clone(),
            ..Attachment::default()
        };
        match review {
            Some(review) => {
                attachment.title = Some(format!(":ballot_box_with_check: {}", beer.title()));
                attachment.color = Some(COLOR_TICKED.to_string());
                body.push('\n');
                body.push_str(&variant_line(review, beer).unwrap_or_default());
                body.push_str(&format!(
                    ":pencil: {} ({} - latest on {})",
                    rating_string(review.rating),
                    checkins_label(review.count),
                    short_date(review.recent_checkin_timestamp)
                ));
            }
            None => {
                attachment.title = Some(format!(":x: {}", beer.title()));
                attachment.color = Some(COLOR_UNTICKED.to_string());
            }
        }

        body.push_str(&format!("\n{}", style_line(beer)));
        if let Some(description) = &beer.beer_description {
            body.push_str(&format!("\n{description}"));
        }
        attachment.text = body;
        attachments.push(attachment);
    }

    if let Some(first) = attachments.first_mut() {
        first.pretext = Some(format!("<@{requester}>: ```/tick {text}```"));
    }
    SlackMessage {
        response_type: ResponseType::InChannel,
        text: None,
        attachments,
    }
}

/// Outcome of one `/untappd` query.
#[derive(Debug, Clone)]
pub enum LookupResult {
    Found {
        query: String,
        beer: BeerInfo,
        /// Price given after a `$` in the query.
        price: Option<f64>,
    },
    Failed {
        query: String,
        message: String,
    },
}

/// Rating stretched around 3.75 so that small differences near the top count.
pub fn exponential_rating(rating: f64) -> f64 {
    rating / (15.0 - 3.0 * rating)
}

/// `/untappd`: failed queries first, then beers by global rating, with a
/// value-for-money figure for priced queries.
pub fn untappd_message(requester: &str, text: &str, results: &[LookupResult]) -> SlackMessage {
    let mut attachments: Vec<Attachment> = results
        .iter()
        .filter_map(|result| match result {
            LookupResult::Failed { query, message } => Some(failed_query_attachment(query, message)),
            LookupResult::Found { .. } => None,
        })
        .collect();

    let mut found: Vec<(&String, &BeerInfo, Option<f64>)> = results
        .iter()
        .filter_map(|result| match result {
            LookupResult::Found { query, beer, price } => Some((query, beer, *price)),
            LookupResult::Failed { .. } => None,
        })
        .collect();
    found.sort_by(|a, b| b.1.rating_score.total_cmp(&a.1.rating_score));
    let several = found.len() > 1;

    for (query, beer, price) in found {
        let mut body = beer_stats(beer);
        if let Some(price) = price {
            let per_dollar = exponential_rating(beer.rating_score) / (price / 4.0);
            body.push_str(&format!(" — *{per_dollar:.2}* :fullbeer:/:dollar:"));
        }
        body.push_str(&format!("\n{}", style_line(beer)));
        if several {
            body = format!(":mag: `{query}`\n{body}");
        }
        if let Some(description) = &beer.beer_description {
            body.push_str(&format!("\n{description}"));
        }
        attachments.push(Attachment {
            title: Some(beer.title()),
            title_link: Some(beer.untappd_url()),
            thumb_url: beer.beer_label.clone(),
            text: body,
            ..Attachment::colored(COLOR_BEER)
        });
    }

    if let Some(first) = attachments.first_mut() {
        first.pretext = Some(format!("<@{requester}>: ```/untappd {text}```"));
    }
    SlackMessage {
        response_type: ResponseType::InChannel,
        text: None,
        attachments,
    }
}

/// `/ticks`: every cached beer of the user matching a name, best rated first.
pub fn ticks_message(requester: &str, text: &str, username: &str, reviews: &[UserReview]) -> SlackMessage {
    let lines: Vec<String> = reviews
        .iter()
        .map(|review| {
            format!(
                "{} *{}* ({} - latest on <https://untappd.com/user/{username}/checkin/{}|{}>)",
                rating_string(review.rating),
                review.beer_name,
                checkins_label(review.count),
                review.recent_checkin_id,
                short_date(review.recent_checkin_timestamp)
            )
        })
        .collect();
    SlackMessage {
        response_type: ResponseType::InChannel,
        text: None,
        attachments: vec![Attachment {
            pretext: Some(format!("<@{requester}>: `/ticks {text}`")),
            title: Some(format!("{} matching beers for _{username}_", reviews.len())),
            text: lines.join("\n"),
            ..Attachment::colored(COLOR_BEER)
        }],
    }
}

/// `/dumpreviews`: one line per cached review with the check-in comment.
pub fn dump_message(requester: &str, text: &str, username: &str, reviews: &[ReviewDetail]) -> SlackMessage {
    let lines: Vec<String> = reviews
        .iter()
        .map(|detail| {
            let review = &detail.review;
            let mut line = format!(
                "{} *{}*: {}",
                rating_string(review.rating),
                review.beer_name,
                detail.comment
            );
            if let Some(photo) = &detail.photo_url {
                line.push_str(&format!(" <{photo}|:camera:>"));
            }
            line
        })
        .collect();
    SlackMessage {
        response_type: ResponseType::InChannel,
        text: None,
        attachments: vec![Attachment {
            pretext: Some(format!("<@{requester}>: `/dumpreviews {text}`")),
            title: Some(format!("{} reviews of _{username}_", reviews.len())),
            text: lines.join("\n"),
            ..Attachment::colored(COLOR_BEER)
        }],
    }
}

pub fn registered_message(slack_user_id: &str, untappd_username: &str) -> SlackMessage {
    SlackMessage {
        response_type: ResponseType::InChannel,
        text: None,
        attachments: vec![Attachment {
            title: Some("User registered!".to_string()),
            text: format!(
                "Slack user <@{slack_user_id}> will be known as Untappd user `{untappd_username}`"
            ),
            ..Attachment::colored(COLOR_BEER)
        }],
    }
}
