use futures::future::{join_all, try_join_all};
use swill_core::{BeerInfo, ReviewDetail, SwillError, SwillResult, UserMapping, UserReview};
use swill_sync::{BeerRef, SwillServices, GATHER_CAP};
use tracing::info;

use crate::query::{parse_text, split_queries, Target};
use crate::slack::{
    dump_message, error_message, registered_message, review_message, tick_message, ticks_message,
    untappd_message, LookupResult, SlackMessage, SlashCommand, TickResult,
};

/// Rows returned by `/dumpreviews` when no limit is given, and the most it accepts.
pub const DUMP_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Review,
    Tick,
    Ticks,
    Untappd,
    DumpReviews,
    Username,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Tick => "tick",
            Self::Ticks => "ticks",
            Self::Untappd => "untappd",
            Self::DumpReviews => "dumpreviews",
            Self::Username => "username",
        }
    }
}

/// Runs `command` and renders either its answer or its failure.
pub async fn run_command(services: &SwillServices, command: Command, payload: &SlashCommand) -> SlackMessage {
    let result = match command {
        Command::Review => run_review(services, payload).await,
        Command::Tick => run_tick(services, payload).await,
        Command::Ticks => run_ticks(services, payload).await,
        Command::Untappd => run_untappd(services, payload).await,
        Command::DumpReviews => run_dump_reviews(services, payload).await,
        Command::Username => register(services, payload).await,
    };
    result.unwrap_or_else(|err| error_message(&err))
}

async fn find_registered(services: &SwillServices, slack_user_id: &str) -> SwillResult<UserMapping> {
    services
        .users
        .find_user(slack_user_id)
        .await
        .map_err(|err| {
            SwillError::database(format!("Find Untappd username from Slack ID '{slack_user_id}'"), err)
        })?
        .ok_or_else(|| SwillError::UnregisteredUser {
            context: format!("Finding Untappd username for Slack user ID {slack_user_id}"),
        })
}

/// A single user for `/tick` and `/ticks`; a broadcast tag means the requester.
async fn single_user(services: &SwillServices, requester: &str, target: &Target) -> SwillResult<UserMapping> {
    match target {
        Target::User(slack_user_id) => find_registered(services, slack_user_id).await,
        Target::Requester | Target::Everyone => find_registered(services, requester).await,
    }
}

async fn lookup_beer(services: &SwillServices, query: &str) -> SwillResult<BeerInfo> {
    let beer_id = services
        .untappd
        .search_beer(query)
        .await
        .map_err(|err| SwillError::upstream(format!("Search for beer '{query}'"), err))?;
    services
        .untappd
        .beer_info(beer_id)
        .await
        .map_err(|err| SwillError::upstream(format!("Get beer info for beer #{beer_id}"), err))
}

/// `/review [<@user>|<!here>] <beer>`: the check-ins of one or every registered user.
pub async fn run_review(services: &SwillServices, payload: &SlashCommand) -> SwillResult<SlackMessage> {
    let parsed = parse_text(&payload.text);
    let users = match &parsed.target {
        Target::Everyone => services
            .users
            .list_users()
            .await
            .map_err(|err| SwillError::database("Fetch all Untappd usernames", err))?,
        Target::User(slack_user_id) => vec![find_registered(services, slack_user_id).await?],
        Target::Requester => vec![find_registered(services, &payload.user_id).await?],
    };

    let beer = lookup_beer(services, &parsed.query).await?;
    let beer_ref = BeerRef::from(&beer);
    let found = try_join_all(
        users
            .iter()
            .map(|user| services.resolver.find_review(user, &beer_ref)),
    )
    .await?;

    let reviews: Vec<(String, ReviewDetail)> = users
        .iter()
        .zip(found)
        .filter_map(|(user, detail)| detail.map(|detail| (user.untappd_username.clone(), detail)))
        .collect();
    if reviews.is_empty() {
        return Err(SwillError::NotTried {
            context: "Looking for beer ID in checkins".to_string(),
            message: format!("Requested users have not tried `{}` yet!", beer.title()),
        });
    }
    Ok(review_message(&payload.user_id, &payload.text, &beer, &reviews))
}

async fn tick_one(services: &SwillServices, user: &UserMapping, query: &str) -> SwillResult<(BeerInfo, Option<UserReview>)> {
    let beer = lookup_beer(services, query).await?;
    let review = services.resolver.resolve(user, &BeerRef::from(&beer)).await?;
    Ok((beer, review))
}

/// `/tick [<@user>] <beer>, <beer>, ...`: which of these beers the user has had.
pub async fn run_tick(services: &SwillServices, payload: &SlashCommand) -> SwillResult<SlackMessage> {
    let parsed = parse_text(&payload.text);
    let queries = split_queries(&parsed.query);
    if queries.is_empty() {
        return Err(SwillError::InvalidInput {
            context: "Reading beer list".to_string(),
            message: "Nothing to look up! Try `/tick beer one, beer two`.".to_string(),
        });
    }
    let user = single_user(services, &payload.user_id, &parsed.target).await?;

    let results = join_all(queries.into_iter().map(|query| {
        let user = &user;
        async move {
            match tick_one(services, user, &query).await {
                Ok((beer, review)) => TickResult::Found { query, beer, review },
                Err(err) => TickResult::Failed {
                    message: err.detail(),
                    query,
                },
            }
        }
    }))
    .await;

    Ok(tick_message(&payload.user_id, &parsed.query, &results))
}

/// `/ticks [<@user>] <name>`: every cached beer of the user matching a name.
pub async fn run_ticks(services: &SwillServices, payload: &SlashCommand) -> SwillResult<SlackMessage> {
    let parsed = parse_text(&payload.text);
    let name = parsed.query.trim();
    if name.is_empty() {
        return Err(SwillError::InvalidInput {
            context: "Reading beer name".to_string(),
            message: "Nothing to look up! Try `/ticks trillium`.".to_string(),
        });
    }
    let user = single_user(services, &payload.user_id, &parsed.target).await?;

    let reviews = services.resolver.gather(&user, name, GATHER_CAP).await?;
    if reviews.is_empty() {
        return Err(SwillError::NotTried {
            context: "Looking for beer name in checkins".to_string(),
            message: format!("Requested user has not tried anything like `{name}` yet!"),
        });
    }
    Ok(ticks_message(&payload.user_id, &payload.text, &user.untappd_username, &reviews))
}

fn split_price(query: &str) -> (String, Option<f64>) {
    match query.split_once('$') {
        Some((name, price)) => (
            name.trim().to_string(),
            price.trim().parse::<f64>().ok().filter(|price| *price > 0.0),
        ),
        None => (query.trim().to_string(), None),
    }
}

/// `/untappd <beer>[$price], ...`: global ratings of beers, with value for
/// money when a price follows the name.
pub async fn run_untappd(services: &SwillServices, payload: &SlashCommand) -> SwillResult<SlackMessage> {
    let queries = split_queries(&payload.text);
    if queries.is_empty() {
        return Err(SwillError::InvalidInput {
            context: "Reading beer list".to_string(),
            message: "Nothing to look up! Try `/untappd beer one $8, beer two`.".to_string(),
        });
    }

    let results = join_all(queries.into_iter().map(|query| async move {
        let (name, price) = split_price(&query);
        match lookup_beer(services, &name).await {
            Ok(beer) => LookupResult::Found {
                query: name,
                beer,
                price,
            },
            Err(err) => LookupResult::Failed {
                message: err.detail(),
                query: name,
            },
        }
    }))
    .await;

    Ok(untappd_message(&payload.user_id, &payload.text.replace('\n', " "), &results))
}

fn dump_range(query: &str) -> SwillResult<(usize, usize)> {
    let invalid = || SwillError::InvalidInput {
        context: "Reading review range".to_string(),
        message: format!("Usage: `/dumpreviews [<@user>] <start> [limit]`, limit at most {DUMP_LIMIT}"),
    };
    let mut words = query.split_whitespace();
    let start = words
        .next()
        .ok_or_else(invalid)?
        .parse::<usize>()
        .map_err(|_| invalid())?;
    let limit = match words.next() {
        Some(raw) => raw.parse::<usize>().map_err(|_| invalid())?,
        None => DUMP_LIMIT,
    };
    if words.next().is_some() || limit == 0 || limit > DUMP_LIMIT {
        return Err(invalid());
    }
    Ok((start, limit))
}

/// `/dumpreviews [<@user>] <start> [limit]`: a page of the user's cached
/// reviews, newest first, with their check-in comments.
pub async fn run_dump_reviews(services: &SwillServices, payload: &SlashCommand) -> SwillResult<SlackMessage> {
    let parsed = parse_text(&payload.text);
    let (start, limit) = dump_range(&parsed.query)?;
    let user = single_user(services, &payload.user_id, &parsed.target).await?;
    let username = user.untappd_username.as_str();

    let page = services
        .reviews
        .list_page(username, start, limit)
        .await
        .map_err(|err| SwillError::database(format!("Read cached reviews of '{username}'"), err))?;
    if page.is_empty() {
        return Err(SwillError::NotTried {
            context: "Reading cached reviews".to_string(),
            message: format!("No cached reviews for `{username}` from #{start} on."),
        });
    }

    let details = try_join_all(page.into_iter().map(|review| async move {
        let checkin_id = review.recent_checkin_id;
        let checkin = services
            .untappd
            .checkin(checkin_id)
            .await
            .map_err(|err| SwillError::upstream(format!("Get check-in comment for #{checkin_id}"), err))?;
        Ok::<_, SwillError>(ReviewDetail {
            review,
            comment: checkin.comment,
            photo_url: checkin.photo_url,
        })
    }))
    .await?;

    info!(username, start, rows = details.len(), "dumped reviews");
    Ok(dump_message(&payload.user_id, &payload.text, username, &details))
}

/// `/username <untappd username>`: maps the requester to an Untappd account.
pub async fn register(services: &SwillServices, payload: &SlashCommand) -> SwillResult<SlackMessage> {
    let untappd_username = payload.text.trim();
    if untappd_username.is_empty() || untappd_username.contains(char::is_whitespace) {
        return Err(SwillError::InvalidInput {
            context: "Add user mapping entry".to_string(),
            message: "Usage: `/username <Untappd username>`".to_string(),
        });
    }
    let mapping = services
        .users
        .register_user(&payload.user_id, untappd_username)
        .await
        .map_err(|err| SwillError::database("Add user mapping entry", err))?;
    info!(
        slack_user_id = %mapping.slack_user_id,
        untappd_username = %mapping.untappd_username,
        "user registered"
    );
    Ok(registered_message(&mapping.slack_user_id, &mapping.untappd_username))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::ResponseType;
    use crate::test_support::fixture;

    fn slash(user_id: &str, text: &str) -> SlashCommand {
        SlashCommand {
            token: String::new(),
            user_id: user_id.to_string(),
            text: text.to_string(),
            response_url: String::new(),
        }
    }

    #[tokio::test]
    async fn review_for_requester_includes_checkin_comment() {
        let fx = fixture().await;
        let message = run_review(&fx.services, &slash("U_ALICE", "heady topper"))
            .await
            .unwrap();

        assert_eq!(message.response_type, ResponseType::InChannel);
        assert_eq!(message.attachments.len(), 1);
        let first = &message.attachments[0];
        assert_eq!(first.title.as_deref(), Some("The Alchemist – Heady Topper"));
        assert_eq!(first.pretext.as_deref(), Some("<@U_ALICE>: `/review heady topper`"));
        assert!(first.text.contains(":fullbeer::fullbeer::fullbeer::fullbeer::halfbeer: *4.5*"));
        assert!(first.text.contains("So fresh."));
        assert!(first.text.contains("_alice_, <https://untappd.com/user/alice/checkin/46910|2024/5/3>"));
        assert_eq!(fx.store.review_count("alice").await, 3);
    }

    #[tokio::test]
    async fn broadcast_review_skips_users_who_have_not_tried_it() {
        let fx = fixture().await;
        let message = run_review(&fx.services, &slash("U_BOB", "<!here> heady topper"))
            .await
            .unwrap();

        assert_eq!(message.attachments.len(), 1);
        assert!(message.attachments[0].text.contains("_alice_"));
        assert_eq!(fx.store.review_count("bob").await, 1);
    }

    #[tokio::test]
    async fn review_of_untried_beer_is_not_tried() {
        let fx = fixture().await;
        let err = run_review(&fx.services, &slash("U_ALICE", "<@U_BOB|bob> heady topper"))
            .await
            .unwrap_err();

        assert!(matches!(err, SwillError::NotTried { .. }));
        assert_eq!(err.context(), "Looking for beer ID in checkins");
        assert_eq!(
            err.detail(),
            "Requested users have not tried `The Alchemist – Heady Topper` yet!"
        );
    }

    #[tokio::test]
    async fn unregistered_requester_renders_error_message() {
        let fx = fixture().await;
        let message = run_command(&fx.services, Command::Review, &slash("U9", "heady topper")).await;

        assert_eq!(message.response_type, ResponseType::Ephemeral);
        assert_eq!(
            message.text.as_deref(),
            Some("Oops! Something went wrong with this operation : 'Finding Untappd username for Slack user ID U9'.")
        );
        assert!(message.attachments[0].text.contains("/username"));
    }

    #[tokio::test]
    async fn unknown_beer_search_reports_upstream_context() {
        let fx = fixture().await;
        let err = run_review(&fx.services, &slash("U_ALICE", "pliny the elder"))
            .await
            .unwrap_err();
        assert_eq!(err.context(), "Search for beer 'pliny the elder'");
        assert_eq!(err.detail(), "Couldn't find matching beer!");
    }

    #[tokio::test]
    async fn tick_lists_failures_then_beers_by_global_rating() {
        let fx = fixture().await;
        let message = run_tick(
            &fx.services,
            &slash("U_ALICE", "focal banger, heady topper, pliny"),
        )
        .await
        .unwrap();

        let titles: Vec<Option<&str>> = message.attachments.iter().map(|a| a.title.as_deref()).collect();
        assert_eq!(
            titles,
            vec![
                None,
                Some(":ballot_box_with_check: The Alchemist – Heady Topper"),
                Some(":x: The Alchemist – Focal Banger"),
            ]
        );
        assert!(message.attachments[0].text.contains("`pliny`"));
        assert_eq!(
            message.attachments[0].pretext.as_deref(),
            Some("<@U_ALICE>: ```/tick focal banger, heady topper, pliny```")
        );
        assert!(message.attachments[1].text.contains(":pencil:"));
    }

    #[tokio::test]
    async fn tick_without_queries_is_invalid() {
        let fx = fixture().await;
        let err = run_tick(&fx.services, &slash("U_ALICE", " , \n")).await.unwrap_err();
        assert!(matches!(err, SwillError::InvalidInput { .. }));
        assert_eq!(err.context(), "Reading beer list");
    }

    #[tokio::test]
    async fn ticks_lists_cached_matches_best_rated_first() {
        let fx = fixture().await;
        fx.services.sync_user("U_ALICE").await.unwrap();

        let message = run_ticks(&fx.services, &slash("U_BOB", "<@U_ALICE> trillium"))
            .await
            .unwrap();
        let attachment = &message.attachments[0];
        assert_eq!(attachment.title.as_deref(), Some("2 matching beers for _alice_"));
        let lines: Vec<&str> = attachment.text.lines().collect();
        assert!(lines[0].contains("*Trillium - Fort Point*"));
        assert!(lines[1].contains("*Trillium - Congress Street*"));
    }

    #[tokio::test]
    async fn ticks_with_empty_cache_is_not_tried() {
        let fx = fixture().await;
        let err = run_ticks(&fx.services, &slash("U_ALICE", "trillium")).await.unwrap_err();
        assert_eq!(err.context(), "Looking for beer name in checkins");
    }

    #[tokio::test]
    async fn untappd_rates_beers_and_prices_value() {
        let fx = fixture().await;
        let message = run_untappd(&fx.services, &slash("U_BOB", "fort point $4,\nheady topper, pliny"))
            .await
            .unwrap();

        let titles: Vec<Option<&str>> = message.attachments.iter().map(|a| a.title.as_deref()).collect();
        assert_eq!(
            titles,
            vec![
                None,
                Some("The Alchemist – Heady Topper"),
                Some("Trillium – Fort Point"),
            ]
        );
        assert!(message.attachments[0].text.contains("`pliny`"));
        assert_eq!(
            message.attachments[0].pretext.as_deref(),
            Some("<@U_BOB>: ```/untappd fort point $4, heady topper, pliny```")
        );
        // 4.1 / (15 - 12.3) over one four-dollar unit
        assert!(message.attachments[2].text.contains("*1.52* :fullbeer:/:dollar:"));
        assert!(message.attachments[2].text.starts_with(":mag: `fort point`\n"));
        assert!(!message.attachments[1].text.contains(":dollar:"));
    }

    #[tokio::test]
    async fn untappd_needs_no_registration() {
        let fx = fixture().await;
        let message = run_command(&fx.services, Command::Untappd, &slash("U9", "focal banger")).await;
        assert_eq!(message.response_type, ResponseType::InChannel);
        assert_eq!(message.attachments.len(), 1);
        assert!(message.attachments[0].text.starts_with(":fullbeer:"));
    }

    #[tokio::test]
    async fn untappd_without_queries_is_invalid() {
        let fx = fixture().await;
        let err = run_untappd(&fx.services, &slash("U_ALICE", "  ")).await.unwrap_err();
        assert!(matches!(err, SwillError::InvalidInput { .. }));
    }

    #[test]
    fn prices_follow_a_dollar_sign() {
        assert_eq!(split_price("fort point $ 7.5"), ("fort point".to_string(), Some(7.5)));
        assert_eq!(split_price("fort point $free"), ("fort point".to_string(), None));
        assert_eq!(split_price("fort point $0"), ("fort point".to_string(), None));
        assert_eq!(split_price("fort point"), ("fort point".to_string(), None));
    }

    #[test]
    fn dump_range_defaults_and_bounds() {
        assert_eq!(dump_range("5").unwrap(), (5, DUMP_LIMIT));
        assert_eq!(dump_range(" 0 20 ").unwrap(), (0, 20));
        for bad in ["", "first", "0 many", "0 0", "0 101", "1 2 3"] {
            let err = dump_range(bad).unwrap_err();
            assert_eq!(err.context(), "Reading review range", "{bad:?}");
        }
    }

    #[tokio::test]
    async fn dumpreviews_pages_cached_reviews_with_comments() {
        let fx = fixture().await;
        fx.services.sync_user("U_BOB").await.unwrap();

        let message = run_dump_reviews(&fx.services, &slash("U_ALICE", "<@U_BOB|bob> 0 10"))
            .await
            .unwrap();
        let attachment = &message.attachments[0];
        assert_eq!(attachment.title.as_deref(), Some("1 reviews of _bob_"));
        assert_eq!(attachment.pretext.as_deref(), Some("<@U_ALICE>: `/dumpreviews <@U_BOB|bob> 0 10`"));
        assert!(attachment.text.contains("*The Alchemist - Focal Banger*: Crushable."));
        assert!(attachment.text.ends_with("<https://photos.untappd.com/focal.jpg|:camera:>"));
    }

    #[tokio::test]
    async fn dumpreviews_past_the_end_is_not_tried() {
        let fx = fixture().await;
        fx.services.sync_user("U_BOB").await.unwrap();
        let err = run_dump_reviews(&fx.services, &slash("U_BOB", "1")).await.unwrap_err();
        assert_eq!(err.context(), "Reading cached reviews");
    }

    #[tokio::test]
    async fn dumpreviews_reports_missing_checkins() {
        let fx = fixture().await;
        fx.services.sync_user("U_ALICE").await.unwrap();
        // only Heady Topper's check-in is known to the API
        let err = run_dump_reviews(&fx.services, &slash("U_ALICE", "0 2")).await.unwrap_err();
        assert_eq!(err.context(), "Get check-in comment for #20010");
    }

    #[tokio::test]
    async fn register_rejects_blank_and_spaced_names() {
        let fx = fixture().await;
        for text in ["", "   ", "two words"] {
            let err = register(&fx.services, &slash("U_CAROL", text)).await.unwrap_err();
            assert_eq!(err.context(), "Add user mapping entry");
        }
        let message = register(&fx.services, &slash("U_CAROL", "carol")).await.unwrap();
        assert!(message.attachments[0].text.contains("`carol`"));
    }
}
