//! Rate-limit route keys.
//!
//! Requests that the server rate limits together share a route key.
//! Snowflakes are collapsed to `:id` except after `channels`, `guilds` and
//! `webhooks`, whose ids scope their sub-resources.

use crate::snowflake;
use http::Method;

/// Deleting a message older than this has its own quota.
pub const OLD_MESSAGE_AGE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Deleting a message younger than this has its own quota.
pub const NEW_MESSAGE_AGE_MS: i64 = 10 * 1000;

const MAJOR_PARAMETERS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// Canonical route for `method path`.
///
/// `now_ms` is the local Unix time and `latency_ms` the current latency
/// estimate; together they age message ids for the delete split.
pub fn canonicalize(method: &Method, path: &str, now_ms: i64, latency_ms: i64) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments: Vec<&str> = path.split('/').collect();

    for i in 1..segments.len() {
        let resource = segments[i - 1];
        let is_resource = !resource.is_empty()
            && resource.bytes().all(|b| b.is_ascii_lowercase() || b == b'-');
        if is_resource && snowflake::is_snowflake(segments[i]) && !MAJOR_PARAMETERS.contains(&resource) {
            segments[i] = ":id";
        }
    }

    if let Some(index) = segments.iter().position(|s| *s == "reactions") {
        if index + 1 < segments.len() {
            segments[index + 1] = ":id";
        }
        if index + 2 < segments.len() {
            segments[index + 2] = ":userID";
        }
    }

    if segments.len() > 3
        && segments[0].is_empty()
        && segments[1] == "webhooks"
        && !segments[2].is_empty()
        && segments[2].bytes().all(|b| b.is_ascii_digit())
        && is_webhook_token(segments[3])
    {
        segments[3] = ":token";
    }

    let mut route = segments.join("/");

    if *method == Method::DELETE && route.ends_with("/messages/:id") {
        let message_id = path.rsplit('/').next().unwrap_or_default();
        let suffix = match snowflake::parse_created_at(message_id) {
            Some(created) => {
                let age = now_ms - latency_ms - created as i64;
                if age >= OLD_MESSAGE_AGE_MS {
                    "_OLD"
                } else if age <= NEW_MESSAGE_AGE_MS {
                    "_NEW"
                } else {
                    ""
                }
            }
            None => "",
        };
        route = format!("{}{}{}", method, suffix, route);
    } else if *method == Method::GET && is_guild_channel_list(&route) {
        route = "/guilds/:id/channels".to_string();
    }

    if *method == Method::PUT || *method == Method::DELETE {
        if let Some(index) = route.find("/reactions") {
            route = format!("MODIFY{}/reactions", &route[..index]);
        }
    }

    route
}

fn is_webhook_token(segment: &str) -> bool {
    segment.len() >= 64
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn is_guild_channel_list(route: &str) -> bool {
    let mut tail = route.rsplit('/');
    matches!(
        (tail.next(), tail.next(), tail.next()),
        (Some("channels"), Some(id), Some("guilds"))
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snowflake::from_timestamp;

    const NOW: i64 = 1_700_000_000_000;

    fn route(method: Method, path: &str) -> String {
        canonicalize(&method, path, NOW, 0)
    }

    #[test]
    fn test_major_parameters_are_kept() {
        assert_eq!(
            route(Method::GET, "/channels/81384788765712384/messages/175928847299117063"),
            "/channels/81384788765712384/messages/:id"
        );
        assert_eq!(
            route(Method::PATCH, "/guilds/81384788765712384/members/175928847299117063"),
            "/guilds/81384788765712384/members/:id"
        );
        assert_eq!(route(Method::GET, "/users/@me"), "/users/@me");
    }

    #[test]
    fn test_reactions_collapse() {
        assert_eq!(
            route(
                Method::GET,
                "/channels/81384788765712384/messages/175928847299117063/reactions/%F0%9F%91%8D"
            ),
            "/channels/81384788765712384/messages/:id/reactions/:id"
        );
        assert_eq!(
            route(
                Method::PUT,
                "/channels/81384788765712384/messages/175928847299117063/reactions/%F0%9F%91%8D/@me"
            ),
            "MODIFY/channels/81384788765712384/messages/:id/reactions"
        );
        assert_eq!(
            route(
                Method::DELETE,
                "/channels/81384788765712384/messages/175928847299117063/reactions/x/175928847299117063"
            ),
            "MODIFY/channels/81384788765712384/messages/:id/reactions"
        );
    }

    #[test]
    fn test_webhook_token_collapses() {
        let token = "a".repeat(68);
        assert_eq!(
            route(Method::POST, &format!("/webhooks/223704706495545344/{}", token)),
            "/webhooks/223704706495545344/:token"
        );
        assert_eq!(
            route(Method::POST, "/webhooks/223704706495545344/short"),
            "/webhooks/223704706495545344/short"
        );
    }

    #[test]
    fn test_guild_channel_list_is_shared() {
        assert_eq!(
            route(Method::GET, "/guilds/81384788765712384/channels"),
            "/guilds/:id/channels"
        );
        assert_eq!(
            route(Method::POST, "/guilds/81384788765712384/channels"),
            "/guilds/81384788765712384/channels"
        );
    }

    #[test]
    fn test_message_delete_split_by_age() {
        let old = from_timestamp((NOW - OLD_MESSAGE_AGE_MS - 1000) as u64);
        let fresh = from_timestamp((NOW - 5_000) as u64);
        let middle = from_timestamp((NOW - 60_000) as u64);

        let old_route = route(Method::DELETE, &format!("/channels/123/messages/{}", old));
        let new_route = route(Method::DELETE, &format!("/channels/123/messages/{}", fresh));
        let middle_route = route(Method::DELETE, &format!("/channels/123/messages/{}", middle));

        assert_eq!(old_route, "DELETE_OLD/channels/123/messages/:id");
        assert_eq!(new_route, "DELETE_NEW/channels/123/messages/:id");
        assert_eq!(middle_route, "DELETE/channels/123/messages/:id");
        assert_ne!(old_route, new_route);
    }

    #[test]
    fn test_latency_ages_messages() {
        // 12 s old locally, but only 8 s old once 4 s of latency is removed
        let id = from_timestamp((NOW - 12_000) as u64);
        let path = format!("/channels/123/messages/{}", id);

        assert_eq!(
            canonicalize(&Method::DELETE, &path, NOW, 0),
            "DELETE/channels/123/messages/:id"
        );
        assert_eq!(
            canonicalize(&Method::DELETE, &path, NOW, 4_000),
            "DELETE_NEW/channels/123/messages/:id"
        );
    }

    #[test]
    fn test_query_is_ignored() {
        assert_eq!(
            route(Method::GET, "/channels/81384788765712384/messages?limit=50"),
            "/channels/81384788765712384/messages"
        );
    }
}
