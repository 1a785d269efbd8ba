//! Typed variable blobs, one struct per operation.
//!
//! Wire field names follow the web client: mostly camelCase with a few
//! legacy snake_case stragglers, so the renames are explicit where they
//! deviate.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchVars<'a> {
    pub raw_query: &'a str,
    pub count: u32,
    pub product: &'a str,
    pub query_source: &'a str,
    pub with_grok_translated_bio: bool,
}

impl<'a> SearchVars<'a> {
    pub fn latest(query: &'a str) -> Self {
        Self {
            raw_query: query,
            count: 20,
            product: "Latest",
            query_source: "typed_query",
            with_grok_translated_bio: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserByIdVars {
    pub user_id: String,
    pub with_safety_mode_user_fields: bool,
}

impl UserByIdVars {
    pub fn new(uid: u64) -> Self {
        Self {
            user_id: uid.to_string(),
            with_safety_mode_user_fields: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserByLoginVars<'a> {
    pub screen_name: &'a str,
    #[serde(rename = "withGrokTranslatedBio")]
    pub with_grok_translated_bio: bool,
}

impl<'a> UserByLoginVars<'a> {
    pub fn new(login: &'a str) -> Self {
        Self {
            screen_name: login,
            with_grok_translated_bio: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TweetDetailVars<'a> {
    pub focal_tweet_id: String,
    /// Only sent for the replies variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<&'a str>,
    #[serde(rename = "with_rux_injections")]
    pub with_rux_injections: bool,
    pub include_promoted_content: bool,
    pub with_community: bool,
    pub with_quick_promote_eligibility_tweet_fields: bool,
    pub with_birdwatch_notes: bool,
    pub with_voice: bool,
}

impl<'a> TweetDetailVars<'a> {
    pub fn new(twid: u64) -> Self {
        Self {
            focal_tweet_id: twid.to_string(),
            referrer: None,
            with_rux_injections: false,
            include_promoted_content: true,
            with_community: true,
            with_quick_promote_eligibility_tweet_fields: true,
            with_birdwatch_notes: true,
            with_voice: true,
        }
    }

    pub fn replies(twid: u64) -> Self {
        Self {
            referrer: Some("tweet"),
            ..Self::new(twid)
        }
    }
}

/// Shared by the follower-graph timelines (Followers, Following).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRelationsVars {
    pub user_id: String,
    pub count: u32,
    pub include_promoted_content: bool,
    pub with_grok_translated_bio: bool,
}

impl UserRelationsVars {
    pub fn new(uid: u64) -> Self {
        Self {
            user_id: uid.to_string(),
            count: 20,
            include_promoted_content: false,
            with_grok_translated_bio: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTweetsVars {
    pub user_id: String,
    pub count: u32,
    pub include_promoted_content: bool,
    pub with_quick_promote_eligibility_tweet_fields: bool,
    pub with_voice: bool,
}

impl UserTweetsVars {
    pub fn new(uid: u64) -> Self {
        Self {
            user_id: uid.to_string(),
            count: 40,
            include_promoted_content: true,
            with_quick_promote_eligibility_tweet_fields: true,
            with_voice: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMediaVars {
    pub user_id: String,
    pub count: u32,
    pub include_promoted_content: bool,
    pub with_client_event_token: bool,
    pub with_birdwatch_notes: bool,
    pub with_voice: bool,
}

impl UserMediaVars {
    pub fn new(uid: u64) -> Self {
        Self {
            user_id: uid.to_string(),
            count: 40,
            include_promoted_content: false,
            with_client_event_token: false,
            with_birdwatch_notes: false,
            with_voice: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTimelineVars {
    pub list_id: String,
    pub count: u32,
}

impl ListTimelineVars {
    pub fn new(list_id: u64) -> Self {
        Self {
            list_id: list_id.to_string(),
            count: 20,
        }
    }
}
