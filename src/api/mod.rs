//! Request composition over the queue client.
//!
//! GraphQL calls are `{base}/{query_id}/{name}` with `variables`,
//! `features`, and optional `fieldToggles` serialized as URL-encoded JSON
//! query parameters; mutations POST `{variables, features, queryId}`; REST
//! calls attach flat parameters. A queue is the operation name (GraphQL)
//! or the file stem of the last path segment (REST).

pub mod params;
pub mod timeline;

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};

use crate::client::transport::{ApiResponse, ReqwestTransportFactory};
use crate::client::{ClientEnv, QueueClient};
use crate::config::PoolConfig;
use crate::pool::AccountsPool;
use crate::rate_log::{RateLimitLog, ResponseDump};
use crate::store::Storage;
use crate::token::{SeededTxIdFactory, TokenSource};
use params::{
    ListTimelineVars, SearchVars, TweetDetailVars, UserByIdVars, UserByLoginVars, UserMediaVars,
    UserRelationsVars, UserTweetsVars,
};
use timeline::{TimelineOpts, TimelinePaginator};

pub const GQL_URL: &str = "https://x.com/i/api/graphql";
pub const REST_URL: &str = "https://x.com/i/api/1.1";

/// One remote call: GraphQL query id plus operation name. The name doubles
/// as the queue label: rate-limit windows are per (account, name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub query_id: &'static str,
    pub name: &'static str,
}

impl Operation {
    pub fn queue(&self) -> &'static str {
        self.name
    }

    pub fn url(&self) -> String {
        format!("{GQL_URL}/{}/{}", self.query_id, self.name)
    }
}

/// The operations this crate drives. Query ids rotate with the web client;
/// a stale entry surfaces as a (336) fatal at runtime.
pub mod ops {
    use super::Operation;

    pub const SEARCH_TIMELINE: Operation = Operation {
        query_id: "bshMIjqDk8LTXTq4w91WKw",
        name: "SearchTimeline",
    };
    pub const USER_BY_REST_ID: Operation = Operation {
        query_id: "WJ7rCtezBVT6nk6VM5R8Bw",
        name: "UserByRestId",
    };
    pub const USER_BY_SCREEN_NAME: Operation = Operation {
        query_id: "-oaLodhGbbnzJBACb1kk2Q",
        name: "UserByScreenName",
    };
    pub const TWEET_DETAIL: Operation = Operation {
        query_id: "6QzqakNMdh_YzBAR9SYPkQ",
        name: "TweetDetail",
    };
    pub const FOLLOWERS: Operation = Operation {
        query_id: "SCu9fVIlCUm-BM8-tL5pkQ",
        name: "Followers",
    };
    pub const FOLLOWING: Operation = Operation {
        query_id: "S5xUN9s2v4xk50KWGGvyvQ",
        name: "Following",
    };
    pub const USER_TWEETS: Operation = Operation {
        query_id: "lZRf8IC-GTuGxDwcsHW8aw",
        name: "UserTweets",
    };
    pub const USER_TWEETS_AND_REPLIES: Operation = Operation {
        query_id: "gXCeOBFsTOuimuCl1qXimg",
        name: "UserTweetsAndReplies",
    };
    pub const USER_MEDIA: Operation = Operation {
        query_id: "vFPc2LVIu7so2uA_gHQAdg",
        name: "UserMedia",
    };
    pub const LIST_LATEST_TWEETS_TIMELINE: Operation = Operation {
        query_id: "BkauSnPUDQTeeJsxq17opA",
        name: "ListLatestTweetsTimeline",
    };
    pub const CREATE_TWEET: Operation = Operation {
        query_id: "Uf3io9zVp1DsYxrmL5FJ7g",
        name: "CreateTweet",
    };
}

/// Base feature flags sent with every GraphQL call; per-call features merge
/// over these. Values mirror the web client.
pub static GQL_FEATURES: Lazy<Value> = Lazy::new(|| {
    json!({
        "articles_preview_enabled": true,
        "c9s_tweet_anatomy_moderator_badge_enabled": true,
        "communities_web_enable_tweet_community_results_fetch": true,
        "creator_subscriptions_quote_tweet_preview_enabled": false,
        "creator_subscriptions_tweet_preview_api_enabled": true,
        "freedom_of_speech_not_reach_fetch_enabled": true,
        "graphql_is_translatable_rweb_tweet_is_translatable_enabled": true,
        "longform_notetweets_consumption_enabled": true,
        "longform_notetweets_inline_media_enabled": true,
        "longform_notetweets_rich_text_read_enabled": true,
        "premium_content_api_read_enabled": false,
        "profile_label_improvements_pcf_label_in_post_enabled": true,
        "responsive_web_edit_tweet_api_enabled": true,
        "responsive_web_enhance_cards_enabled": false,
        "responsive_web_graphql_skip_user_profile_image_extensions_enabled": false,
        "responsive_web_graphql_timeline_navigation_enabled": true,
        "responsive_web_grok_analysis_button_from_backend": true,
        "responsive_web_grok_analyze_button_fetch_trends_enabled": false,
        "responsive_web_grok_analyze_post_followups_enabled": true,
        "responsive_web_grok_community_note_auto_translation_is_enabled": false,
        "responsive_web_grok_image_annotation_enabled": true,
        "responsive_web_grok_imagine_annotation_enabled": true,
        "responsive_web_grok_share_attachment_enabled": true,
        "responsive_web_grok_show_grok_translated_post": true,
        "responsive_web_jetfuel_frame": true,
        "responsive_web_profile_redirect_enabled": false,
        "responsive_web_twitter_article_tweet_consumption_enabled": true,
        "rweb_tipjar_consumption_enabled": true,
        "rweb_video_screen_enabled": false,
        "standardized_nudges_misinfo": true,
        "tweet_awards_web_tipping_enabled": false,
        "tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled": true,
        "verified_phone_label_enabled": false,
        "view_counts_everywhere_api_enabled": true,
    })
});

/// Per-queue field-toggle variants. Timelines differ in which article
/// rendering toggles the web client sends.
pub fn field_toggles(queue: &str) -> Option<Value> {
    match queue {
        "SearchTimeline" | "ListLatestTweetsTimeline" | "CommunityTweetsTimeline" => {
            Some(json!({"withArticleRichContentState": false}))
        }
        "UserMedia" | "UserTweets" | "UserTweetsAndReplies" => {
            Some(json!({"withArticlePlainText": false}))
        }
        "TweetDetail" => Some(json!({
            "withArticleRichContentState": true,
            "withArticlePlainText": false,
            "withGrokAnalyze": false,
            "withDisallowedReplyControls": false,
        })),
        _ => None,
    }
}

/// Merge `extra` over the base feature map.
pub fn merged_features(extra: Option<&Value>) -> Value {
    let mut features = GQL_FEATURES.clone();
    if let (Some(base), Some(Value::Object(extra))) = (features.as_object_mut(), extra) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    features
}

/// Serialize a typed variable struct into the generic blob the request
/// layer threads cursors through.
fn to_vars<T: Serialize>(v: T) -> Value {
    // Infallible for the structs in `params`: plain fields, string keys.
    serde_json::to_value(v).expect("variable struct serializes to JSON")
}

/// Serialize the GraphQL parameter blobs into query pairs.
pub fn gql_params(
    variables: &Value,
    features: &Value,
    toggles: Option<&Value>,
) -> Result<Vec<(String, String)>> {
    let mut params = vec![
        ("variables".to_string(), serde_json::to_string(variables)?),
        ("features".to_string(), serde_json::to_string(features)?),
    ];
    if let Some(t) = toggles {
        params.push(("fieldToggles".to_string(), serde_json::to_string(t)?));
    }
    Ok(params)
}

// ─── Api ──────────────────────────────────────────────────────────────────────

/// Entry point: owns the pool and the shared request plumbing, hands out
/// queue clients and paginators.
#[derive(Clone)]
pub struct Api {
    pool: AccountsPool,
    env: ClientEnv,
}

impl Api {
    /// Open the store at the configured path and wire up the default
    /// transport and token stand-in.
    pub async fn open(config: &PoolConfig) -> Result<Self> {
        let store = Storage::open(&config.db_path).await?;
        let pool = AccountsPool::new(store, config.raise_when_no_account);
        let env = ClientEnv {
            tokens: Arc::new(TokenSource::new(Arc::new(SeededTxIdFactory::default()))),
            transports: Arc::new(ReqwestTransportFactory),
            rate_log: Some(Arc::new(RateLimitLog::new(config.rate_log_dir()))),
            dump: config.debug.then(|| Arc::new(ResponseDump::new())),
            proxy: config.proxy.clone(),
        };
        Ok(Self { pool, env })
    }

    /// Assemble from explicit parts: custom transports, token factories,
    /// or an in-memory store.
    pub fn with_parts(pool: AccountsPool, env: ClientEnv) -> Self {
        Self { pool, env }
    }

    pub fn pool(&self) -> &AccountsPool {
        &self.pool
    }

    fn client(&self, queue: &str) -> QueueClient {
        QueueClient::new(self.pool.clone(), queue, self.env.clone())
    }

    // ─── Primitives ──────────────────────────────────────────────────────────

    /// Single GraphQL query.
    pub async fn gql_item(
        &self,
        op: Operation,
        variables: Value,
        extra_features: Option<Value>,
        toggles: Option<Value>,
    ) -> Result<Option<ApiResponse>> {
        let mut client = self.client(op.queue());
        let params = gql_params(
            &variables,
            &merged_features(extra_features.as_ref()),
            toggles.as_ref(),
        )?;
        let rep = client.get(&op.url(), params).await?;
        client.close().await?;
        Ok(rep)
    }

    /// GraphQL mutation (POST with a JSON body).
    pub async fn gql_mutation(
        &self,
        op: Operation,
        variables: Value,
        extra_features: Option<Value>,
    ) -> Result<Option<ApiResponse>> {
        let mut client = self.client(op.queue());
        let payload = json!({
            "variables": variables,
            "features": merged_features(extra_features.as_ref()),
            "queryId": op.query_id,
        });
        let rep = client.post(&op.url(), payload).await?;
        client.close().await?;
        Ok(rep)
    }

    /// REST GET. The queue defaults to the endpoint's file stem
    /// (`friendships/create.json` → `create`).
    pub async fn rest_get(
        &self,
        endpoint: &str,
        params: Vec<(String, String)>,
        queue: Option<&str>,
    ) -> Result<Option<ApiResponse>> {
        let derived = endpoint
            .rsplit('/')
            .next()
            .unwrap_or(endpoint)
            .trim_end_matches(".json")
            .to_string();
        let mut client = self.client(queue.unwrap_or(&derived));
        let rep = client
            .get(&format!("{REST_URL}/{endpoint}"), params)
            .await?;
        client.close().await?;
        Ok(rep)
    }

    /// Cursor-paginated timeline stream for `op`.
    pub fn timeline(&self, op: Operation, variables: Value, opts: TimelineOpts) -> TimelinePaginator {
        TimelinePaginator::new(self.client(op.queue()), op, variables, opts)
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Full-text search. `limit` bounds total entries (-1 = unbounded);
    /// pass a saved cursor via `opts` to resume.
    pub fn search(&self, query: &str, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(ops::SEARCH_TIMELINE, to_vars(SearchVars::latest(query)), opts)
    }

    pub async fn user_by_id(&self, uid: u64) -> Result<Option<ApiResponse>> {
        let features = json!({
            "hidden_profile_likes_enabled": true,
            "highlights_tweets_tab_ui_enabled": true,
            "creator_subscriptions_tweet_preview_api_enabled": true,
            "hidden_profile_subscriptions_enabled": true,
            "responsive_web_twitter_article_notes_tab_enabled": false,
            "subscriptions_feature_can_gift_premium": false,
            "profile_label_improvements_pcf_label_in_post_enabled": false,
        });
        self.gql_item(
            ops::USER_BY_REST_ID,
            to_vars(UserByIdVars::new(uid)),
            Some(features),
            None,
        )
        .await
    }

    pub async fn user_by_login(&self, login: &str) -> Result<Option<ApiResponse>> {
        let features = json!({
            "hidden_profile_subscriptions_enabled": true,
            "subscriptions_verification_info_is_identity_verified_enabled": true,
            "subscriptions_verification_info_verified_since_enabled": true,
            "highlights_tweets_tab_ui_enabled": true,
            "responsive_web_twitter_article_notes_tab_enabled": true,
            "subscriptions_feature_can_gift_premium": true,
        });
        let toggles = json!({"withPayments": false, "withAuxiliaryUserLabels": true});
        self.gql_item(
            ops::USER_BY_SCREEN_NAME,
            to_vars(UserByLoginVars::new(login)),
            Some(features),
            Some(toggles),
        )
        .await
    }

    pub async fn tweet_details(&self, twid: u64) -> Result<Option<ApiResponse>> {
        self.gql_item(
            ops::TWEET_DETAIL,
            to_vars(TweetDetailVars::new(twid)),
            None,
            field_toggles("TweetDetail"),
        )
        .await
    }

    /// Replies thread under a tweet. Pagination follows the
    /// `ShowMoreThreads` cursor rather than `Bottom`.
    pub fn tweet_replies(&self, twid: u64, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(
            ops::TWEET_DETAIL,
            to_vars(TweetDetailVars::replies(twid)),
            opts.cursor_type(timeline::CursorType::ShowMoreThreads),
        )
    }

    pub fn followers(&self, uid: u64, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(ops::FOLLOWERS, to_vars(UserRelationsVars::new(uid)), opts)
    }

    pub fn following(&self, uid: u64, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(ops::FOLLOWING, to_vars(UserRelationsVars::new(uid)), opts)
    }

    pub fn user_tweets(&self, uid: u64, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(ops::USER_TWEETS, to_vars(UserTweetsVars::new(uid)), opts)
    }

    pub fn user_media(&self, uid: u64, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(ops::USER_MEDIA, to_vars(UserMediaVars::new(uid)), opts)
    }

    pub fn list_timeline(&self, list_id: u64, opts: TimelineOpts) -> TimelinePaginator {
        self.timeline(
            ops::LIST_LATEST_TWEETS_TIMELINE,
            to_vars(ListTimelineVars::new(list_id)),
            opts,
        )
    }

    pub async fn create_tweet(&self, variables: Value) -> Result<Option<ApiResponse>> {
        self.gql_mutation(ops::CREATE_TWEET, variables, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_url_and_queue() {
        let op = ops::SEARCH_TIMELINE;
        assert_eq!(
            op.url(),
            "https://x.com/i/api/graphql/bshMIjqDk8LTXTq4w91WKw/SearchTimeline"
        );
        assert_eq!(op.queue(), "SearchTimeline");
    }

    #[test]
    fn gql_params_serialises_blobs() {
        let params = gql_params(
            &json!({"rawQuery": "rust"}),
            &json!({"f": true}),
            Some(&json!({"t": false})),
        )
        .unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].0, "variables");
        assert_eq!(params[0].1, r#"{"rawQuery":"rust"}"#);
        assert_eq!(params[2], ("fieldToggles".to_string(), r#"{"t":false}"#.to_string()));
    }

    #[test]
    fn merged_features_overrides_base() {
        let merged = merged_features(Some(&json!({"premium_content_api_read_enabled": true})));
        assert_eq!(merged["premium_content_api_read_enabled"], true);
        // Untouched base flags survive.
        assert_eq!(merged["articles_preview_enabled"], true);
    }

    #[test]
    fn field_toggles_vary_by_queue() {
        assert_eq!(
            field_toggles("SearchTimeline").unwrap()["withArticleRichContentState"],
            false
        );
        assert_eq!(
            field_toggles("UserTweets").unwrap()["withArticlePlainText"],
            false
        );
        assert!(field_toggles("TweetDetail").unwrap()["withArticleRichContentState"] == true);
        assert!(field_toggles("Followers").is_none());
    }
}
