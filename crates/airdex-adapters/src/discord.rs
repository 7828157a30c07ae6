//! Discord forum / text channel scraper (source B), over the REST API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use airdex_core::{parse_timestamp, Candidate, ForumPost, IcaoExtractor, Provenance};
use airdex_storage::{HttpFetcher, RequestSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{AdapterContext, AdapterError, CandidateSource};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

const SOURCE_ID: &str = "discord";
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;
const CHANNEL_TYPE_GUILD_FORUM: u64 = 15;
const CHANNEL_TYPE_GUILD_MEDIA: u64 = 16;
const PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub channel_id: u64,
    pub api_base: String,
    pub concurrency: usize,
    pub unit_timeout: Duration,
}

impl DiscordConfig {
    pub fn new(bot_token: impl Into<String>, channel_id: u64) -> Self {
        Self {
            bot_token: bot_token.into(),
            channel_id,
            api_base: DISCORD_API_BASE.to_string(),
            concurrency: 8,
            unit_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u64,
    #[serde(default)]
    pub guild_id: Option<String>,
}

impl ChannelInfo {
    pub fn is_forum(&self) -> bool {
        matches!(self.kind, CHANNEL_TYPE_GUILD_FORUM | CHANNEL_TYPE_GUILD_MEDIA)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default)]
    pub archive_timestamp: Option<String>,
    #[serde(default)]
    pub create_timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub thread_metadata: Option<ThreadMetadata>,
}

impl ThreadInfo {
    fn archive_timestamp(&self) -> Option<&str> {
        self.thread_metadata.as_ref()?.archive_timestamp.as_deref()
    }

    /// Last message time if known, else the thread creation time.
    pub fn activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_id
            .as_deref()
            .and_then(snowflake_time)
            .or_else(|| {
                self.thread_metadata
                    .as_ref()?
                    .create_timestamp
                    .as_deref()
                    .and_then(parse_timestamp)
            })
            .or_else(|| snowflake_time(&self.id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadList {
    #[serde(default)]
    pub threads: Vec<ThreadInfo>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAuthor {
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub author: MessageAuthor,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
}

impl MessageInfo {
    pub fn activity_at(&self) -> Option<DateTime<Utc>> {
        self.edited_timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.timestamp.as_deref().and_then(parse_timestamp))
            .or_else(|| snowflake_time(&self.id))
    }
}

/// Creation time encoded in a Discord snowflake id.
pub fn snowflake_time(id: &str) -> Option<DateTime<Utc>> {
    let raw: u64 = id.trim().parse().ok()?;
    let millis = i64::try_from(raw >> 22).ok()? + DISCORD_EPOCH_MS;
    DateTime::from_timestamp_millis(millis)
}

pub struct DiscordForumSource {
    http: Arc<HttpFetcher>,
    extractor: Arc<IcaoExtractor>,
    config: DiscordConfig,
}

impl DiscordForumSource {
    pub fn new(http: Arc<HttpFetcher>, extractor: Arc<IcaoExtractor>, config: DiscordConfig) -> Self {
        Self {
            http,
            extractor,
            config,
        }
    }

    fn request(&self, path: &str) -> RequestSpec {
        RequestSpec::get(format!("{}{}", self.config.api_base.trim_end_matches('/'), path))
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .header("Accept", "application/json")
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &AdapterContext,
        path: &str,
    ) -> Result<T, AdapterError> {
        Ok(self.http.fetch_json(ctx.run_id, SOURCE_ID, &self.request(path)).await?)
    }

    async fn collect_forum(
        &self,
        ctx: &AdapterContext,
        channel: &ChannelInfo,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let Some(guild_id) = channel.guild_id.as_deref() else {
            warn!(channel_id = %channel.id, "forum channel has no guild, skipping");
            return Ok(Vec::new());
        };

        let active: ThreadList = self.get(ctx, &format!("/guilds/{guild_id}/threads/active")).await?;
        let mut threads: Vec<ThreadInfo> = active
            .threads
            .into_iter()
            .filter(|t| t.parent_id.as_deref() == Some(channel.id.as_str()))
            .collect();
        info!(active = threads.len(), "forum active threads");

        match self.archived_threads(ctx, &channel.id).await {
            Ok(archived) => {
                info!(archived = archived.len(), "forum archived threads");
                threads.extend(archived);
            }
            Err(err) => warn!(error = %err, "archived threads unavailable, continuing with active ones"),
        }

        Ok(self.resolve_threads(ctx, guild_id, threads).await)
    }

    async fn archived_threads(
        &self,
        ctx: &AdapterContext,
        channel_id: &str,
    ) -> Result<Vec<ThreadInfo>, AdapterError> {
        let mut threads = Vec::new();
        let mut before: Option<String> = None;
        loop {
            let mut path = format!("/channels/{channel_id}/threads/archived/public?limit={PAGE_LIMIT}");
            if let Some(before) = &before {
                path.push_str("&before=");
                path.push_str(&before.replace('+', "%2B"));
            }
            let page: ThreadList = self.get(ctx, &path).await?;
            let next = page
                .threads
                .last()
                .and_then(|t| t.archive_timestamp())
                .map(ToString::to_string);
            threads.extend(page.threads);

            if !page.has_more {
                break;
            }
            match next {
                Some(next) if before.as_deref() != Some(next.as_str()) => before = Some(next),
                _ => break,
            }
        }
        Ok(threads)
    }

    async fn resolve_threads(
        &self,
        ctx: &AdapterContext,
        guild_id: &str,
        threads: Vec<ThreadInfo>,
    ) -> Vec<Candidate> {
        resolve_thread_candidates(
            &self.extractor,
            guild_id,
            threads,
            self.config.concurrency,
            self.config.unit_timeout,
            |thread_id| {
                let path = format!("/channels/{thread_id}/messages/{thread_id}");
                async move { self.get::<MessageInfo>(ctx, &path).await }
            },
        )
        .await
    }

    async fn collect_text_channel(
        &self,
        ctx: &AdapterContext,
        channel: &ChannelInfo,
    ) -> Result<Vec<Candidate>, AdapterError> {
        let Some(guild_id) = channel.guild_id.as_deref() else {
            warn!(channel_id = %channel.id, "text channel has no guild, skipping");
            return Ok(Vec::new());
        };

        let mut messages: Vec<MessageInfo> = Vec::new();
        let mut before: Option<String> = None;
        loop {
            let mut path = format!("/channels/{}/messages?limit={PAGE_LIMIT}", channel.id);
            if let Some(before) = &before {
                path.push_str("&before=");
                path.push_str(before);
            }
            let page: Vec<MessageInfo> = self.get(ctx, &path).await?;
            let page_len = page.len();
            before = page.last().map(|m| m.id.clone());
            messages.extend(page);
            if page_len < PAGE_LIMIT || before.is_none() {
                break;
            }
        }
        info!(messages = messages.len(), "text channel history scanned");

        // The API pages newest first; scan oldest first.
        messages.reverse();
        Ok(messages
            .iter()
            .filter_map(|m| candidate_from_message(&self.extractor, m, guild_id, &channel.id))
            .collect())
    }
}

#[async_trait]
impl CandidateSource for DiscordForumSource {
    fn source(&self) -> Provenance {
        Provenance::Discord
    }

    async fn collect(&self, ctx: &AdapterContext) -> Result<Vec<Candidate>, AdapterError> {
        let channel: ChannelInfo = self
            .get(ctx, &format!("/channels/{}", self.config.channel_id))
            .await?;
        info!(channel_id = %channel.id, kind = channel.kind, "discord channel");

        let candidates = if channel.is_forum() {
            self.collect_forum(ctx, &channel).await?
        } else {
            self.collect_text_channel(ctx, &channel).await?
        };
        info!(candidates = candidates.len(), "discord scrape finished");
        Ok(candidates)
    }
}

/// Fetch starter messages on a bounded pool and turn threads into claims in input order.
/// Each fetch fails or times out on its own; that thread then falls back to its title.
pub async fn resolve_thread_candidates<F, Fut>(
    extractor: &IcaoExtractor,
    guild_id: &str,
    threads: Vec<ThreadInfo>,
    concurrency: usize,
    unit_timeout: Duration,
    fetch_starter: F,
) -> Vec<Candidate>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<MessageInfo, AdapterError>>,
{
    let fetch_starter = &fetch_starter;
    let mut resolved: Vec<(usize, Option<Candidate>)> = stream::iter(threads.into_iter().enumerate())
        .map(|(index, thread)| async move {
            let starter = match tokio::time::timeout(unit_timeout, fetch_starter(thread.id.clone())).await {
                Ok(Ok(message)) => Some(message),
                Ok(Err(err)) => {
                    debug!(thread_id = %thread.id, error = %err, "starter message unavailable");
                    None
                }
                Err(_) => {
                    warn!(thread_id = %thread.id, "starter message fetch timed out");
                    None
                }
            };
            let candidate = candidate_from_thread(extractor, &thread, guild_id, starter.as_ref());
            (index, candidate)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    resolved.sort_by_key(|(index, _)| *index);
    resolved.into_iter().filter_map(|(_, candidate)| candidate).collect()
}

/// Identifier from the thread title, else from the starter message.
pub fn candidate_from_thread(
    extractor: &IcaoExtractor,
    thread: &ThreadInfo,
    guild_id: &str,
    starter: Option<&MessageInfo>,
) -> Option<Candidate> {
    let icao = thread
        .name
        .as_deref()
        .and_then(|name| extractor.extract(name))
        .or_else(|| starter.and_then(|m| extractor.extract(&m.content)))?;

    Some(Candidate::forum(
        icao,
        ForumPost {
            author: starter
                .map(|m| m.author.username.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            discord_thread: format!("https://discord.com/channels/{guild_id}/{}", thread.id),
            activity_at: thread.activity_at(),
        },
    ))
}

pub fn candidate_from_message(
    extractor: &IcaoExtractor,
    message: &MessageInfo,
    guild_id: &str,
    channel_id: &str,
) -> Option<Candidate> {
    if message.author.bot {
        return None;
    }
    let icao = extractor.extract(&message.content)?;
    Some(Candidate::forum(
        icao,
        ForumPost {
            author: message.author.username.clone(),
            discord_thread: format!(
                "https://discord.com/channels/{guild_id}/{channel_id}/{}",
                message.id
            ),
            activity_at: message.activity_at(),
        },
    ))
}
