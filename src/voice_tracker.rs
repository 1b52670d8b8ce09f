use chrono::{DateTime, Utc};
use serenity::all::{
    CommandDataOptionValue, CommandInteraction, CommandOptionType, CreateCommand,
    CreateCommandOption, CreateEmbed, CreateEmbedFooter, CreateInteractionResponse,
    CreateInteractionResponseMessage, GuildId, Interaction, Ready, User, UserId,
};
use serenity::async_trait;
use serenity::cache::Cache;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::format::{format_duration, share_percent};
use crate::session::{CompletedSession, SessionTracker, VoiceEvent};
use crate::store::{DurationStore, StoreError};

/// Discord allows at most 25 fields per embed.
pub const LEADERBOARD_SIZE: usize = 25;

const MEMBER_STATS_COLOUR: u32 = 0x2ECC71;
const LEADERBOARD_COLOUR: u32 = 0x3498DB;

/// Session tracking plus persistence for the watched guilds, independent of
/// the gateway. One instance is shared behind a mutex so voice updates are
/// applied one at a time.
#[derive(Debug)]
pub struct VoiceObserver {
    tracker: SessionTracker,
    store: DurationStore,
    guild_ids: Vec<u64>,
}

impl VoiceObserver {
    pub fn new(store: DurationStore, guild_ids: Vec<u64>) -> Self {
        Self {
            tracker: SessionTracker::new(),
            store,
            guild_ids,
        }
    }

    /// An empty guild list watches everything.
    pub fn watches(&self, guild_id: u64) -> bool {
        self.guild_ids.is_empty() || self.guild_ids.contains(&guild_id)
    }

    /// Starts timing a member who was already connected before observation began.
    pub fn seed(&mut self, member_id: u64, channel_id: u64, now: DateTime<Utc>) -> bool {
        self.tracker.seed(member_id, channel_id, now)
    }

    /// Feeds one voice-state update through the tracker and persists any
    /// finished session. The tracker is updated even when the write fails.
    pub fn on_voice_state(
        &mut self,
        member_id: u64,
        previous: Option<u64>,
        new: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Option<CompletedSession>, StoreError> {
        let Some(event) = VoiceEvent::from_transition(previous, new) else {
            return Ok(None);
        };

        let Some(record) = self.tracker.handle(member_id, event, now) else {
            return Ok(None);
        };

        self.store.record(record.member_id, record.elapsed_secs)?;
        Ok(Some(record))
    }

    pub fn member_total(&self, member_id: u64) -> Option<f64> {
        self.store.query(member_id)
    }

    pub fn leaderboard(&self, limit: usize) -> Vec<(u64, f64)> {
        self.store.leaderboard(limit)
    }

    pub fn grand_total(&self) -> f64 {
        self.store.grand_total()
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn store(&self) -> &DurationStore {
        &self.store
    }
}

pub struct VoiceTracker;

impl TypeMapKey for VoiceTracker {
    type Value = Arc<Mutex<VoiceObserver>>;
}

async fn shared_observer(ctx: &Context) -> Option<Arc<Mutex<VoiceObserver>>> {
    let data = ctx.data.read().await;
    let observer = data.get::<VoiceTracker>().cloned();
    if observer.is_none() {
        tracing::error!("voice observer missing from client data");
    }
    observer
}

fn commands() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("vc-time")
            .description("Show how long a member has spent in voice channels")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::User,
                    "member",
                    "Member to look up (defaults to you)",
                )
                .required(false),
            ),
        CreateCommand::new("vc-leaderboard")
            .description("Top members by time spent in voice channels"),
    ]
}

/// Bot flag carried by the update itself, falling back to the cached guild
/// member when the update has none. Unknown members count as people.
fn sent_by_bot(update_flag: Option<bool>, cached_flag: impl FnOnce() -> Option<bool>) -> bool {
    update_flag.or_else(cached_flag).unwrap_or(false)
}

/// Non-bot members currently sitting in a voice channel of the given guilds,
/// as `(member_id, channel_id)`.
fn connected_members(cache: &Cache, guilds: &[GuildId]) -> Vec<(u64, u64)> {
    let mut connected = Vec::new();
    for guild_id in guilds {
        let Some(guild) = cache.guild(*guild_id) else {
            tracing::warn!(%guild_id, "guild not in cache");
            continue;
        };
        for (user_id, state) in &guild.voice_states {
            let Some(channel_id) = state.channel_id else { continue };
            let is_bot = sent_by_bot(state.member.as_ref().map(|m| m.user.bot), || {
                guild.members.get(user_id).map(|m| m.user.bot)
            });
            if !is_bot {
                connected.push((user_id.get(), channel_id.get()));
            }
        }
    }
    connected
}

pub struct VoiceHandler;

#[async_trait]
impl EventHandler for VoiceHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, guilds = ready.guilds.len(), "bot is ready");

        let Some(observer) = shared_observer(&ctx).await else { return };
        let watched: Vec<GuildId> = {
            let observer = observer.lock().await;
            ready.guilds.iter().map(|g| g.id).filter(|id| observer.watches(id.get())).collect()
        };

        for guild_id in watched {
            match guild_id.set_commands(&ctx.http, commands()).await {
                Ok(registered) => {
                    tracing::debug!(%guild_id, count = registered.len(), "registered commands")
                }
                Err(e) => tracing::error!(%guild_id, error = ?e, "failed to register commands"),
            }
        }
    }

    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let Some(observer) = shared_observer(&ctx).await else { return };
        let watched: Vec<GuildId> = {
            let observer = observer.lock().await;
            guilds.into_iter().filter(|id| observer.watches(id.get())).collect()
        };

        let connected = connected_members(&ctx.cache, &watched);

        let now = Utc::now();
        let mut observer = observer.lock().await;
        for (member_id, channel_id) in connected {
            if observer.seed(member_id, channel_id, now) {
                tracing::debug!(
                    member_id,
                    channel_id,
                    "member was already in voice before observing"
                );
            }
        }
        tracing::info!(tracked = observer.tracker().len(), "observing voice channels");
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        let is_bot = sent_by_bot(new.member.as_ref().map(|m| m.user.bot), || {
            let guild = ctx.cache.guild(guild_id)?;
            guild.members.get(&new.user_id).map(|m| m.user.bot)
        });
        if is_bot {
            return;
        }

        let Some(observer) = shared_observer(&ctx).await else { return };
        let mut observer = observer.lock().await;
        if !observer.watches(guild_id.get()) {
            return;
        }

        let member_id = new.user_id.get();
        let previous = old.as_ref().and_then(|v| v.channel_id).map(|c| c.get());
        let current = new.channel_id.map(|c| c.get());

        match observer.on_voice_state(member_id, previous, current, Utc::now()) {
            Ok(Some(record)) => tracing::debug!(
                member_id,
                channel_id = record.channel_id,
                elapsed = record.elapsed_secs,
                "voice session ended"
            ),
            Ok(None) => {}
            Err(e) => tracing::error!(member_id, error = %e, "failed to persist voice time"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(cmd) = interaction else { return };
        match cmd.data.name.as_str() {
            "vc-time" => handle_vc_time(&ctx, &cmd).await,
            "vc-leaderboard" => handle_vc_leaderboard(&ctx, &cmd).await,
            _ => {}
        }
    }
}

async fn handle_vc_time(ctx: &Context, cmd: &CommandInteraction) {
    let target = cmd
        .data
        .options
        .iter()
        .find(|o| o.name == "member")
        .and_then(|o| match &o.value {
            CommandDataOptionValue::User(id) => Some(*id),
            _ => None,
        })
        .unwrap_or(cmd.user.id);
    tracing::debug!(user = %cmd.user.name, %target, "/vc-time");

    let Some(observer) = shared_observer(ctx).await else { return };
    let total = observer.lock().await.member_total(target.get());

    let user = if target == cmd.user.id {
        Some(&cmd.user)
    } else {
        cmd.data.resolved.users.get(&target)
    };
    respond(ctx, cmd, member_embed(target, user, total)).await;
}

async fn handle_vc_leaderboard(ctx: &Context, cmd: &CommandInteraction) {
    tracing::debug!(user = %cmd.user.name, "/vc-leaderboard");

    let Some(observer) = shared_observer(ctx).await else { return };
    let (rows, grand_total) = {
        let observer = observer.lock().await;
        (observer.leaderboard(LEADERBOARD_SIZE), observer.grand_total())
    };

    let mut embed = CreateEmbed::new()
        .title("Voice leaderboard")
        .colour(LEADERBOARD_COLOUR)
        .footer(CreateEmbedFooter::new(format!(
            "Total time in voice for all members: {}",
            format_duration(grand_total)
        )));
    if rows.is_empty() {
        embed = embed.description("No voice activity recorded yet.");
    }
    for (name, value) in leaderboard_fields(&rows, grand_total) {
        embed = embed.field(name, value, false);
    }
    respond(ctx, cmd, embed).await;
}

fn member_embed(target: UserId, user: Option<&User>, total: Option<f64>) -> CreateEmbed {
    let name = user.map(|u| u.name.clone()).unwrap_or_else(|| target.to_string());
    let mut embed = CreateEmbed::new()
        .title(format!("Voice stats for {}", name))
        .colour(MEMBER_STATS_COLOUR)
        .description(member_summary(target.get(), total));
    if let Some(user) = user {
        embed = embed.thumbnail(user.face());
    }
    embed
}

pub fn member_summary(member_id: u64, total: Option<f64>) -> String {
    match total {
        Some(secs) => format!(
            "<@{}> has spent **{}** in voice channels.",
            member_id,
            format_duration(secs)
        ),
        None => "No voice activity recorded.".to_string(),
    }
}

/// `(name, value)` pairs for the leaderboard embed, one per ranked member.
pub fn leaderboard_fields(rows: &[(u64, f64)], grand_total: f64) -> Vec<(String, String)> {
    rows.iter()
        .enumerate()
        .map(|(idx, (member_id, secs))| {
            (
                format!("**{}.**", idx + 1),
                format!(
                    "<@{}> **{}** ({:.1}%)",
                    member_id,
                    format_duration(*secs),
                    share_percent(*secs, grand_total)
                ),
            )
        })
        .collect()
}

async fn respond(ctx: &Context, cmd: &CommandInteraction, embed: CreateEmbed) {
    let response =
        CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed));
    if let Err(e) = cmd.create_response(&ctx.http, response).await {
        tracing::error!(command = %cmd.data.name, error = ?e, "failed to respond to command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_handles_unknown_member() {
        assert_eq!(member_summary(1, None), "No voice activity recorded.");
        assert_eq!(
            member_summary(1, Some(3661.0)),
            "<@1> has spent **1h 1m 1s** in voice channels."
        );
    }

    #[test]
    fn bot_flag_falls_back_to_cache() {
        assert!(sent_by_bot(None, || Some(true)));
        assert!(!sent_by_bot(None, || None));
        assert!(!sent_by_bot(Some(false), || Some(true)));
        assert!(sent_by_bot(Some(true), || None));
    }

    #[test]
    fn leaderboard_fields_rank_and_share() {
        let fields = leaderboard_fields(&[(10, 300.0), (20, 100.0)], 400.0);
        assert_eq!(
            fields,
            vec![
                ("**1.**".to_string(), "<@10> **5m** (75.0%)".to_string()),
                ("**2.**".to_string(), "<@20> **1m 40s** (25.0%)".to_string()),
            ]
        );
    }
}
