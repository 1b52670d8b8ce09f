use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_TIME_FILE: &str = "./vc_time_elapsed.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN must be set in the environment or .env file")]
    MissingToken,

    #[error("invalid guild id in VC_GUILD_IDS: {0:?}")]
    InvalidGuildId(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub time_file: PathBuf,
    /// Guilds to observe. Empty means every guild the bot is in.
    pub guild_ids: Vec<u64>,
}

impl Config {
    /// Reads `DISCORD_TOKEN`, `VC_TIME_FILE` and `VC_GUILD_IDS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("DISCORD_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let time_file = lookup("VC_TIME_FILE")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TIME_FILE.to_string())
            .into();

        let guild_ids = match lookup("VC_GUILD_IDS") {
            Some(raw) => parse_guild_ids(&raw)?,
            None => Vec::new(),
        };

        Ok(Self { token, time_file, guild_ids })
    }
}

fn parse_guild_ids(raw: &str) -> Result<Vec<u64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| ConfigError::InvalidGuildId(s.to_string())))
        .collect()
}
