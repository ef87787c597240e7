//! Startup Configuration
//!
//! Everything comes from the environment (a `.env` file is loaded first).
//! Any missing or malformed value is a `Config` error and stops the process
//! before the first prompt.

use std::path::PathBuf;
use std::str::FromStr;

use dm_agent_core::{AgentConfig, AgentError, DispatchMode, Result};

const RULE_WIDTH: usize = 80;

/// Resolved settings
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    /// Completion service base URL
    pub base_url: String,

    /// Bearer token, empty for local runners
    pub api_key: String,

    /// Model used for streamed replies
    pub chat_model: String,

    /// Model used for tool detection
    pub tools_model: String,

    /// Tool registry endpoint
    pub mcp_url: String,

    pub instructions_path: PathBuf,

    pub character_sheet_path: PathBuf,

    pub chat_temperature: f32,

    /// Reply length cap, unset leaves it to the runner
    pub max_tokens: Option<u32>,

    /// `0` or `1` dispatch tools one at a time
    pub tool_concurrency: usize,

    pub remember_replies: bool,

    pub request_timeout_secs: u64,
}

/// Persona text seeded into the chat buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Persona {
    pub instructions: String,
    pub character_sheet: String,
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AgentError::Config(format!("{key} not set")))
        };

        let chat_temperature: f32 = parse_or(&lookup, "DM_CHAT_TEMPERATURE", 0.5)?;
        if !(0.0..=2.0).contains(&chat_temperature) {
            return Err(AgentError::Config(format!(
                "DM_CHAT_TEMPERATURE must be between 0 and 2, got {chat_temperature}"
            )));
        }

        Ok(Self {
            base_url: required("MODEL_RUNNER_BASE_URL")?,
            api_key: lookup("MODEL_RUNNER_API_KEY").unwrap_or_default(),
            chat_model: required("MODEL_RUNNER_CHAT_MODEL")?,
            tools_model: required("MODEL_RUNNER_TOOLS_MODEL")?,
            mcp_url: required("MCP_HOST_URL")?,
            instructions_path: lookup("DM_INSTRUCTIONS_PATH")
                .map_or_else(|| "instructions.md".into(), PathBuf::from),
            character_sheet_path: lookup("DM_CHARACTER_SHEET_PATH")
                .map_or_else(|| "character_sheet.md".into(), PathBuf::from),
            chat_temperature,
            max_tokens: parse_optional(&lookup, "DM_MAX_TOKENS")?,
            tool_concurrency: parse_or(&lookup, "DM_TOOL_CONCURRENCY", 0)?,
            remember_replies: parse_flag(&lookup, "DM_REMEMBER_REPLIES")?,
            request_timeout_secs: parse_or(&lookup, "DM_REQUEST_TIMEOUT_SECS", 120)?,
        })
    }

    /// Read the instructions and character sheet files
    pub fn load_persona(&self) -> Result<Persona> {
        let read = |path: &PathBuf| {
            std::fs::read_to_string(path)
                .map_err(|e| AgentError::Config(format!("Cannot read {}: {e}", path.display())))
        };

        Ok(Persona {
            instructions: read(&self.instructions_path)?,
            character_sheet: read(&self.character_sheet_path)?,
        })
    }

    /// Orchestration settings for the agent
    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(&self.tools_model, &self.chat_model);
        config.chat = config.chat.temperature(self.chat_temperature);
        if let Some(max_tokens) = self.max_tokens {
            config.chat = config.chat.max_tokens(max_tokens);
        }
        config.dispatch = DispatchMode::from_limit(self.tool_concurrency);
        config.remember_replies = self.remember_replies;
        config
    }

    /// Startup banner naming the model runner and both models
    pub fn banner(&self) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        format!(
            "{rule}\nModel Runner Base URL: {}\nModel Runner Chat Model: {}\nModel Runner Tools Model: {}\n{rule}",
            self.base_url, self.chat_model, self.tools_model
        )
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|e| AgentError::Config(format!("{key}={v:?} is invalid: {e}"))),
    }
}

fn parse_optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|e| AgentError::Config(format!("{key}={v:?} is invalid: {e}"))),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("" | "0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(AgentError::Config(format!("{key}={other:?} is not a boolean"))),
    }
}
