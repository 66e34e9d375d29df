//! Configuration loading.
//!
//! Settings live in `sitrep.toml`, grouped by subsystem. Every key the
//! operator runbook documents as a flat environment variable
//! (`TELEGRAM_API_ID`, `GEMINI_API_KEY`, `BATCH_SIZE`, …) overrides its TOML
//! counterpart through an explicit table, so container deployments need no
//! config file at all.

use std::fmt;
use std::str::FromStr;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Top-level config (sitrep.toml + documented env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitrepConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Chat-network session credentials. Consumed by the external listener and
/// the companion bot; the core only validates their presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub api_id: i64,
    #[serde(default)]
    pub api_hash: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub session_string: String,
    /// Bot token for the output sink and control bot. Optional — without it
    /// the sender logs emissions instead of delivering them.
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Target chat for emitted summaries (numeric ID or @username).
    #[serde(default)]
    pub arabs_summary_out: String,
    /// Target chat for the smart-class digest.
    #[serde(default)]
    pub smart_chat: String,
    /// Chat the control bot answers in. Empty disables the control surface.
    #[serde(default)]
    pub control_chat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub gemini_api_key: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    /// Maximum extraction calls in any rolling hour.
    #[serde(default = "default_budget_hourly")]
    pub budget_hourly: u32,
    /// Maximum extraction calls in any rolling minute.
    #[serde(default = "default_rpm_limit")]
    pub rpm_limit: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_model: default_gemini_model(),
            budget_hourly: default_budget_hourly(),
            rpm_limit: default_rpm_limit(),
            request_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// A batch is forced out once its oldest message exceeds this age.
    #[serde(default = "default_max_batch_age_secs")]
    pub max_batch_age_secs: u64,
    /// Bounded pending queue per source class; overflow drops oldest.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Content-hash dedup horizon.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_age_secs: default_max_batch_age_secs(),
            queue_capacity: default_queue_capacity(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Distinct sources required before a cluster becomes eligible.
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    /// Score at which a single source may fast-track emission.
    #[serde(default = "default_authority_high_threshold")]
    pub authority_high_threshold: f64,
    /// How long a fast-track cluster must survive without contradiction.
    #[serde(default = "default_fast_track_hold_secs")]
    pub fast_track_hold_secs: u64,
    /// Open cluster with no new members for this long is closed.
    #[serde(default = "default_cluster_idle_ttl_secs")]
    pub cluster_idle_ttl_secs: u64,
    /// Window within which a same-source follow-up counts as a retraction.
    #[serde(default = "default_retraction_lookback_secs")]
    pub retraction_lookback_secs: i64,
    /// Corroboration boost factor (α).
    #[serde(default = "default_alpha")]
    pub corroboration_alpha: f64,
    /// Contradiction penalty factor (β).
    #[serde(default = "default_beta")]
    pub contradiction_beta: f64,
    /// Daily drift of idle sources back toward the neutral score (γ).
    #[serde(default = "default_gamma")]
    pub decay_gamma_per_day: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            min_sources: default_min_sources(),
            authority_high_threshold: default_authority_high_threshold(),
            fast_track_hold_secs: default_fast_track_hold_secs(),
            cluster_idle_ttl_secs: default_cluster_idle_ttl_secs(),
            retraction_lookback_secs: default_retraction_lookback_secs(),
            corroboration_alpha: default_alpha(),
            contradiction_beta: default_beta(),
            decay_gamma_per_day: default_gamma(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Minimum spacing between summary emissions. Retractions bypass it.
    #[serde(default = "default_summary_min_interval_secs")]
    pub summary_min_interval_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            summary_min_interval_secs: default_summary_min_interval_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_db_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            write_timeout_secs: default_db_write_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// One username per line; `#` comments and blanks ignored.
    #[serde(default = "default_arab_list")]
    pub arab_list: String,
    #[serde(default = "default_smart_list")]
    pub smart_list: String,
    /// Bracketed channel-signature trailers stripped during normalization,
    /// e.g. `"[via Frontline]"`.
    #[serde(default)]
    pub signature_patterns: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            arab_list: default_arab_list(),
            smart_list: default_smart_list(),
            signature_patterns: Vec::new(),
        }
    }
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_budget_hourly() -> u32 {
    60
}
fn default_rpm_limit() -> u32 {
    14
}
fn default_llm_timeout_secs() -> u64 {
    45
}
fn default_batch_size() -> usize {
    24
}
fn default_max_batch_age_secs() -> u64 {
    300
}
fn default_queue_capacity() -> usize {
    512
}
fn default_dedup_window_secs() -> i64 {
    6 * 3600
}
fn default_min_sources() -> usize {
    2
}
fn default_authority_high_threshold() -> f64 {
    75.0
}
fn default_fast_track_hold_secs() -> u64 {
    60
}
fn default_cluster_idle_ttl_secs() -> u64 {
    600
}
fn default_retraction_lookback_secs() -> i64 {
    600
}
fn default_alpha() -> f64 {
    3.0
}
fn default_beta() -> f64 {
    2.0
}
fn default_gamma() -> f64 {
    0.5
}
fn default_summary_min_interval_secs() -> u64 {
    300
}
fn default_send_timeout_secs() -> u64 {
    15
}
fn default_db_path() -> String {
    "sitrep.db".to_string()
}
fn default_db_write_timeout_secs() -> u64 {
    5
}
fn default_arab_list() -> String {
    "arab_sources.txt".to_string()
}
fn default_smart_list() -> String {
    "smart_sources.txt".to_string()
}

impl SitrepConfig {
    /// Load config from a TOML file with documented env var overrides.
    ///
    /// Checks in order: explicit path argument, then `./sitrep.toml`.
    /// A missing file is fine — defaults plus env vars must then satisfy
    /// [`SitrepConfig::validate`].
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or("sitrep.toml");

        let mut config: SitrepConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.apply_env()?;
        Ok(config)
    }

    /// Apply the flat documented environment keys over the loaded values.
    pub fn apply_env(&mut self) -> Result<()> {
        set_from_env("TELEGRAM_API_ID", &mut self.telegram.api_id)?;
        set_from_env("TELEGRAM_API_HASH", &mut self.telegram.api_hash)?;
        set_from_env("PHONE_NUMBER", &mut self.telegram.phone_number)?;
        set_from_env("TG_SESSION_STRING", &mut self.telegram.session_string)?;
        set_from_env("BOT_TOKEN", &mut self.telegram.bot_token)?;
        set_from_env("ARABS_SUMMARY_OUT", &mut self.output.arabs_summary_out)?;
        set_from_env("SMART_CHAT", &mut self.output.smart_chat)?;
        set_from_env("CONTROL_CHAT", &mut self.output.control_chat)?;
        set_from_env("GEMINI_API_KEY", &mut self.llm.gemini_api_key)?;
        set_from_env("GEMINI_MODEL", &mut self.llm.gemini_model)?;
        set_from_env("LLM_BUDGET_HOURLY", &mut self.llm.budget_hourly)?;
        set_from_env("LLM_RPM_LIMIT", &mut self.llm.rpm_limit)?;
        set_from_env("BATCH_SIZE", &mut self.pipeline.batch_size)?;
        set_from_env("MAX_BATCH_AGE", &mut self.pipeline.max_batch_age_secs)?;
        set_from_env(
            "SUMMARY_MIN_INTERVAL",
            &mut self.sender.summary_min_interval_secs,
        )?;
        set_from_env("MIN_SOURCES", &mut self.correlation.min_sources)?;
        set_from_env(
            "AUTHORITY_HIGH_THRESHOLD",
            &mut self.correlation.authority_high_threshold,
        )?;
        set_from_env("DB_PATH", &mut self.database.path)?;
        Ok(())
    }

    /// Reject configs that cannot run. Lists every missing required key in
    /// one message so the operator fixes them in a single pass.
    pub fn validate(&self) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();
        if self.telegram.api_id == 0 {
            missing.push("TELEGRAM_API_ID");
        }
        if self.telegram.api_hash.is_empty() {
            missing.push("TELEGRAM_API_HASH");
        }
        if self.telegram.phone_number.is_empty() {
            missing.push("PHONE_NUMBER");
        }
        if self.telegram.session_string.is_empty() {
            missing.push("TG_SESSION_STRING");
        }
        if self.output.arabs_summary_out.is_empty() {
            missing.push("ARABS_SUMMARY_OUT");
        }
        if self.output.smart_chat.is_empty() {
            missing.push("SMART_CHAT");
        }
        if self.llm.gemini_api_key.is_empty() {
            missing.push("GEMINI_API_KEY");
        }
        if !missing.is_empty() {
            return Err(CoreError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        if self.pipeline.batch_size == 0 {
            return Err(CoreError::Config("BATCH_SIZE must be >= 1".into()));
        }
        if self.correlation.min_sources == 0 {
            return Err(CoreError::Config("MIN_SOURCES must be >= 1".into()));
        }
        if self.llm.budget_hourly == 0 || self.llm.rpm_limit == 0 {
            return Err(CoreError::Config(
                "LLM_BUDGET_HOURLY and LLM_RPM_LIMIT must be >= 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.correlation.authority_high_threshold) {
            return Err(CoreError::Config(
                "AUTHORITY_HIGH_THRESHOLD must be within [0, 100]".into(),
            ));
        }
        Ok(())
    }
}

fn set_from_env<T>(key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e| CoreError::Config(format!("{}: {}", key, e)))?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}
