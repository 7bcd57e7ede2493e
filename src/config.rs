//! Configuration types.
//!
//! Two layers:
//! - [`AppConfig`] — process configuration read once from the environment.
//! - [`RuntimeSettings`] — operator-tunable values (rate-limiter bounds,
//!   automation toggle, survey texts) persisted in the `settings` table and
//!   injected into the controller, the survey service and the arbiter.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{ConfigError, Error};
use crate::store::Database;

/// Hard ceiling for `rate_limiter.max_seconds`.
pub const MAX_DELAY_CEILING_SECS: u64 = 300;

/// Allowed range for `arbitration.response_delay_seconds`.
pub const RESPONSE_DELAY_RANGE: std::ops::RangeInclusive<u64> = 1..=30;

pub const KEY_MIN_SECONDS: &str = "rate_limiter.min_seconds";
pub const KEY_MAX_SECONDS: &str = "rate_limiter.max_seconds";
pub const KEY_RESPONSE_DELAY: &str = "arbitration.response_delay_seconds";
pub const KEY_AUTOMATION_ENABLED: &str = "arbitration.globally_enabled";
pub const KEY_SURVEY_QUESTION: &str = "survey.question";
pub const KEY_SURVEY_FOLLOW_UP: &str = "survey.follow_up";
pub const KEY_SURVEY_REMINDER: &str = "survey.reminder";
pub const KEY_SURVEY_THANK_YOU: &str = "survey.thank_you";
pub const KEY_ASSISTANT_PROMPT: &str = "assistant.system_prompt";
pub const KEY_ASSISTANT_RATE_LIMITED: &str = "assistant.rate_limited_reply";
pub const KEY_ASSISTANT_QUOTA: &str = "assistant.quota_reply";

// ── Runtime settings ────────────────────────────────────────────────

/// Inter-send delay window in whole seconds. Always `min <= max <= 300`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBounds {
    min_seconds: u64,
    max_seconds: u64,
}

impl RateLimitBounds {
    /// Validate and build a delay window.
    pub fn new(min_seconds: u64, max_seconds: u64) -> Result<Self, ConfigError> {
        if max_seconds > MAX_DELAY_CEILING_SECS {
            return Err(ConfigError::InvalidValue {
                key: KEY_MAX_SECONDS.into(),
                message: format!("{max_seconds}s exceeds the {MAX_DELAY_CEILING_SECS}s ceiling"),
            });
        }
        if min_seconds > max_seconds {
            return Err(ConfigError::InvalidValue {
                key: KEY_MIN_SECONDS.into(),
                message: format!("min {min_seconds}s is above max {max_seconds}s"),
            });
        }
        Ok(Self {
            min_seconds,
            max_seconds,
        })
    }

    pub fn min_seconds(&self) -> u64 {
        self.min_seconds
    }

    pub fn max_seconds(&self) -> u64 {
        self.max_seconds
    }
}

impl Default for RateLimitBounds {
    fn default() -> Self {
        Self {
            min_seconds: 5,
            max_seconds: 15,
        }
    }
}

/// Automated-reply arbitration knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationSettings {
    /// Master switch; when off no AI call is ever attempted.
    pub globally_enabled: bool,
    /// Grace period given to a human operator before the assistant answers.
    pub response_delay_seconds: u64,
}

impl ArbitrationSettings {
    pub fn response_delay(&self) -> Duration {
        Duration::from_secs(self.response_delay_seconds)
    }
}

impl Default for ArbitrationSettings {
    fn default() -> Self {
        Self {
            globally_enabled: true,
            response_delay_seconds: 5,
        }
    }
}

/// Texts used by the survey lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyMessages {
    /// Sent when a survey is dispatched. Supports the message placeholders.
    pub question: String,
    /// Sent after a valid rating, soliciting optional feedback.
    pub follow_up: String,
    /// Sent when a reply is not a valid 1–5 rating.
    pub reminder: String,
    /// Sent after feedback text arrives. Empty disables it.
    pub thank_you: String,
}

impl Default for SurveyMessages {
    fn default() -> Self {
        Self {
            question: "Olá {first_name}! Como você avalia a entrega do pedido {order}? \
                       Responda com uma nota de 1 a 5."
                .into(),
            follow_up: "Obrigado pela nota! Quer deixar algum comentário sobre a entrega?".into(),
            reminder: "Por favor, responda apenas com um número de 1 a 5.".into(),
            thank_you: "Agradecemos o seu retorno!".into(),
        }
    }
}

/// Texts and prompt used by the automated responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantSettings {
    pub system_prompt: String,
    /// Sent when the AI provider rate-limits us.
    pub rate_limited_reply: String,
    /// Sent when the AI provider quota or credentials are exhausted.
    pub quota_reply: String,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            rate_limited_reply: "Estamos com muitas mensagens agora. \
                                 Por favor, tente novamente em alguns minutos."
                .into(),
            quota_reply: "No momento não consigo responder automaticamente. \
                          Por favor, entre em contato com o suporte."
                .into(),
        }
    }
}

/// Default system prompt for the delivery assistant.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the customer service assistant of a delivery \
company, chatting with a customer over WhatsApp. Answer in Brazilian Portuguese, briefly and \
politely. Use only the order and delivery facts given in the context; if you do not know \
something, say a human attendant will follow up. Never invent delivery dates.";

/// Full snapshot of operator-tunable settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub rate_limits: RateLimitBounds,
    pub arbitration: ArbitrationSettings,
    pub survey: SurveyMessages,
    pub assistant: AssistantSettings,
}

impl Settings {
    /// Build settings from persisted key/value rows. Missing keys keep their
    /// defaults; present but invalid values are an error.
    pub fn from_rows(rows: &[(String, String)]) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        let mut min = settings.rate_limits.min_seconds;
        let mut max = settings.rate_limits.max_seconds;

        for (key, value) in rows {
            match key.as_str() {
                KEY_MIN_SECONDS => min = parse_value(key, value)?,
                KEY_MAX_SECONDS => max = parse_value(key, value)?,
                KEY_RESPONSE_DELAY => {
                    let delay: u64 = parse_value(key, value)?;
                    settings.arbitration.response_delay_seconds = validate_response_delay(delay)?;
                }
                KEY_AUTOMATION_ENABLED => {
                    settings.arbitration.globally_enabled = parse_value(key, value)?
                }
                KEY_SURVEY_QUESTION => settings.survey.question = value.clone(),
                KEY_SURVEY_FOLLOW_UP => settings.survey.follow_up = value.clone(),
                KEY_SURVEY_REMINDER => settings.survey.reminder = value.clone(),
                KEY_SURVEY_THANK_YOU => settings.survey.thank_you = value.clone(),
                KEY_ASSISTANT_PROMPT => settings.assistant.system_prompt = value.clone(),
                KEY_ASSISTANT_RATE_LIMITED => settings.assistant.rate_limited_reply = value.clone(),
                KEY_ASSISTANT_QUOTA => settings.assistant.quota_reply = value.clone(),
                other => tracing::debug!(key = other, "Ignoring unknown setting"),
            }
        }

        settings.rate_limits = RateLimitBounds::new(min, max)?;
        Ok(settings)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{value:?}: {e}"),
    })
}

fn validate_response_delay(seconds: u64) -> Result<u64, ConfigError> {
    if RESPONSE_DELAY_RANGE.contains(&seconds) {
        Ok(seconds)
    } else {
        Err(ConfigError::InvalidValue {
            key: KEY_RESPONSE_DELAY.into(),
            message: format!(
                "{seconds}s is outside {}..={}",
                RESPONSE_DELAY_RANGE.start(),
                RESPONSE_DELAY_RANGE.end()
            ),
        })
    }
}

/// Injected, persisted settings service.
///
/// Every update validates, persists and swaps under a single write lock, so
/// readers never observe a `min > max` window.
pub struct RuntimeSettings {
    store: Arc<dyn Database>,
    current: RwLock<Settings>,
}

impl RuntimeSettings {
    /// Load persisted settings (defaults for missing keys).
    pub async fn load(store: Arc<dyn Database>) -> Result<Arc<Self>, Error> {
        let rows = store.list_settings().await?;
        let settings = Settings::from_rows(&rows)?;
        info!(
            min_seconds = settings.rate_limits.min_seconds(),
            max_seconds = settings.rate_limits.max_seconds(),
            automation = settings.arbitration.globally_enabled,
            "Runtime settings loaded"
        );
        Ok(Arc::new(Self {
            store,
            current: RwLock::new(settings),
        }))
    }

    /// Full copy of the current settings.
    pub async fn snapshot(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn rate_limits(&self) -> RateLimitBounds {
        self.current.read().await.rate_limits
    }

    pub async fn arbitration(&self) -> ArbitrationSettings {
        self.current.read().await.arbitration
    }

    pub async fn survey_messages(&self) -> SurveyMessages {
        self.current.read().await.survey.clone()
    }

    pub async fn assistant(&self) -> AssistantSettings {
        self.current.read().await.assistant.clone()
    }

    /// Set the lower bound; rejected when above the current max.
    pub async fn set_min_delay(&self, min_seconds: u64) -> Result<RateLimitBounds, Error> {
        let mut current = self.current.write().await;
        let bounds = RateLimitBounds::new(min_seconds, current.rate_limits.max_seconds)?;
        self.store
            .upsert_settings(&[(KEY_MIN_SECONDS.into(), min_seconds.to_string())])
            .await?;
        current.rate_limits = bounds;
        info!(min_seconds, "Rate limiter min updated");
        Ok(bounds)
    }

    /// Set the upper bound; rejected when below the current min or above the ceiling.
    pub async fn set_max_delay(&self, max_seconds: u64) -> Result<RateLimitBounds, Error> {
        let mut current = self.current.write().await;
        let bounds = RateLimitBounds::new(current.rate_limits.min_seconds, max_seconds)?;
        self.store
            .upsert_settings(&[(KEY_MAX_SECONDS.into(), max_seconds.to_string())])
            .await?;
        current.rate_limits = bounds;
        info!(max_seconds, "Rate limiter max updated");
        Ok(bounds)
    }

    /// Replace both bounds at once.
    pub async fn set_rate_limits(
        &self,
        min_seconds: u64,
        max_seconds: u64,
    ) -> Result<RateLimitBounds, Error> {
        let bounds = RateLimitBounds::new(min_seconds, max_seconds)?;
        let mut current = self.current.write().await;
        self.store
            .upsert_settings(&[
                (KEY_MIN_SECONDS.into(), min_seconds.to_string()),
                (KEY_MAX_SECONDS.into(), max_seconds.to_string()),
            ])
            .await?;
        current.rate_limits = bounds;
        info!(min_seconds, max_seconds, "Rate limiter bounds updated");
        Ok(bounds)
    }

    /// Update the arbitration toggle and grace period.
    pub async fn set_arbitration(
        &self,
        arbitration: ArbitrationSettings,
    ) -> Result<ArbitrationSettings, Error> {
        validate_response_delay(arbitration.response_delay_seconds)?;
        let mut current = self.current.write().await;
        self.store
            .upsert_settings(&[
                (
                    KEY_AUTOMATION_ENABLED.into(),
                    arbitration.globally_enabled.to_string(),
                ),
                (
                    KEY_RESPONSE_DELAY.into(),
                    arbitration.response_delay_seconds.to_string(),
                ),
            ])
            .await?;
        current.arbitration = arbitration;
        info!(
            enabled = arbitration.globally_enabled,
            delay_secs = arbitration.response_delay_seconds,
            "Arbitration settings updated"
        );
        Ok(arbitration)
    }

    /// Replace the survey texts.
    pub async fn set_survey_messages(&self, messages: SurveyMessages) -> Result<(), Error> {
        for (key, value) in [
            (KEY_SURVEY_QUESTION, &messages.question),
            (KEY_SURVEY_FOLLOW_UP, &messages.follow_up),
            (KEY_SURVEY_REMINDER, &messages.reminder),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must not be empty".into(),
                }
                .into());
            }
        }
        let mut current = self.current.write().await;
        self.store
            .upsert_settings(&[
                (KEY_SURVEY_QUESTION.into(), messages.question.clone()),
                (KEY_SURVEY_FOLLOW_UP.into(), messages.follow_up.clone()),
                (KEY_SURVEY_REMINDER.into(), messages.reminder.clone()),
                (KEY_SURVEY_THANK_YOU.into(), messages.thank_you.clone()),
            ])
            .await?;
        current.survey = messages;
        Ok(())
    }

    /// Replace the assistant prompt and fallback texts.
    pub async fn set_assistant(&self, assistant: AssistantSettings) -> Result<(), Error> {
        let mut current = self.current.write().await;
        self.store
            .upsert_settings(&[
                (KEY_ASSISTANT_PROMPT.into(), assistant.system_prompt.clone()),
                (
                    KEY_ASSISTANT_RATE_LIMITED.into(),
                    assistant.rate_limited_reply.clone(),
                ),
                (KEY_ASSISTANT_QUOTA.into(), assistant.quota_reply.clone()),
            ])
            .await?;
        current.assistant = assistant;
        Ok(())
    }
}

// ── Survey policy ───────────────────────────────────────────────────

/// Time thresholds driving the survey sweepers.
#[derive(Debug, Clone)]
pub struct SurveyPolicy {
    /// `pending`/`sent` surveys older than this without a rating expire.
    pub expire_after: chrono::Duration,
    /// `awaiting_feedback` surveys older than this are finalized.
    pub finalize_after: chrono::Duration,
    /// Cron schedule for both sweeps.
    pub sweep_schedule: String,
}

impl Default for SurveyPolicy {
    fn default() -> Self {
        Self {
            expire_after: chrono::Duration::hours(48),
            finalize_after: chrono::Duration::hours(24),
            sweep_schedule: "0 */15 * * * *".into(),
        }
    }
}

// ── Process configuration ───────────────────────────────────────────

/// Chat gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub instance: String,
    pub api_key: SecretString,
}

/// AI provider selection.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub backend: crate::llm::LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

/// Process configuration read from `DELIVERY_NOTIFY_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub gateway: GatewayConfig,
    /// `None` disables the automated responder entirely.
    pub assistant: Option<AssistantConfig>,
    pub order_source_url: Option<String>,
    pub order_source_token: Option<SecretString>,
    pub log_dir: Option<PathBuf>,
    pub survey_policy: SurveyPolicy,
}

impl AppConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str, hint: &str| {
            get(key).ok_or_else(|| ConfigError::MissingRequired {
                key: key.to_string(),
                hint: hint.to_string(),
            })
        };

        let db_path = get("DELIVERY_NOTIFY_DB_PATH")
            .unwrap_or_else(|| "./data/delivery-notify.db".to_string())
            .into();

        let http_port = match get("DELIVERY_NOTIFY_HTTP_PORT") {
            Some(raw) => parse_value("DELIVERY_NOTIFY_HTTP_PORT", &raw)?,
            None => 8080,
        };

        let gateway = GatewayConfig {
            base_url: require(
                "DELIVERY_NOTIFY_GATEWAY_URL",
                "Base URL of the WhatsApp gateway, e.g. https://gateway.example.com",
            )?
            .trim_end_matches('/')
            .to_string(),
            instance: require(
                "DELIVERY_NOTIFY_GATEWAY_INSTANCE",
                "Gateway instance name used in the send path",
            )?,
            api_key: SecretString::from(require(
                "DELIVERY_NOTIFY_GATEWAY_API_KEY",
                "API key sent in the gateway `apikey` header",
            )?),
        };

        let assistant = match get("DELIVERY_NOTIFY_LLM_API_KEY") {
            Some(api_key) => {
                let backend = match get("DELIVERY_NOTIFY_LLM_BACKEND") {
                    Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                        key: "DELIVERY_NOTIFY_LLM_BACKEND".into(),
                        message,
                    })?,
                    None => crate::llm::LlmBackend::Anthropic,
                };
                let model = get("DELIVERY_NOTIFY_LLM_MODEL")
                    .unwrap_or_else(|| backend.default_model().to_string());
                Some(AssistantConfig {
                    backend,
                    api_key: SecretString::from(api_key),
                    model,
                })
            }
            None => None,
        };

        let mut survey_policy = SurveyPolicy::default();
        if let Some(schedule) = get("DELIVERY_NOTIFY_SWEEP_SCHEDULE") {
            cron::Schedule::from_str(&schedule).map_err(|e| ConfigError::InvalidValue {
                key: "DELIVERY_NOTIFY_SWEEP_SCHEDULE".into(),
                message: e.to_string(),
            })?;
            survey_policy.sweep_schedule = schedule;
        }

        Ok(Self {
            db_path,
            http_port,
            gateway,
            assistant,
            order_source_url: get("DELIVERY_NOTIFY_ORDERS_URL"),
            order_source_token: get("DELIVERY_NOTIFY_ORDERS_TOKEN").map(SecretString::from),
            log_dir: get("DELIVERY_NOTIFY_LOG_DIR").map(PathBuf::from),
            survey_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::store::LibSqlBackend;

    async fn settings() -> Arc<RuntimeSettings> {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        RuntimeSettings::load(store).await.unwrap()
    }

    #[test]
    fn bounds_reject_min_above_max() {
        assert!(RateLimitBounds::new(10, 5).is_err());
        assert!(RateLimitBounds::new(5, 5).is_ok());
    }

    #[test]
    fn bounds_reject_ceiling() {
        assert!(RateLimitBounds::new(0, 301).is_err());
        assert!(RateLimitBounds::new(0, 300).is_ok());
    }

    #[test]
    fn from_rows_rejects_invalid_persisted_bounds() {
        let rows = vec![
            (KEY_MIN_SECONDS.to_string(), "40".to_string()),
            (KEY_MAX_SECONDS.to_string(), "20".to_string()),
        ];
        assert!(Settings::from_rows(&rows).is_err());
    }

    #[test]
    fn from_rows_rejects_garbage() {
        let rows = vec![(KEY_RESPONSE_DELAY.to_string(), "soon".to_string())];
        assert!(Settings::from_rows(&rows).is_err());
        let rows = vec![(KEY_RESPONSE_DELAY.to_string(), "31".to_string())];
        assert!(Settings::from_rows(&rows).is_err());
    }

    #[tokio::test]
    async fn set_min_above_max_rejected() {
        let settings = settings().await;
        assert!(settings.set_min_delay(16).await.is_err());
        // Unchanged on rejection
        assert_eq!(settings.rate_limits().await, RateLimitBounds::default());
        let bounds = settings.set_min_delay(15).await.unwrap();
        assert_eq!(bounds.min_seconds(), 15);
    }

    #[tokio::test]
    async fn set_max_below_min_rejected() {
        let settings = settings().await;
        assert!(settings.set_max_delay(4).await.is_err());
        assert!(settings.set_max_delay(301).await.is_err());
        assert_eq!(settings.set_max_delay(300).await.unwrap().max_seconds(), 300);
    }

    #[tokio::test]
    async fn updates_persist_across_reload() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let settings = RuntimeSettings::load(Arc::clone(&store)).await.unwrap();
        settings.set_rate_limits(2, 9).await.unwrap();
        settings
            .set_arbitration(ArbitrationSettings {
                globally_enabled: false,
                response_delay_seconds: 12,
            })
            .await
            .unwrap();

        let reloaded = RuntimeSettings::load(store).await.unwrap();
        assert_eq!(reloaded.rate_limits().await, RateLimitBounds::new(2, 9).unwrap());
        let arbitration = reloaded.arbitration().await;
        assert!(!arbitration.globally_enabled);
        assert_eq!(arbitration.response_delay_seconds, 12);
    }

    #[tokio::test]
    async fn response_delay_range_enforced() {
        let settings = settings().await;
        let bad = ArbitrationSettings {
            globally_enabled: true,
            response_delay_seconds: 0,
        };
        assert!(settings.set_arbitration(bad).await.is_err());
    }

    #[test]
    fn app_config_requires_gateway() {
        let env: HashMap<&str, &str> = HashMap::new();
        let err = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn app_config_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DELIVERY_NOTIFY_GATEWAY_URL", "https://gw.example.com/"),
            ("DELIVERY_NOTIFY_GATEWAY_INSTANCE", "deliveries"),
            ("DELIVERY_NOTIFY_GATEWAY_API_KEY", "secret"),
            ("DELIVERY_NOTIFY_HTTP_PORT", "9090"),
            ("DELIVERY_NOTIFY_LLM_API_KEY", "sk-test"),
            ("DELIVERY_NOTIFY_LLM_BACKEND", "openai"),
        ]);
        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.gateway.base_url, "https://gw.example.com");
        let assistant = config.assistant.unwrap();
        assert_eq!(assistant.backend, crate::llm::LlmBackend::OpenAi);
        assert_eq!(assistant.model, "gpt-4o-mini");
    }

    #[test]
    fn app_config_rejects_bad_cron() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DELIVERY_NOTIFY_GATEWAY_URL", "https://gw.example.com"),
            ("DELIVERY_NOTIFY_GATEWAY_INSTANCE", "deliveries"),
            ("DELIVERY_NOTIFY_GATEWAY_API_KEY", "secret"),
            ("DELIVERY_NOTIFY_SWEEP_SCHEDULE", "every now and then"),
        ]);
        assert!(AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).is_err());
    }
}
