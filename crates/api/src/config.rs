//! Application configuration
//!
//! Read once from the process environment at startup; everything downstream
//! receives explicit config structs.

use std::collections::HashMap;
use std::time::Duration;

use leadgen_billing::{
    ActivationConfig, BillingConfig, EmailConfig, IntentConfig, InvitationConfig, LedgerConfig,
    ReplacementPolicy, StripeConfig,
};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_INVITATION_API_URL: &str = "https://api.clerk.com";
const DEFAULT_PORTAL_URL: &str = "http://localhost:3000";
const DEFAULT_DEDUP_TTL_SECONDS: u64 = 300;
const DEFAULT_TOKEN_TTL_DAYS: i64 = 14;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Bearer credentials for each inbound surface
#[derive(Clone)]
pub struct ApiTokens {
    pub lead_webhook: String,
    pub replacement: String,
    pub admin: String,
}

impl std::fmt::Debug for ApiTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiTokens")
            .field("lead_webhook", &"[REDACTED]")
            .field("replacement", &"[REDACTED]")
            .field("admin", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Dedup cache falls back to in-process memory without Redis
    pub redis_url: Option<String>,
    pub bind_address: String,
    pub tokens: ApiTokens,
    pub dedup_ttl: Duration,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let email_defaults = EmailConfig::default();
        let portal_url = get("PORTAL_URL").unwrap_or_else(|| DEFAULT_PORTAL_URL.to_string());
        let onboarding_base_url = get("ONBOARDING_BASE_URL")
            .unwrap_or_else(|| format!("{}/onboarding", portal_url.trim_end_matches('/')));

        let billing = BillingConfig {
            stripe: StripeConfig {
                secret_key: required("STRIPE_SECRET_KEY")?,
                webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            },
            invitation: InvitationConfig {
                api_url: get("INVITATION_API_URL")
                    .unwrap_or_else(|| DEFAULT_INVITATION_API_URL.to_string()),
                api_key: required("INVITATION_API_KEY")?,
            },
            email: EmailConfig {
                api_key: get("RESEND_API_KEY"),
                from: get("EMAIL_FROM").unwrap_or(email_defaults.from),
                ops_email: get("OPS_EMAIL"),
                api_url: email_defaults.api_url,
            },
            activation: ActivationConfig {
                portal_url,
                onboarding_base_url,
            },
            ledger: LedgerConfig {
                lead_unit_price_cents: parse_or("LEAD_UNIT_PRICE_CENTS", get("LEAD_UNIT_PRICE_CENTS"), 0)?,
                ..LedgerConfig::default()
            },
            intents: IntentConfig {
                token_ttl: time::Duration::days(parse_or(
                    "INTENT_TOKEN_TTL_DAYS",
                    get("INTENT_TOKEN_TTL_DAYS"),
                    DEFAULT_TOKEN_TTL_DAYS,
                )?),
            },
            replacement_policy: match get("REPLACEMENT_POLICY") {
                Some(raw) => parse_json::<ReplacementPolicy>("REPLACEMENT_POLICY", &raw)?,
                None => ReplacementPolicy::default(),
            },
            business_portal_map: match get("BUSINESS_PORTAL_MAP") {
                Some(raw) => parse_json::<HashMap<String, String>>("BUSINESS_PORTAL_MAP", &raw)?,
                None => HashMap::new(),
            },
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: get("REDIS_URL"),
            bind_address: get("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            tokens: ApiTokens {
                lead_webhook: required("LEAD_WEBHOOK_TOKEN")?,
                replacement: required("REPLACEMENT_API_TOKEN")?,
                admin: required("ADMIN_API_TOKEN")?,
            },
            dedup_ttl: Duration::from_secs(parse_or(
                "DEDUP_TTL_SECONDS",
                get("DEDUP_TTL_SECONDS"),
                DEFAULT_DEDUP_TTL_SECONDS,
            )?),
            billing,
        })
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/leadgen"),
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_abc"),
            ("INVITATION_API_KEY", "inv_key"),
            ("LEAD_WEBHOOK_TOKEN", "lead-token"),
            ("REPLACEMENT_API_TOKEN", "replacement-token"),
            ("ADMIN_API_TOKEN", "admin-token"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| env.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.dedup_ttl, Duration::from_secs(300));
        assert!(config.redis_url.is_none());
        assert_eq!(
            config.billing.activation.onboarding_base_url,
            "http://localhost:3000/onboarding"
        );
        assert_eq!(config.billing.replacement_policy, ReplacementPolicy::default());
        assert_eq!(config.billing.intents.token_ttl, time::Duration::days(14));
    }

    #[test]
    fn test_missing_token_is_reported_by_name() {
        let mut env = base_env();
        env.remove("ADMIN_API_TOKEN");
        assert!(matches!(load(&env), Err(ConfigError::Missing("ADMIN_API_TOKEN"))));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut env = base_env();
        env.insert("LEAD_WEBHOOK_TOKEN", "   ");
        assert!(matches!(load(&env), Err(ConfigError::Missing("LEAD_WEBHOOK_TOKEN"))));
    }

    #[test]
    fn test_business_portal_map_parsed() {
        let mut env = base_env();
        env.insert("BUSINESS_PORTAL_MAP", r#"{"Acme Roofing LLC":"acme-roofing"}"#);
        let config = load(&env).unwrap();
        assert_eq!(
            config.billing.business_portal_map.get("Acme Roofing LLC").map(String::as_str),
            Some("acme-roofing")
        );
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut env = base_env();
        env.insert("LEAD_UNIT_PRICE_CENTS", "forty");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid { var: "LEAD_UNIT_PRICE_CENTS", .. })
        ));
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let config = load(&base_env()).unwrap();
        let rendered = format!("{:?}", config);
        for secret in ["sk_test_123", "whsec_abc", "inv_key", "lead-token", "admin-token"] {
            assert!(!rendered.contains(secret), "{} leaked", secret);
        }
    }
}
