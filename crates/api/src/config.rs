//! Server configuration loaded from the environment

use std::collections::HashSet;

/// Default listen address
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Decides whether an account is shown the subscription prompt.
///
/// Accounts whose email, or email domain, is on an exempt list never need a
/// subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPolicy {
    exempt_emails: HashSet<String>,
    exempt_domains: HashSet<String>,
}

impl SubscriptionPolicy {
    pub fn new<E, D>(exempt_emails: E, exempt_domains: D) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let normalize = |s: &str| s.trim().to_ascii_lowercase();
        Self {
            exempt_emails: exempt_emails
                .into_iter()
                .map(|e| normalize(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
            exempt_domains: exempt_domains
                .into_iter()
                .map(|d| normalize(d.as_ref().trim_start_matches('@')))
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    fn from_env() -> Self {
        let list = |name: &str| {
            std::env::var(name)
                .unwrap_or_default()
                .split(',')
                .map(str::to_owned)
                .collect::<Vec<_>>()
        };
        Self::new(
            list("SUBSCRIPTION_EXEMPT_EMAILS"),
            list("SUBSCRIPTION_EXEMPT_DOMAINS"),
        )
    }

    pub fn requires_subscription(&self, email: &str) -> bool {
        let email = email.trim().to_ascii_lowercase();
        if self.exempt_emails.contains(&email) {
            return false;
        }
        match email.rsplit_once('@') {
            Some((_, domain)) => !self.exempt_domains.contains(domain),
            None => true,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Postgres URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub analytics_endpoint: Option<String>,
    pub analytics_token: Option<String>,
    pub subscription_policy: SubscriptionPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let jwt_secret = non_empty("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let bind_address =
            non_empty("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        if bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                name: "BIND_ADDRESS",
                value: bind_address,
            });
        }

        let allowed_origins = non_empty("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_address,
            database_url: non_empty("DATABASE_URL"),
            jwt_secret,
            allowed_origins,
            analytics_endpoint: non_empty("ANALYTICS_ENDPOINT"),
            analytics_token: non_empty("ANALYTICS_TOKEN"),
            subscription_policy: SubscriptionPolicy::from_env(),
        })
    }

    /// Configuration for tests and embedding
    pub fn for_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            database_url: None,
            jwt_secret: jwt_secret.into(),
            allowed_origins: Vec::new(),
            analytics_endpoint: None,
            analytics_token: None,
            subscription_policy: SubscriptionPolicy::default(),
        }
    }
}
