use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PROVIDER: &str = "http://127.0.0.1:8080";
const DEFAULT_APPLICATION: &str = "localhost";

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay provider base URL
    pub provider: Url,
    /// Application name we join the relay as
    pub application: String,
    /// Delay before resending a backlogged signal
    pub retry_delay: Duration,
    /// Deadline for an offer/answer exchange to reach a connected channel (`None` disables)
    pub negotiation_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn new(provider: &str, application: impl Into<String>) -> RelayResult<Self> {
        let provider = Url::parse(provider)
            .map_err(|err| RelayError::Config(format!("invalid provider url {provider}: {err}")))?;
        if provider.host_str().is_none() {
            return Err(RelayError::Config(format!(
                "provider url {provider} has no host"
            )));
        }
        let application = application.into();
        if application.is_empty() {
            return Err(RelayError::Config("application must not be empty".into()));
        }
        Ok(Self {
            provider,
            application,
            retry_delay: DEFAULT_RETRY_DELAY,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
        })
    }

    /// Load configuration from `PEER_RELAY_*` environment variables.
    pub fn from_env() -> RelayResult<Self> {
        let provider = env_string("PEER_RELAY_PROVIDER").unwrap_or_else(|| DEFAULT_PROVIDER.into());
        let application =
            env_string("PEER_RELAY_APP").unwrap_or_else(|| DEFAULT_APPLICATION.into());
        let mut config = Self::new(&provider, application)?;
        if let Some(ms) = env_millis("PEER_RELAY_RETRY_MS")? {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_millis("PEER_RELAY_NEGOTIATION_TIMEOUT_MS")? {
            config.negotiation_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(config)
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Provider authority with `:` flattened to `.`, e.g. `relay.example.com.8443`.
    pub fn provider_domain(&self) -> String {
        let host = self.provider.host_str().unwrap_or_default();
        let authority = match self.provider.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        authority.replace(':', ".")
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn env_millis(var: &str) -> RelayResult<Option<u64>> {
    env_string(var)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|err| RelayError::Config(format!("{var}={raw}: {err}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 4] = [
        "PEER_RELAY_PROVIDER",
        "PEER_RELAY_APP",
        "PEER_RELAY_RETRY_MS",
        "PEER_RELAY_NEGOTIATION_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn provider_domain_flattens_port() {
        let config = RelayConfig::new("https://relay.example.com:8443/base", "chat").unwrap();
        assert_eq!(config.provider_domain(), "relay.example.com.8443");

        let config = RelayConfig::new("https://relay.example.com", "chat").unwrap();
        assert_eq!(config.provider_domain(), "relay.example.com");
    }

    #[test]
    fn rejects_bad_provider() {
        assert!(matches!(
            RelayConfig::new("not a url", "chat"),
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            RelayConfig::new("https://relay.example.com", ""),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = RelayConfig::from_env().unwrap();
        assert_eq!(config.provider_domain(), "127.0.0.1.8080");
        assert_eq!(config.application, "localhost");
        assert_eq!(config.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.negotiation_timeout, Some(DEFAULT_NEGOTIATION_TIMEOUT));
    }

    #[test]
    fn from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PEER_RELAY_PROVIDER", "https://grimwire.example:9000");
            env::set_var("PEER_RELAY_APP", "notes.example");
            env::set_var("PEER_RELAY_RETRY_MS", "250");
            env::set_var("PEER_RELAY_NEGOTIATION_TIMEOUT_MS", "0");
        }
        let config = RelayConfig::from_env().unwrap();
        clear_env();
        assert_eq!(config.provider_domain(), "grimwire.example.9000");
        assert_eq!(config.application, "notes.example");
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.negotiation_timeout, None);
    }

    #[test]
    fn from_env_rejects_garbage_millis() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("PEER_RELAY_RETRY_MS", "soon") };
        let result = RelayConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
