use std::time::Duration;

use crate::portal::{PortalError, PortalResult};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP client knobs shared by the login browser and the invoice request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientSettings {
    /// Reads `EFATURA_CONNECT_TIMEOUT_SECS`, `EFATURA_TIMEOUT_SECS` and
    /// `EFATURA_USER_AGENT`, keeping defaults for anything unset.
    pub fn from_env() -> PortalResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> PortalResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(secs) = read_secs(&lookup, "EFATURA_CONNECT_TIMEOUT_SECS")? {
            settings.connect_timeout = secs;
        }
        if let Some(secs) = read_secs(&lookup, "EFATURA_TIMEOUT_SECS")? {
            settings.timeout = secs;
        }
        if let Some(agent) = lookup("EFATURA_USER_AGENT").filter(|v| !v.trim().is_empty()) {
            settings.user_agent = agent.trim().to_string();
        }

        Ok(settings)
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.timeout = timeout;
        self
    }

    pub(crate) fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .use_rustls_tls()
    }
}

fn read_secs<F>(lookup: &F, key: &str) -> PortalResult<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .map_err(|_| {
            PortalError::Config(format!("{key} must be a whole number of seconds, got {raw:?}"))
        })?;
    if secs == 0 {
        return Err(PortalError::Config(format!("{key} must be greater than zero")));
    }
    Ok(Some(Duration::from_secs(secs)))
}
