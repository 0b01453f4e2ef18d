//! Server Configuration
//!
//! Everything is read from the environment (after `.env` is loaded). Unset
//! variables fall back to defaults; malformed ones are startup errors.

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    pool::PoolConfig,
    provider::GenerationOptions,
    ratelimit::RateLimit,
    reasoning::AgentConfig,
    registry::BackendConfig,
    session::SessionConfig,
    tool::is_valid_backend_id,
};
use agent_runtime::OpenAiConfig;
use url::Url;

/// Placeholder replaced by the identity in dedicated backend endpoints
pub const IDENTITY_PLACEHOLDER: &str = "{identity}";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub backends: Vec<BackendConfig>,
    /// Per-identity registries through the identity pool
    pub dedicated_backends: bool,
    pub backend_timeout: Duration,
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub agent: AgentConfig,
    pub provider: OpenAiConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backends = match get("TOOL_BACKENDS") {
            Some(spec) => parse_backends(&spec, |id| get(&token_var(id)))?,
            None => Vec::new(),
        };

        let mut session = SessionConfig {
            session_timeout: secs(&get, "SESSION_TIMEOUT_SECS", 1800)?,
            max_sessions: number(&get, "MAX_SESSIONS", 100)?,
            sweep_interval: secs(&get, "SESSION_SWEEP_SECS", 300)?,
            rate_limit: RateLimit {
                max_requests: number(&get, "RATE_LIMIT_REQUESTS", 5)?,
                window_secs: number(&get, "RATE_LIMIT_WINDOW_SECS", 60)?,
            },
            ..Default::default()
        };
        session.flow.enabled = flag(&get, "FLOW_ENABLED", true)?;
        session.flow.flow_timeout = secs(&get, "FLOW_TIMEOUT_SECS", 90)?;
        if let Some(commands) = get("FLOW_END_COMMANDS") {
            session.flow.end_commands = commands
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
        }

        let provider = OpenAiConfig::from_env_with(&get);

        let mut agent = AgentConfig {
            max_iterations: number(&get, "MAX_ITERATIONS", 10)?,
            history_window: number(&get, "HISTORY_WINDOW", 10)?,
            generation: GenerationOptions {
                model: provider.model.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Some(prompt) = get("SYSTEM_PROMPT") {
            agent.system_prompt = prompt;
        }
        if agent.max_iterations == 0 {
            return Err(AgentError::Config("MAX_ITERATIONS must be at least 1".into()));
        }

        let pool = PoolConfig {
            max_identities: number(&get, "MAX_IDENTITIES", 100)?,
            idle_timeout: secs(&get, "IDENTITY_IDLE_SECS", 1800)?,
            sweep_interval: secs(&get, "IDENTITY_SWEEP_SECS", 300)?,
        };

        session.validate()?;
        pool.validate()?;

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            backends,
            dedicated_backends: flag(&get, "DEDICATED_BACKENDS", false)?,
            backend_timeout: secs(&get, "TOOL_BACKEND_TIMEOUT_SECS", 30)?,
            session,
            pool,
            agent,
            provider,
        })
    }
}

/// Parse `id=url,id=url`; `token` supplies an optional bearer per id
pub fn parse_backends(spec: &str, token: impl Fn(&str) -> Option<String>) -> Result<Vec<BackendConfig>> {
    let mut backends: Vec<BackendConfig> = Vec::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, url) = entry
            .split_once('=')
            .map(|(id, url)| (id.trim(), url.trim()))
            .filter(|(id, url)| !id.is_empty() && !url.is_empty())
            .ok_or_else(|| AgentError::Config(format!("TOOL_BACKENDS: expected 'id=url', got '{entry}'")))?;

        if !is_valid_backend_id(id) {
            return Err(AgentError::Config(format!(
                "TOOL_BACKENDS: backend id '{id}' must not contain '__' or end with '_'"
            )));
        }
        if backends.iter().any(|b| b.id == id) {
            return Err(AgentError::Config(format!("TOOL_BACKENDS: duplicate backend '{id}'")));
        }

        let config = BackendConfig::new(id, url);
        backends.push(match token(id) {
            Some(token) => config.with_bearer(token),
            None => config,
        });
    }

    Ok(backends)
}

/// `TOOL_BACKEND_<ID>_TOKEN`, with the id upper-cased and `-` mapped to `_`
pub fn token_var(id: &str) -> String {
    format!("TOOL_BACKEND_{}_TOKEN", id.to_uppercase().replace('-', "_"))
}

/// Backend list for one identity. The identity fills `{identity}` as a
/// single percent-encoded path segment.
pub fn backends_for_identity(backends: &[BackendConfig], identity: &str) -> Result<Vec<BackendConfig>> {
    let segment = identity_segment(identity)?;
    Ok(backends
        .iter()
        .map(|b| BackendConfig {
            endpoint: b.endpoint.replace(IDENTITY_PLACEHOLDER, &segment),
            ..b.clone()
        })
        .collect())
}

fn identity_segment(identity: &str) -> Result<String> {
    if matches!(identity, "" | "." | "..") {
        return Err(AgentError::Config(format!(
            "identity '{identity}' cannot be used in a backend endpoint"
        )));
    }
    let mut scratch = Url::parse("http://identity.invalid/")
        .map_err(|e| AgentError::Config(e.to_string()))?;
    scratch
        .path_segments_mut()
        .map_err(|()| AgentError::Config("identity URL cannot hold path segments".into()))?
        .push(identity);
    Ok(scratch.path().trim_start_matches('/').to_string())
}

fn number<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    get(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|_| AgentError::Config(format!("{key}: '{raw}' is not a valid number")))
    })
}

fn secs(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    number(get, key, default).map(Duration::from_secs)
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    get(key).map_or(Ok(default), |raw| match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::Config(format!("{key}: '{raw}' is not a boolean"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::registry::AuthMode;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.backends.is_empty());
        assert!(!config.dedicated_backends);
        assert_eq!(config.session.max_sessions, 100);
        assert_eq!(config.session.flow.flow_timeout, Duration::from_secs(90));
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.agent.generation.model, "gpt-4o");
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_backends_with_tokens() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TOOL_BACKENDS", "calendar=http://localhost:3000/mcp, google-mail=http://localhost:3001/mcp"),
            ("TOOL_BACKEND_GOOGLE_MAIL_TOKEN", "secret"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].id, "calendar");
        assert_eq!(config.backends[0].auth, AuthMode::None);
        assert_eq!(config.backends[1].endpoint, "http://localhost:3001/mcp");
        assert_eq!(
            config.backends[1].auth,
            AuthMode::Bearer {
                token: "secret".into()
            }
        );
        assert_eq!(config.agent.generation.model, "gpt-4o-mini");
    }

    #[test]
    fn test_malformed_backends_are_rejected() {
        assert!(parse_backends("calendar", |_| None).is_err());
        assert!(parse_backends("=http://x", |_| None).is_err());
        assert!(parse_backends("a=http://x,a=http://y", |_| None).is_err());
        assert!(parse_backends(" , ", |_| None).unwrap().is_empty());
        assert!(parse_backends("math_=http://x", |_| None).is_err());
        assert!(parse_backends("ma__th=http://x", |_| None).is_err());
    }

    #[test]
    fn test_malformed_numbers_are_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("MAX_SESSIONS", "many")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("DEDICATED_BACKENDS", "maybe")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("MAX_ITERATIONS", "0")])).is_err());
    }

    #[test]
    fn test_zero_capacities_and_intervals_are_rejected() {
        for key in ["MAX_SESSIONS", "SESSION_SWEEP_SECS", "MAX_IDENTITIES", "IDENTITY_SWEEP_SECS"] {
            let err = ServerConfig::from_lookup(lookup(&[(key, "0")])).err();
            assert!(matches!(err, Some(AgentError::Config(_))), "{key}");
        }
    }

    #[test]
    fn test_identity_placeholder() {
        let backends = parse_backends("mail=http://mail/{identity}/mcp", |_| None).unwrap();
        let resolved = backends_for_identity(&backends, "alice").unwrap();
        assert_eq!(resolved[0].endpoint, "http://mail/alice/mcp");
        assert_eq!(resolved[0].id, "mail");
    }

    #[test]
    fn test_identity_stays_one_path_segment() {
        let backends = parse_backends("mail=http://mail/{identity}/mcp", |_| None).unwrap();

        let resolved = backends_for_identity(&backends, "../admin").unwrap();
        let url = Url::parse(&resolved[0].endpoint).unwrap();
        assert_eq!(url.path(), "/..%2Fadmin/mcp");
        assert_eq!(url.path_segments().unwrap().count(), 2);

        let resolved = backends_for_identity(&backends, "a b?c#d").unwrap();
        let url = Url::parse(&resolved[0].endpoint).unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(url.path_segments().unwrap().count(), 2);

        for identity in ["", ".", ".."] {
            assert!(backends_for_identity(&backends, identity).is_err(), "{identity:?}");
        }
    }

    #[test]
    fn test_end_commands_override() {
        let config = ServerConfig::from_lookup(lookup(&[("FLOW_END_COMMANDS", "Bye, quit")])).unwrap();
        assert_eq!(config.session.flow.end_commands, vec!["bye".to_string(), "quit".to_string()]);
    }
}
