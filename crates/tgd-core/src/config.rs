use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::{domain::UpdateKind, errors::Error, queue::QueueFullPolicy, Result};

/// How updates reach the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Polling,
    Webhook,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "polling" | "poll" => Ok(Mode::Polling),
            "webhook" => Ok(Mode::Webhook),
            other => Err(Error::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// Typed configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Bot API
    pub bot_token: String,
    pub api_url: String,
    pub mode: Mode,
    pub allowed_updates: Vec<UpdateKind>,
    pub drop_pending_updates: bool,

    // Acquisition
    pub poll_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub offset_file: PathBuf,

    // Dispatch
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub handler_timeout: Option<Duration>,
    pub shutdown_grace: Duration,

    // Webhook
    pub webhook_listen: SocketAddr,
    pub webhook_url: Option<String>,
    pub webhook_path: String,
    pub webhook_secret: Option<String>,
}

impl Config {
    /// Defaults for everything but the token. Does not read the environment.
    pub fn default_with_token(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_url: "https://api.telegram.org".to_string(),
            mode: Mode::Polling,
            allowed_updates: Vec::new(),
            drop_pending_updates: false,
            poll_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            offset_file: PathBuf::from("/tmp/tgd-offset"),
            worker_count: 4,
            queue_capacity: 256,
            queue_full_policy: QueueFullPolicy::Block,
            handler_timeout: None,
            shutdown_grace: Duration::from_secs(10),
            webhook_listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
            webhook_url: None,
            webhook_path: "/telegram".to_string(),
            webhook_secret: None,
        }
    }

    pub fn load() -> Result<Self> {
        // A missing .env is fine; existing variables win over the file.
        let _ = dotenvy::dotenv();

        let bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let mut cfg = Self::default_with_token(bot_token);

        if let Some(url) = env_str("TGD_API_URL").and_then(non_empty) {
            cfg.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(mode) = env_str("TGD_MODE").and_then(non_empty) {
            cfg.mode = mode.parse()?;
        }
        if let Some(raw) = env_str("TGD_ALLOWED_UPDATES") {
            cfg.allowed_updates = parse_allowed_updates(&raw)?;
        }
        if let Some(v) = env_bool("TGD_DROP_PENDING_UPDATES")? {
            cfg.drop_pending_updates = v;
        }

        if let Some(secs) = env_parse::<u64>("TGD_POLL_TIMEOUT_SECS")? {
            cfg.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("TGD_BACKOFF_INITIAL_MS")? {
            cfg.backoff_initial = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_parse::<u64>("TGD_BACKOFF_MAX_MS")? {
            cfg.backoff_max = Duration::from_millis(ms);
        }
        if cfg.backoff_max < cfg.backoff_initial {
            cfg.backoff_max = cfg.backoff_initial;
        }
        if let Some(path) = env::var_os("TGD_OFFSET_FILE") {
            cfg.offset_file = PathBuf::from(path);
        }

        if let Some(n) = env_parse::<usize>("TGD_WORKER_COUNT")? {
            cfg.worker_count = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("TGD_QUEUE_CAPACITY")? {
            cfg.queue_capacity = n.max(1);
        }
        if let Some(policy) = env_str("TGD_QUEUE_FULL_POLICY").and_then(non_empty) {
            cfg.queue_full_policy = policy.parse()?;
        }
        if let Some(secs) = env_parse::<f64>("TGD_HANDLER_TIMEOUT_SECS")? {
            cfg.handler_timeout = secs_to_duration("TGD_HANDLER_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = env_parse::<u64>("TGD_SHUTDOWN_GRACE_SECS")? {
            cfg.shutdown_grace = Duration::from_secs(secs);
        }

        if let Some(addr) = env_parse::<SocketAddr>("TGD_WEBHOOK_LISTEN")? {
            cfg.webhook_listen = addr;
        }
        cfg.webhook_url = env_str("TGD_WEBHOOK_URL").and_then(non_empty);
        if let Some(path) = env_str("TGD_WEBHOOK_PATH").and_then(non_empty) {
            cfg.webhook_path = normalize_path(&path);
        }
        cfg.webhook_secret = env_str("TGD_WEBHOOK_SECRET").and_then(non_empty);

        if cfg.mode == Mode::Webhook && cfg.webhook_url.is_none() {
            return Err(Error::Config(
                "TGD_WEBHOOK_URL is required in webhook mode".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Names of the allowed update kinds, as the Bot API expects them.
    pub fn allowed_update_names(&self) -> Vec<String> {
        self.allowed_updates
            .iter()
            .map(|k| k.as_str().to_string())
            .collect()
    }
}

fn parse_allowed_updates(raw: &str) -> Result<Vec<UpdateKind>> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .map(|s| {
            UpdateKind::from_field(&s)
                .ok_or_else(|| Error::Config(format!("unknown update kind: {s}")))
        })
        .collect()
}

fn secs_to_duration(key: &str, secs: f64) -> Result<Option<Duration>> {
    if secs == 0.0 {
        return Ok(None);
    }
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::Config(format!("{key} must be a positive number")));
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

fn normalize_path(p: &str) -> String {
    let p = p.trim();
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    let Some(raw) = env_str(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    let Some(raw) = env_str(key).and_then(non_empty) else {
        return Ok(None);
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!("invalid value for {key}: {raw}"))),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_updates_parse_known_kinds() {
        let kinds = parse_allowed_updates("message, callback_query,,").unwrap();
        assert_eq!(kinds, vec![UpdateKind::Message, UpdateKind::CallbackQuery]);
        assert!(parse_allowed_updates("message,bogus").is_err());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Webhook".parse::<Mode>().unwrap(), Mode::Webhook);
        assert_eq!("poll".parse::<Mode>().unwrap(), Mode::Polling);
        assert!("push".parse::<Mode>().is_err());
    }

    #[test]
    fn zero_handler_timeout_disables_it() {
        assert_eq!(secs_to_duration("k", 0.0).unwrap(), None);
        assert_eq!(
            secs_to_duration("k", 1.5).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert!(secs_to_duration("k", -1.0).is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default_with_token("t");
        assert_eq!(cfg.mode, Mode::Polling);
        assert_eq!(cfg.queue_full_policy, QueueFullPolicy::Block);
        assert!(cfg.worker_count >= 1);
        assert!(cfg.backoff_max >= cfg.backoff_initial);
        assert_eq!(normalize_path("hook"), "/hook");
    }
}
