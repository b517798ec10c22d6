use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub(crate) const CONFIG_FILE_NAME: &str = "huddle_config.json";

const DEFAULT_TOKEN_ROLE: &str = "publisher";
const DEFAULT_RING_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DEBOUNCE_MS: u64 = 100;
const DEFAULT_DURATION_TICK_MS: u64 = 1_000;
const DEFAULT_LEAVE_SETTLE_MS: u64 = 300;
const DEFAULT_RELEASE_GRACE_MS: u64 = 1_500;
const DEFAULT_AUDIO_UNMUTE_DELAY_MS: u64 = 500;
const DEFAULT_TOKEN_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub app_id: Option<String>,
    pub token_endpoint_url: Option<String>,
    pub token_role: Option<String>,
    // Used instead of the endpoint when set, or when the network is disabled.
    pub static_token: Option<String>,
    pub disable_network: Option<bool>,
    // "platform" (default when a native engine is registered) or "loopback".
    pub call_audio_backend: Option<String>,
    pub ring_timeout_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub duration_tick_ms: Option<u64>,
    pub leave_settle_ms: Option<u64>,
    pub release_grace_ms: Option<u64>,
    pub audio_unmute_delay_ms: Option<u64>,
    pub token_timeout_ms: Option<u64>,
    pub default_speakerphone: Option<bool>,
}

pub(crate) fn load_call_config(data_dir: &str) -> CallConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return CallConfig::default();
    };
    match serde_json::from_slice::<CallConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "config: unreadable, using defaults");
            CallConfig::default()
        }
    }
}

fn millis(v: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(v.unwrap_or(default))
}

impl CallConfig {
    pub fn app_id(&self) -> String {
        self.app_id
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }

    pub fn network_enabled(&self) -> bool {
        // Used to keep Rust tests deterministic and offline.
        if let Some(disable) = self.disable_network {
            return !disable;
        }
        std::env::var("HUDDLE_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }

    pub fn token_endpoint(&self) -> Option<String> {
        self.token_endpoint_url
            .clone()
            .or_else(|| std::env::var("HUDDLE_TOKEN_ENDPOINT").ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn token_role(&self) -> String {
        self.token_role
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TOKEN_ROLE)
            .to_string()
    }

    pub fn prefers_loopback_engine(&self) -> bool {
        self.call_audio_backend
            .as_deref()
            .map(|s| s.trim().eq_ignore_ascii_case("loopback"))
            .unwrap_or(false)
    }

    pub fn ring_timeout(&self) -> Duration {
        millis(self.ring_timeout_ms, DEFAULT_RING_TIMEOUT_MS)
    }

    pub fn debounce(&self) -> Duration {
        millis(self.debounce_ms, DEFAULT_DEBOUNCE_MS)
    }

    pub fn duration_tick(&self) -> Duration {
        // A zero period would spin the ticker.
        millis(self.duration_tick_ms, DEFAULT_DURATION_TICK_MS).max(Duration::from_millis(10))
    }

    pub fn leave_settle(&self) -> Duration {
        millis(self.leave_settle_ms, DEFAULT_LEAVE_SETTLE_MS)
    }

    /// Clamped to at least 1.5s.
    pub fn release_grace(&self) -> Duration {
        millis(self.release_grace_ms, DEFAULT_RELEASE_GRACE_MS)
            .max(Duration::from_millis(DEFAULT_RELEASE_GRACE_MS))
    }

    pub fn audio_unmute_delay(&self) -> Duration {
        millis(self.audio_unmute_delay_ms, DEFAULT_AUDIO_UNMUTE_DELAY_MS)
    }

    pub fn token_timeout(&self) -> Duration {
        millis(self.token_timeout_ms, DEFAULT_TOKEN_TIMEOUT_MS)
    }

    pub fn default_speakerphone(&self) -> bool {
        self.default_speakerphone.unwrap_or(false)
    }
}
