use serde::Deserialize;

use realm_core::world::WorldSettings;

/// Top-level server configuration, loaded from `realm.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Map geometry JSON. Missing file falls back to the generated map.
    pub map_path: String,
    /// Directory holding `base.toml`, `shared.toml` and `presets/`.
    pub rules_dir: String,
    /// `"text"` or `"json"`.
    pub log_format: String,
    /// World RNG seed. Random when unset.
    pub seed: Option<u64>,
    pub ticks: TicksConfig,
    pub limits: LimitsConfig,
    pub authority: AuthorityConfig,
    pub admin: AdminConfig,
    pub round: RoundConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            map_path: "map.json".to_string(),
            rules_dir: "rules".to_string(),
            log_format: "text".to_string(),
            seed: None,
            ticks: TicksConfig::default(),
            limits: LimitsConfig::default(),
            authority: AuthorityConfig::default(),
            admin: AdminConfig::default(),
            round: RoundConfig::default(),
        }
    }
}

/// Timer periods in milliseconds. Each timer waits this long after its
/// previous run finished.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TicksConfig {
    pub fast_ms: u64,
    pub slow_ms: u64,
    pub update_ms: u64,
    pub reward_ms: u64,
    pub connection_ms: u64,
}

impl Default for TicksConfig {
    fn default() -> Self {
        Self {
            fast_ms: 50,
            slow_ms: 1_000,
            update_ms: 100,
            reward_ms: 10_000,
            connection_ms: 5_000,
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    /// Sustained inbound messages per second per connection.
    pub message_rate_per_sec: f64,
    /// Outbound frames buffered per connection before frames are dropped.
    pub outbound_buffer: usize,
    /// Commands buffered into the control loop.
    pub command_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 200,
            message_rate_per_sec: 30.0,
            outbound_buffer: 256,
            command_buffer: 4_096,
        }
    }
}

/// External authority service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Base URL. None runs with the built-in offline authority.
    pub url: Option<String>,
    pub deadline_ms: u64,
    /// Shared secret for the request signature header.
    pub secret: Option<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: None,
            deadline_ms: 3_000,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for the admin surface. None = admin routes disabled.
    pub bearer_token: Option<String>,
}

/// Host-level round handling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub reboot_after_rounds: Option<u32>,
    pub disconnect_grace_ms: u64,
    pub eliminated_disconnect_ms: u64,
    pub audit_sample_ms: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        let world = WorldSettings::default();
        Self {
            reboot_after_rounds: world.reboot_after_rounds,
            disconnect_grace_ms: world.disconnect_grace_ms,
            eliminated_disconnect_ms: world.eliminated_disconnect_ms,
            audit_sample_ms: world.audit_sample_ms,
        }
    }
}

impl ServerConfig {
    /// Check the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "listen_addr is not a valid socket address: {}",
                self.listen_addr
            ));
        }
        let periods = [
            ("ticks.fast_ms", self.ticks.fast_ms),
            ("ticks.slow_ms", self.ticks.slow_ms),
            ("ticks.update_ms", self.ticks.update_ms),
            ("ticks.reward_ms", self.ticks.reward_ms),
            ("ticks.connection_ms", self.ticks.connection_ms),
            ("authority.deadline_ms", self.authority.deadline_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(format!("{name} must be > 0"));
            }
        }
        if self.limits.max_connections == 0 {
            return Err("limits.max_connections must be > 0".to_string());
        }
        if self.limits.message_rate_per_sec <= 0.0 {
            return Err("limits.message_rate_per_sec must be > 0".to_string());
        }
        if self.limits.outbound_buffer == 0 || self.limits.command_buffer == 0 {
            return Err("limits buffers must be > 0".to_string());
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("unknown log_format: {}", self.log_format));
        }
        if self.round.reboot_after_rounds == Some(0) {
            return Err("round.reboot_after_rounds must be > 0".to_string());
        }

        if self.admin.bearer_token.is_some() {
            tracing::warn!(
                "admin.bearer_token is set in config file, use REALM_ADMIN_TOKEN in production"
            );
        }
        if self.authority.secret.is_some() {
            tracing::warn!(
                "authority.secret is set in config file, use REALM_AUTHORITY_SECRET in production"
            );
        }
        if self.authority.url.is_none() {
            tracing::warn!("No authority configured, running with the offline authority");
        }
        Ok(())
    }

    /// World settings derived from this config.
    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            fast_tick_ms: self.ticks.fast_ms,
            audit_sample_ms: self.round.audit_sample_ms,
            disconnect_grace_ms: self.round.disconnect_grace_ms,
            eliminated_disconnect_ms: self.round.eliminated_disconnect_ms,
            reboot_after_rounds: self.round.reboot_after_rounds,
            ..WorldSettings::default()
        }
    }

    /// Load config from `realm.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("realm.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from realm.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse realm.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No realm.toml found, using defaults");
                ServerConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `REALM_*` overrides. Empty values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| var(key).filter(|v| !v.is_empty());
        if let Some(addr) = var("REALM_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(token) = var("REALM_ADMIN_TOKEN") {
            self.admin.bearer_token = Some(token);
        }
        if let Some(url) = var("REALM_AUTHORITY_URL") {
            self.authority.url = Some(url);
        }
        if let Some(secret) = var("REALM_AUTHORITY_SECRET") {
            self.authority.secret = Some(secret);
        }
        if let Some(path) = var("REALM_MAP_PATH") {
            self.map_path = path;
        }
        if let Some(dir) = var("REALM_RULES_DIR") {
            self.rules_dir = dir;
        }
        if let Some(format) = var("REALM_LOG_FORMAT") {
            self.log_format = format;
        }
        if let Some(n) = var("REALM_MAX_CONNECTIONS").and_then(|v| v.parse::<usize>().ok()) {
            self.limits.max_connections = n;
        }
        if let Some(n) = var("REALM_REBOOT_AFTER_ROUNDS").and_then(|v| v.parse::<u32>().ok()) {
            self.round.reboot_after_rounds = Some(n);
        }
    }
}
