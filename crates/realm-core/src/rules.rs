//! Rule configuration and preset layering.
//!
//! The rules in force during a round are a single [`RuleConfig`] value built
//! once from `defaults ⊕ base ⊕ shared ⊕ preset ⊕ admin overrides`. Gameplay
//! code only ever reads that snapshot; editing a layer afterwards has no effect
//! until a new snapshot is derived.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::PickupKind;
use crate::error::RulesError;
use crate::geometry::{Rect, Vec2};

/// A partial rule layer: any subset of [`RuleConfig`] keys, nested tables allowed.
pub type Layer = Map<String, Value>;

/// Effect of collecting one pickup of a given kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickupEffect {
    pub energy: f32,
    pub score: u64,
    /// Temporary invincibility granted on collection (0 = none).
    pub invincible_ms: u64,
    /// Speed multiplier applied for `speed_ms` (1.0 = unchanged).
    pub speed_factor: f32,
    pub speed_ms: u64,
    /// Camera zoom sent to the collector, if this kind changes it.
    pub zoom: Option<f32>,
}

impl Default for PickupEffect {
    fn default() -> Self {
        Self {
            energy: 0.0,
            score: 0,
            invincible_ms: 0,
            speed_factor: 1.0,
            speed_ms: 0,
            zoom: None,
        }
    }
}

/// Effect table, one entry per pickup kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickupEffects {
    pub spark: PickupEffect,
    pub gem: PickupEffect,
    pub ward: PickupEffect,
    pub comet: PickupEffect,
}

impl Default for PickupEffects {
    fn default() -> Self {
        Self {
            spark: PickupEffect {
                energy: 8.0,
                score: 1,
                ..PickupEffect::default()
            },
            gem: PickupEffect {
                energy: 4.0,
                score: 10,
                ..PickupEffect::default()
            },
            ward: PickupEffect {
                energy: 2.0,
                score: 2,
                invincible_ms: 3_000,
                ..PickupEffect::default()
            },
            comet: PickupEffect {
                energy: 2.0,
                score: 2,
                speed_factor: 1.5,
                speed_ms: 4_000,
                ..PickupEffect::default()
            },
        }
    }
}

impl PickupEffects {
    pub fn get(&self, kind: PickupKind) -> &PickupEffect {
        match kind {
            PickupKind::Spark => &self.spark,
            PickupKind::Gem => &self.gem,
            PickupKind::Ward => &self.ward,
            PickupKind::Comet => &self.comet,
        }
    }
}

/// Flat set of tunables for one round. Times are milliseconds, distances are
/// world units, speeds are units per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Mode label; two consecutive rounds never share one.
    pub mode: String,
    /// Rule guide text sent to joining participants.
    pub guide: String,
    pub round_length_ms: u64,
    pub world_bounds: Rect,
    pub spawn_area: Rect,

    pub max_level: u32,
    pub start_level: u32,
    pub energy_cap: f32,
    pub start_energy: f32,
    pub level_decay_power: f32,
    pub global_decay_power: f32,
    /// Scale decay by each participant's `decay_modifier` percentage.
    pub decay_modifier_enabled: bool,
    pub evolve_points: u64,
    pub evolve_burst_enabled: bool,
    pub burst_speed: f32,
    pub burst_ms: u64,

    pub base_speed: f32,
    /// Speed lost per level, as a fraction of base speed.
    pub level_speed_step: f32,
    pub avatar_half_size: f32,
    pub sticky_islands: bool,
    pub collision_speed_factor: f32,
    pub collision_debuff_ms: u64,
    pub stuck_invulnerable_ms: u64,
    pub desync_threshold: f32,
    pub max_jump_distance: f32,
    /// A reported jump this many times `max_jump_distance` disconnects.
    pub jump_kick_factor: f32,

    pub kills_enabled: bool,
    pub touch_radius_base: f32,
    pub touch_radius_step: f32,
    pub touch_damage: f32,
    pub touch_debuff_ms: u64,
    /// How long a touch lets the toucher claim a decay elimination.
    pub touch_claim_ms: u64,
    pub kill_points: u64,
    pub orb_percent: u32,
    pub orb_delay_ms: u64,
    /// No orb is dropped when the round ends within this window.
    pub orb_cutoff_ms: u64,
    pub avoid_penalty_chance: f64,
    pub kill_energy_refund: f32,
    pub post_kill_buff_enabled: bool,
    pub post_kill_buff_ms: u64,
    pub farm_kill_threshold: u32,
    pub farm_low_stat_threshold: u32,
    pub farm_void: bool,
    pub kill_rate_cap_factor: f32,
    pub collusion_void: bool,
    pub rejoin_cooldown_ms: u64,

    pub base_pickups: u32,
    pub pickups_per_participant: u32,
    pub pickup_effects: PickupEffects,
    pub rewards_enabled: bool,
    pub reward_reveal_ms: u64,
    pub reward_timeout_ms: u64,
    pub reward_radius: f32,
    pub reward_min_interval_ms: u64,

    pub new_joiner_grace_ms: u64,
    pub standings_size: usize,
    pub standings_window_ms: u64,
    pub settle_rewards: bool,
    pub idle_timeout_ms: u64,
    pub spectator_speed: f32,
    pub spectator_zoom: f32,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            mode: "Classic".to_string(),
            guide: "Collect sparks to evolve. Bigger forms consume smaller ones.".to_string(),
            round_length_ms: 10 * 60 * 1000,
            world_bounds: Rect::new(Vec2::new(-2000.0, -2000.0), Vec2::new(2000.0, 2000.0)),
            spawn_area: Rect::new(Vec2::new(-1600.0, -1600.0), Vec2::new(1600.0, 1600.0)),

            max_level: 8,
            start_level: 0,
            energy_cap: 100.0,
            start_energy: 50.0,
            level_decay_power: 1.0,
            global_decay_power: 1.0,
            decay_modifier_enabled: false,
            evolve_points: 25,
            evolve_burst_enabled: true,
            burst_speed: 600.0,
            burst_ms: 1_500,

            base_speed: 320.0,
            level_speed_step: 0.05,
            avatar_half_size: 20.0,
            sticky_islands: false,
            collision_speed_factor: 0.5,
            collision_debuff_ms: 1_000,
            stuck_invulnerable_ms: 2_000,
            desync_threshold: 150.0,
            max_jump_distance: 250.0,
            jump_kick_factor: 8.0,

            kills_enabled: true,
            touch_radius_base: 30.0,
            touch_radius_step: 4.0,
            touch_damage: 20.0,
            touch_debuff_ms: 750,
            touch_claim_ms: 3_000,
            kill_points: 100,
            orb_percent: 30,
            orb_delay_ms: 2_000,
            orb_cutoff_ms: 10_000,
            avoid_penalty_chance: 0.1,
            kill_energy_refund: 25.0,
            post_kill_buff_enabled: true,
            post_kill_buff_ms: 2_000,
            farm_kill_threshold: 2,
            farm_low_stat_threshold: 1,
            farm_void: false,
            kill_rate_cap_factor: 1.5,
            collusion_void: true,
            rejoin_cooldown_ms: 5_000,

            base_pickups: 40,
            pickups_per_participant: 6,
            pickup_effects: PickupEffects::default(),
            rewards_enabled: true,
            reward_reveal_ms: 3_000,
            reward_timeout_ms: 60_000,
            reward_radius: 40.0,
            reward_min_interval_ms: 120_000,

            new_joiner_grace_ms: 3_000,
            standings_size: 10,
            standings_window_ms: 60_000,
            settle_rewards: true,
            idle_timeout_ms: 120_000,
            spectator_speed: 900.0,
            spectator_zoom: 0.5,
        }
    }
}

impl RuleConfig {
    /// Touch radius of an avatar at `level`.
    pub fn touch_radius(&self, level: u32) -> f32 {
        self.touch_radius_base + self.touch_radius_step * level as f32
    }

    /// Speed multiplier of an avatar at `level`; never below 20% of base.
    pub fn level_speed_multiplier(&self, level: u32) -> f32 {
        (1.0 - self.level_speed_step * level as f32).max(0.2)
    }

    pub fn top_level(&self) -> u32 {
        self.max_level.saturating_sub(1)
    }

    /// Pull out-of-range values back into their domain.
    fn normalized(mut self) -> Self {
        self.max_level = self.max_level.max(1);
        self.start_level = self.start_level.min(self.max_level - 1);
        self.energy_cap = self.energy_cap.max(1.0);
        self.start_energy = self.start_energy.clamp(0.0, self.energy_cap);
        self.orb_percent = self.orb_percent.min(100);
        self.avoid_penalty_chance = self.avoid_penalty_chance.clamp(0.0, 1.0);
        self
    }
}

/// A named bundle of overrides selectable at round start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    /// Excluded presets can still be forced by an admin but are never rolled.
    #[serde(default)]
    pub excluded: bool,
    #[serde(default)]
    pub rules: Layer,
}

impl Preset {
    /// The preset's mode label, defaulting to its name.
    pub fn mode(&self) -> &str {
        self.rules
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }
}

/// Every rule layer known to the server.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub base: Layer,
    pub shared: Layer,
    pub presets: Vec<Preset>,
}

impl RuleSet {
    /// Presets shipped with the server, used when no rules directory exists.
    pub fn builtin() -> Self {
        let preset = |name: &str, rules: Value| Preset {
            name: name.to_string(),
            excluded: false,
            rules: match rules {
                Value::Object(m) => m,
                _ => Layer::new(),
            },
        };
        Self {
            base: Layer::new(),
            shared: Layer::new(),
            presets: vec![
                preset("classic", serde_json::json!({ "mode": "Classic" })),
                preset(
                    "islands",
                    serde_json::json!({
                        "mode": "Islands",
                        "sticky_islands": true,
                        "guide": "Islands are sticky. Steer around them.",
                    }),
                ),
                preset(
                    "frenzy",
                    serde_json::json!({
                        "mode": "Frenzy",
                        "global_decay_power": 2.0,
                        "pickups_per_participant": 10,
                        "pickup_effects": { "spark": { "energy": 14.0 } },
                    }),
                ),
                preset(
                    "sanctuary",
                    serde_json::json!({
                        "mode": "Sanctuary",
                        "global_decay_power": 0.0,
                        "guide": "No decay this round. Evolve at your own pace.",
                        "pickup_effects": { "gem": { "zoom": 0.8 } },
                    }),
                ),
                preset(
                    "treasure",
                    serde_json::json!({
                        "mode": "Treasure",
                        "reward_min_interval_ms": 30000,
                        "reward_timeout_ms": 30000,
                        "pickup_effects": { "comet": { "speed_factor": 2.0, "invincible_ms": 1000 } },
                    }),
                ),
            ],
        }
    }

    /// Load `base.toml`, `shared.toml` and `presets/*.toml` from `dir`.
    /// Missing base/shared files are treated as empty layers.
    pub fn load_dir(dir: &Path) -> Result<Self, RulesError> {
        let base = read_layer(&dir.join("base.toml"))?.unwrap_or_default();
        let shared = read_layer(&dir.join("shared.toml"))?.unwrap_or_default();

        let mut files: Vec<_> = std::fs::read_dir(dir.join("presets"))
            .map_err(|e| RulesError::Parse(format!("{}: {e}", dir.display())))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        let mut presets = Vec::with_capacity(files.len());
        for path in files {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RulesError::Parse(format!("{}: {e}", path.display())))?;
            let preset: Preset = toml::from_str(&content)
                .map_err(|e| RulesError::Parse(format!("{}: {e}", path.display())))?;
            presets.push(preset);
        }

        let set = Self {
            base,
            shared,
            presets,
        };
        if set.selectable().next().is_none() {
            return Err(RulesError::NoPresets);
        }
        Ok(set)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.presets.iter().position(|p| p.name == name)
    }

    fn selectable(&self) -> impl Iterator<Item = (usize, &Preset)> {
        self.presets.iter().enumerate().filter(|(_, p)| !p.excluded)
    }

    /// Derive the effective rules for `preset` with admin `overrides` on top.
    pub fn snapshot(&self, preset: usize, overrides: &Layer) -> Result<RuleConfig, RulesError> {
        let preset = self
            .presets
            .get(preset)
            .ok_or_else(|| RulesError::UnknownPreset(preset.to_string()))?;

        let mut merged = serde_json::to_value(RuleConfig::default())
            .map_err(|e| RulesError::Merge(e.to_string()))?;
        for layer in [&self.base, &self.shared, &preset.rules, overrides] {
            merge_layer(&mut merged, layer);
        }
        let config: RuleConfig =
            serde_json::from_value(merged).map_err(|e| RulesError::Merge(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Pick the next preset uniformly among selectable presets whose mode
    /// differs from the current one. Falls back to any selectable preset when
    /// every candidate shares the current mode.
    pub fn choose_next(&self, current: usize, rng: &mut impl Rng) -> Result<usize, RulesError> {
        let current_mode = self.presets.get(current).map(Preset::mode);
        let fresh: Vec<usize> = self
            .selectable()
            .filter(|(_, p)| Some(p.mode()) != current_mode)
            .map(|(i, _)| i)
            .collect();
        let pool: Vec<usize> = if fresh.is_empty() {
            self.selectable().map(|(i, _)| i).collect()
        } else {
            fresh
        };
        if pool.is_empty() {
            return Err(RulesError::NoPresets);
        }
        Ok(pool[rng.random_range(0..pool.len())])
    }
}

fn read_layer(path: &Path) -> Result<Option<Layer>, RulesError> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Ok(None);
    };
    let table: toml::Table = toml::from_str(&content)
        .map_err(|e| RulesError::Parse(format!("{}: {e}", path.display())))?;
    match serde_json::to_value(table) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Ok(None),
        Err(e) => Err(RulesError::Parse(format!("{}: {e}", path.display()))),
    }
}

/// Deep-merge `layer` into `target`: nested tables merge key by key, every
/// other value replaces what was there.
pub fn merge_layer(target: &mut Value, layer: &Layer) {
    let Value::Object(target_map) = target else {
        *target = Value::Object(layer.clone());
        return;
    };
    for (key, value) in layer {
        match (target_map.get_mut(key), value) {
            (Some(existing @ Value::Object(_)), Value::Object(nested)) => {
                merge_layer(existing, nested);
            },
            _ => {
                target_map.insert(key.clone(), value.clone());
            },
        }
    }
}

/// Set `value` at a dotted `path` (e.g. `pickup_effects.gem.score`) inside `layer`.
pub fn set_path(layer: &mut Layer, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = layer;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Layer::new()));
        if !slot.is_object() {
            *slot = Value::Object(Layer::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
}
