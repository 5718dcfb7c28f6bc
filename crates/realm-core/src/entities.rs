use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geometry::Vec2;
use crate::time::Millis;

pub type EntityId = u64;

/// The four pickup kinds. Effects come from the active rule snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickupKind {
    Spark,
    Gem,
    Ward,
    Comet,
}

impl PickupKind {
    pub const ALL: [PickupKind; 4] = [
        PickupKind::Spark,
        PickupKind::Gem,
        PickupKind::Ward,
        PickupKind::Comet,
    ];

    /// Relative spawn weight out of 100.
    pub fn spawn_weight(self) -> u32 {
        match self {
            PickupKind::Spark => 70,
            PickupKind::Gem => 15,
            PickupKind::Ward => 8,
            PickupKind::Comet => 7,
        }
    }

    /// Map a roll in `0..100` to a kind using the spawn weights.
    pub fn from_roll(roll: u32) -> PickupKind {
        let mut acc = 0;
        for kind in Self::ALL {
            acc += kind.spawn_weight();
            if roll < acc {
                return kind;
            }
        }
        PickupKind::Spark
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PickupKind::Spark => "spark",
            PickupKind::Gem => "gem",
            PickupKind::Ward => "ward",
            PickupKind::Comet => "comet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pickup {
    pub id: EntityId,
    pub kind: PickupKind,
    pub position: Vec2,
    pub scale: f32,
}

/// Score dropped by an elimination. Collectible from `active_at` on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orb {
    pub id: EntityId,
    pub value: u64,
    pub active_at: Millis,
    pub position: Vec2,
}

impl Orb {
    pub fn is_active(&self, now: Millis) -> bool {
        now >= self.active_at
    }
}

/// Catalog entry returned by a reward draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardDraw {
    pub category: String,
    pub name: String,
    pub rarity: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub id: EntityId,
    pub draw: RewardDraw,
    pub position: Vec2,
    pub active_at: Millis,
    pub expires_at: Millis,
}

/// The single reward slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RewardSlot {
    #[default]
    Idle,
    /// A draw request is in flight for the given round.
    Drawing { round_id: u64 },
    /// Drawn; becomes visible and claimable at `reward.active_at`.
    Pending(Reward),
    Active(Reward),
}

impl RewardSlot {
    pub fn is_idle(&self) -> bool {
        matches!(self, RewardSlot::Idle)
    }
}

/// Last drop time per reward category, used by the minimum-interval gate.
#[derive(Debug, Clone, Default)]
pub struct DropHistory(HashMap<String, Millis>);

impl DropHistory {
    pub fn record(&mut self, category: &str, at: Millis) {
        self.0.insert(category.to_string(), at);
    }

    /// Whether `category` may drop at `now` given the minimum interval.
    pub fn allows(&self, category: &str, now: Millis, min_interval: u64) -> bool {
        self.0
            .get(category)
            .is_none_or(|&last| now >= last + min_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_cover_all_rolls() {
        let total: u32 = PickupKind::ALL.iter().map(|k| k.spawn_weight()).sum();
        assert_eq!(total, 100);
        assert_eq!(PickupKind::from_roll(0), PickupKind::Spark);
        assert_eq!(PickupKind::from_roll(69), PickupKind::Spark);
        assert_eq!(PickupKind::from_roll(70), PickupKind::Gem);
        assert_eq!(PickupKind::from_roll(99), PickupKind::Comet);
    }

    #[test]
    fn orb_activation() {
        let orb = Orb {
            id: 1,
            value: 10,
            active_at: 500,
            position: Vec2::ZERO,
        };
        assert!(!orb.is_active(499));
        assert!(orb.is_active(500));
    }

    #[test]
    fn drop_history_gates_by_category() {
        let mut h = DropHistory::default();
        assert!(h.allows("gold", 0, 1_000));
        h.record("gold", 100);
        assert!(!h.allows("gold", 500, 1_000));
        assert!(h.allows("gold", 1_100, 1_000));
        assert!(h.allows("silver", 500, 1_000));
    }
}
