pub mod admin;
pub mod authority;
pub mod combat;
pub mod economy;
pub mod entities;
pub mod error;
pub mod events;
pub mod evolution;
pub mod geometry;
pub mod movement;
pub mod participant;
pub mod protocol;
pub mod round;
pub mod rules;
pub mod session;
pub mod tick;
pub mod time;
pub mod world;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use crate::authority::IdentityVerdict;
    use crate::geometry::{MapGeometry, Vec2};
    use crate::participant::{Participant, ParticipantId, Status};
    use crate::rules::{Layer, Preset, RuleSet};
    use crate::world::{World, WorldSettings};
    use crate::{round, session};

    /// World clock every test world starts at.
    pub const TEST_NOW: u64 = 1_000_000;

    fn layer(value: Value) -> Layer {
        match value {
            Value::Object(map) => map,
            _ => Layer::new(),
        }
    }

    /// Two presets with different modes and otherwise default rules.
    pub fn test_ruleset(base: Value) -> RuleSet {
        RuleSet {
            base: layer(base),
            shared: Layer::new(),
            presets: vec![
                Preset {
                    name: "classic".to_string(),
                    excluded: false,
                    rules: layer(json!({ "mode": "Classic" })),
                },
                Preset {
                    name: "alt".to_string(),
                    excluded: false,
                    rules: layer(json!({ "mode": "Alt" })),
                },
            ],
        }
    }

    /// Seeded world on an empty map.
    pub fn test_world() -> World {
        test_world_with(MapGeometry::empty(), json!({}))
    }

    pub fn test_world_with(map: MapGeometry, base: Value) -> World {
        World::new(
            WorldSettings::default(),
            Arc::new(map),
            test_ruleset(base),
            42,
            TEST_NOW,
        )
        .expect("test ruleset builds")
    }

    /// Put an identified participant straight into play at `position`, past
    /// the new-joiner grace window. Skips the authority round trip.
    pub fn join(world: &mut World, position: Vec2) -> ParticipantId {
        let id = world.next_participant_id();
        let now = world.now;
        let mut p = Participant::new(id, format!("fp-{id}"), String::new(), position, now);
        p.status.remove(Status::Dead);
        p.identified = true;
        p.identity.address = Some(format!("addr-{id}"));
        p.level = world.rules.start_level;
        p.energy = world.rules.start_energy;
        p.joined_at = Some(now.saturating_sub(world.rules.new_joiner_grace_ms + 1));
        world.participants.insert(id, p);
        round::enlist(world, id);
        id
    }

    /// Connect a participant and accept their identity for `address`.
    pub fn identified(world: &mut World, address: &str) -> ParticipantId {
        let id = session::connect(world, format!("fp-{address}"));
        session::identify_verdict(
            world,
            id,
            IdentityVerdict::Accepted {
                address: address.to_string(),
                name: None,
                privileged: false,
            },
        );
        id
    }
}
