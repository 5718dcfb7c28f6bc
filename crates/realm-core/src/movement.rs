use crate::geometry::{Contact, MapGeometry, Rect, Vec2, move_towards};
use crate::participant::{Participant, ParticipantId, Status};
use crate::rules::RuleConfig;
use crate::time::Millis;
use crate::world::World;

/// Result of advancing one participant by one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub position: Vec2,
    pub contact: Contact,
    pub out_of_bounds: bool,
    /// The move entered a collider from a clear position.
    pub entered: bool,
}

/// Speed in units per second, before any map effects.
pub fn effective_speed(p: &Participant, rules: &RuleConfig) -> f32 {
    if p.is(Status::Spectating) {
        return rules.spectator_speed;
    }
    let speed = match p.burst {
        Some(burst) => burst.speed,
        None => rules.base_speed * rules.level_speed_multiplier(p.level) * p.speed_modifier,
    };
    if p.is(Status::Phased) {
        speed * rules.collision_speed_factor
    } else {
        speed
    }
}

/// Advance `p` toward its target for `dt_ms` and classify the result against
/// the world bounds and the map. Does not mutate anything.
pub fn resolve_step(
    p: &Participant,
    rules: &RuleConfig,
    map: &MapGeometry,
    dt_ms: u64,
) -> StepOutcome {
    let max_step = effective_speed(p, rules) * dt_ms as f32 / 1000.0;
    let next = move_towards(p.position, p.target, max_step);

    if p.is_privileged() {
        return StepOutcome {
            position: next,
            contact: Contact::Free,
            out_of_bounds: false,
            entered: false,
        };
    }

    let (clamped, out_of_bounds) = rules.world_bounds.clamp(next);
    if p.is(Status::Spectating) {
        return StepOutcome {
            position: clamped,
            contact: Contact::Free,
            out_of_bounds,
            entered: false,
        };
    }

    let half = rules.avatar_half_size;
    let contact = map.classify(&Rect::around(clamped, half), rules.sticky_islands);
    // A participant already inside a collider may always move out of it.
    let entered = contact != Contact::Free
        && map.classify(&Rect::around(p.position, half), rules.sticky_islands) == Contact::Free;
    let position = match contact {
        Contact::Blocked | Contact::Stuck if entered => p.position,
        _ => clamped,
    };
    StepOutcome {
        position,
        contact,
        out_of_bounds,
        entered,
    }
}

/// Apply the side effects of a step outcome to the participant.
pub fn commit_step(p: &mut Participant, outcome: StepOutcome, rules: &RuleConfig, now: Millis) {
    if outcome.out_of_bounds {
        p.diagnostics.out_of_bounds += 1;
        p.target = outcome.position;
        tracing::debug!(participant_id = p.id, "Clamped to world bounds");
    }

    match outcome.contact {
        Contact::Free => {},
        Contact::Collided => {
            if !p.is(Status::Phased) {
                p.diagnostics.collided += 1;
            }
            p.phase(now + rules.collision_debuff_ms);
        },
        Contact::Blocked if outcome.entered => {
            p.target = outcome.position;
            p.phase(now + rules.collision_debuff_ms);
        },
        Contact::Stuck if outcome.entered => {
            p.diagnostics.stuck += 1;
            p.target = outcome.position;
            p.phase(now + rules.collision_debuff_ms);
            p.grant_invincibility(now + rules.stuck_invulnerable_ms);
        },
        // still inside the collider from an earlier tick, keep the debuff going
        Contact::Blocked | Contact::Stuck => p.phase(now + rules.collision_debuff_ms),
    }

    if outcome.position != p.position {
        p.last_update = now;
    }
    p.position = outcome.position;
}

/// Flag a participant whose own report has drifted too far from the
/// authoritative position. Only fresh reports are checked.
pub fn check_desync(p: &mut Participant, rules: &RuleConfig, since: Millis, now: Millis) -> bool {
    if p.is_privileged() || p.last_input < since {
        return false;
    }
    if p.position.distance(p.client_position) <= rules.desync_threshold {
        return false;
    }
    p.diagnostics.desync += 1;
    p.phase(now + rules.collision_debuff_ms);
    tracing::debug!(
        participant_id = p.id,
        drift = p.position.distance(p.client_position),
        "Client position desync"
    );
    true
}

/// Movement pass of the fast tick.
pub fn step(world: &mut World, dt_ms: u64) {
    let since = world.last_fast_tick;
    let now = world.now;
    let ids: Vec<ParticipantId> = world
        .participants
        .values()
        .filter(|p| p.is_live() || p.is(Status::Spectating))
        .map(|p| p.id)
        .collect();

    for id in ids {
        let Some(p) = world.participants.get_mut(&id) else {
            continue;
        };
        let outcome = resolve_step(p, &world.rules, &world.map, dt_ms);
        commit_step(p, outcome, &world.rules, now);
        check_desync(p, &world.rules, since, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Collider, ColliderCategory};
    use crate::participant::SpeedBurst;

    fn walker(at: Vec2, target: Vec2) -> Participant {
        let mut p = Participant::new(1, "fp".to_string(), String::new(), at, 0);
        p.status.remove(Status::Dead);
        p.target = target;
        p
    }

    fn map_with(category: ColliderCategory, center: Vec2, half: f32) -> MapGeometry {
        MapGeometry {
            name: "t".to_string(),
            colliders: vec![Collider {
                name: "c".to_string(),
                category,
                rect: Rect::around(center, half),
            }],
        }
    }

    #[test]
    fn speed_scales_with_level_and_modifier() {
        let rules = RuleConfig::default();
        let mut p = walker(Vec2::ZERO, Vec2::ZERO);
        let base = effective_speed(&p, &rules);
        assert_eq!(base, rules.base_speed);
        p.level = 2;
        assert!(effective_speed(&p, &rules) < base);
        p.level = 0;
        p.speed_modifier = 2.0;
        assert_eq!(effective_speed(&p, &rules), base * 2.0);
    }

    #[test]
    fn burst_overrides_speed() {
        let rules = RuleConfig::default();
        let mut p = walker(Vec2::ZERO, Vec2::ZERO);
        p.burst = Some(SpeedBurst {
            speed: 999.0,
            until: 10,
        });
        assert_eq!(effective_speed(&p, &rules), 999.0);
        p.status.insert(Status::Phased);
        assert_eq!(effective_speed(&p, &rules), 999.0 * rules.collision_speed_factor);
    }

    #[test]
    fn step_is_capped_by_speed() {
        let rules = RuleConfig::default();
        let p = walker(Vec2::ZERO, Vec2::new(1000.0, 0.0));
        let out = resolve_step(&p, &rules, &MapGeometry::empty(), 100);
        assert!((out.position.x - rules.base_speed * 0.1).abs() < 1e-3);
        assert_eq!(out.contact, Contact::Free);
    }

    #[test]
    fn boundary_clamp_is_exact_and_counted_once() {
        let rules = RuleConfig::default();
        let max_x = rules.world_bounds.max.x;
        let mut p = walker(Vec2::new(max_x - 10.0, 0.0), Vec2::new(max_x + 100.0, 0.0));
        let out = resolve_step(&p, &rules, &MapGeometry::empty(), 10_000);
        assert!(out.out_of_bounds);
        commit_step(&mut p, out, &rules, 0);
        assert_eq!(p.position.x, max_x);
        assert_eq!(p.diagnostics.out_of_bounds, 1);

        let out = resolve_step(&p, &rules, &MapGeometry::empty(), 10_000);
        commit_step(&mut p, out, &rules, 0);
        assert_eq!(p.diagnostics.out_of_bounds, 1);
    }

    #[test]
    fn wall_halts_and_grants_invulnerability() {
        let rules = RuleConfig::default();
        let map = map_with(ColliderCategory::Collider, Vec2::new(100.0, 0.0), 30.0);
        let mut p = walker(Vec2::ZERO, Vec2::new(100.0, 0.0));
        let out = resolve_step(&p, &rules, &map, 1_000);
        assert_eq!(out.contact, Contact::Stuck);
        commit_step(&mut p, out, &rules, 5);
        assert_eq!(p.position, Vec2::ZERO);
        assert_eq!(p.target, Vec2::ZERO);
        assert!(p.is(Status::Phased));
        assert!(p.is(Status::Invincible));
        assert_eq!(p.diagnostics.stuck, 1);
    }

    #[test]
    fn land_commits_with_debuff() {
        let rules = RuleConfig::default();
        let map = map_with(ColliderCategory::Land, Vec2::new(100.0, 0.0), 30.0);
        let mut p = walker(Vec2::ZERO, Vec2::new(100.0, 0.0));
        let out = resolve_step(&p, &rules, &map, 1_000);
        assert_eq!(out.contact, Contact::Collided);
        commit_step(&mut p, out, &rules, 5);
        assert_eq!(p.position, Vec2::new(100.0, 0.0));
        assert!(p.is(Status::Phased));
        assert!(!p.is(Status::Invincible));
        assert_eq!(p.diagnostics.collided, 1);
    }

    #[test]
    fn island_blocks_unless_sticky() {
        let mut rules = RuleConfig::default();
        let map = map_with(ColliderCategory::Island, Vec2::new(100.0, 0.0), 30.0);
        let mut p = walker(Vec2::ZERO, Vec2::new(100.0, 0.0));
        let out = resolve_step(&p, &rules, &map, 1_000);
        assert_eq!(out.contact, Contact::Blocked);
        commit_step(&mut p, out, &rules, 0);
        assert_eq!(p.position, Vec2::ZERO);
        assert!(!p.is(Status::Invincible));

        rules.sticky_islands = true;
        let p = walker(Vec2::ZERO, Vec2::new(100.0, 0.0));
        assert_eq!(resolve_step(&p, &rules, &map, 1_000).contact, Contact::Stuck);
    }

    #[test]
    fn can_leave_a_collider_already_inside() {
        let rules = RuleConfig::default();
        let map = map_with(ColliderCategory::Collider, Vec2::ZERO, 50.0);
        let p = walker(Vec2::ZERO, Vec2::new(10.0, 0.0));
        let out = resolve_step(&p, &rules, &map, 1_000);
        assert!(!out.entered);
        assert_eq!(out.position, Vec2::new(10.0, 0.0));
    }

    #[test]
    fn privileged_ignores_map_and_bounds() {
        let rules = RuleConfig::default();
        let map = map_with(ColliderCategory::Collider, Vec2::new(100.0, 0.0), 30.0);
        let mut p = walker(Vec2::ZERO, Vec2::new(100.0, 0.0));
        p.status.insert(Status::Privileged);
        let out = resolve_step(&p, &rules, &map, 1_000);
        assert_eq!(out.contact, Contact::Free);
        assert_eq!(out.position, Vec2::new(100.0, 0.0));

        let far = rules.world_bounds.max.x + 500.0;
        p.target = Vec2::new(far, 0.0);
        p.speed_modifier = 100.0;
        let out = resolve_step(&p, &rules, &MapGeometry::empty(), 1_000);
        assert!(!out.out_of_bounds);
        assert_eq!(out.position.x, far);
    }

    #[test]
    fn desync_flags_without_kicking() {
        let rules = RuleConfig::default();
        let mut p = walker(Vec2::ZERO, Vec2::ZERO);
        p.client_position = Vec2::new(rules.desync_threshold + 1.0, 0.0);
        p.last_input = 10;
        assert!(check_desync(&mut p, &rules, 5, 20));
        assert_eq!(p.diagnostics.desync, 1);
        assert!(p.is(Status::Phased));
        // stale report is not rechecked
        assert!(!check_desync(&mut p, &rules, 15, 30));
    }
}
