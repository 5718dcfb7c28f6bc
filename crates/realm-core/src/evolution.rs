use crate::combat;
use crate::events::Event;
use crate::participant::{Participant, ParticipantId, SpeedBurst, Status};
use crate::rules::RuleConfig;
use crate::time::Millis;
use crate::world::World;

/// What one evolution step did to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Evolved(u32),
    Regressed(u32),
    /// Energy ran out at level 0.
    Depleted,
}

/// Energy lost per fast tick at the participant's current level.
pub fn decay_per_tick(p: &Participant, rules: &RuleConfig, tick_ms: u64) -> f32 {
    let tick_secs = tick_ms as f32 / 1000.0;
    let mut decay =
        (p.level + 1) as f32 * tick_secs * rules.level_decay_power * rules.global_decay_power;
    if rules.decay_modifier_enabled {
        decay *= p.decay_modifier as f32 / 100.0;
    }
    decay
}

/// Whether a depleted participant at level 0 survives anyway.
pub fn is_immune(p: &Participant, rules: &RuleConfig, now: Millis) -> bool {
    p.is(Status::Invincible)
        || p.is_privileged()
        || p.is(Status::Spectating)
        || p.is_new_joiner(now, rules.new_joiner_grace_ms)
}

/// Apply one tick of decay and resolve level transitions.
///
/// Energy is back in `[0, energy_cap]` on return. A non-positive decay never
/// depletes anyone, which is how decay-free modes stay safe.
pub fn advance(
    p: &mut Participant,
    rules: &RuleConfig,
    decay: f32,
    immune: bool,
    now: Millis,
) -> Transition {
    if decay > 0.0 {
        p.energy -= decay;
    }

    let cap = rules.energy_cap;
    if p.energy > cap {
        if p.level >= rules.top_level() {
            p.energy = cap;
            return Transition::None;
        }
        p.energy = (p.energy - cap).min(cap);
        p.level += 1;
        p.stats.evolves += 1;
        p.stats.score += rules.evolve_points;
        p.last_update = now;
        if rules.evolve_burst_enabled {
            p.burst = Some(SpeedBurst {
                speed: rules.burst_speed,
                until: now + rules.burst_ms,
            });
        }
        return Transition::Evolved(p.level);
    }

    if p.energy > 0.0 {
        return Transition::None;
    }
    p.energy = 0.0;
    if decay <= 0.0 {
        return Transition::None;
    }
    if p.level > 0 {
        p.level -= 1;
        p.energy = cap;
        p.last_update = now;
        return Transition::Regressed(p.level);
    }
    if immune {
        return Transition::None;
    }
    Transition::Depleted
}

/// Participant who may claim a decay elimination of `p`: the last toucher, if
/// the touch is recent enough and they are still in play.
fn claimant(world: &World, p: &Participant) -> Option<ParticipantId> {
    let (attacker, at) = p.last_touch?;
    if world.now > at + world.rules.touch_claim_ms {
        return None;
    }
    world
        .participants
        .get(&attacker)
        .filter(|a| a.is_live())
        .map(|a| a.id)
}

/// Pull every participant back inside the current level and energy bounds.
/// No transitions are awarded; a level above the top is reported as a
/// regression.
pub fn clamp_to_rules(world: &mut World) {
    let top = world.rules.top_level();
    let cap = world.rules.energy_cap;
    let mut regressed = Vec::new();
    for p in world.participants.values_mut() {
        p.energy = p.energy.clamp(0.0, cap);
        if p.level > top {
            p.level = top;
            if p.is_live() {
                regressed.push(p.id);
            }
        }
    }
    for id in regressed {
        world.emit(Event::Regressed { id, level: top });
    }
}

/// Evolution pass of the fast tick. While paused no decay or transitions run,
/// only the bounds are enforced.
pub fn step(world: &mut World) {
    if world.is_paused() {
        clamp_to_rules(world);
        return;
    }
    let now = world.now;
    let tick_ms = world.settings.fast_tick_ms;
    let ids: Vec<ParticipantId> = world
        .participants
        .values()
        .filter(|p| p.is_live())
        .map(|p| p.id)
        .collect();

    for id in ids {
        let Some(p) = world.participants.get_mut(&id) else {
            continue;
        };
        let decay = decay_per_tick(p, &world.rules, tick_ms);
        let immune = is_immune(p, &world.rules, now);
        match advance(p, &world.rules, decay, immune, now) {
            Transition::None => {},
            Transition::Evolved(level) => {
                let score = p.stats.score;
                tracing::debug!(participant_id = id, level, "Evolved");
                world.emit(Event::Evolved { id, level });
                world.emit(Event::Score { id, score });
            },
            Transition::Regressed(level) => {
                tracing::debug!(participant_id = id, level, "Regressed");
                world.emit(Event::Regressed { id, level });
            },
            Transition::Depleted => {
                if !world.authority_online {
                    continue;
                }
                let Some(p) = world.participants.get(&id) else {
                    continue;
                };
                let attacker = claimant(world, p);
                combat::eliminate(world, id, attacker);
            },
        }
    }
}
