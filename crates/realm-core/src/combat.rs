use std::collections::HashSet;

use rand::Rng;

use crate::economy;
use crate::events::Event;
use crate::participant::{Participant, ParticipantId, SpeedBurst, Status};
use crate::rules::RuleConfig;
use crate::world::{Action, World};

/// Why a kill attempt was thrown out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidReason {
    KillsDisabled,
    Paused,
    AuthorityOffline,
    Protected,
    Farming,
    RateCap,
    Collusion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Voided(VoidReason),
    /// Both sides took touch damage; nobody was eliminated.
    Touched,
    /// Defender was still phased from an earlier touch; nothing happened.
    Grazed,
    Eliminated,
}

/// Can take part in a fight at all.
fn combatant(p: &Participant) -> bool {
    p.is_live() && !p.is(Status::Invincible)
}

/// Whether two avatars are within the sum of their touch radii.
pub fn in_contact(a: &Participant, b: &Participant, rules: &RuleConfig) -> bool {
    a.position.distance(b.position) <= rules.touch_radius(a.level) + rules.touch_radius(b.level)
}

/// Combat pass of the fast tick.
///
/// Pairs are evaluated in registry order with the higher level as attacker.
/// First match wins: an eliminated participant is skipped for the rest of the
/// tick, and an attacker stops scanning after its first elimination.
pub fn scan(world: &mut World) {
    let ids: Vec<ParticipantId> = world
        .participants
        .values()
        .filter(|p| combatant(p))
        .map(|p| p.id)
        .collect();
    let mut eliminated = HashSet::new();

    for &a in &ids {
        if eliminated.contains(&a) {
            continue;
        }
        for &b in &ids {
            if a == b || eliminated.contains(&b) {
                continue;
            }
            let (Some(pa), Some(pb)) = (world.participants.get(&a), world.participants.get(&b))
            else {
                continue;
            };
            if pa.level <= pb.level || !combatant(pa) || !combatant(pb) {
                continue;
            }
            if !in_contact(pa, pb, &world.rules) {
                continue;
            }
            if resolve_kill(world, a, b) == Verdict::Eliminated {
                eliminated.insert(b);
                break;
            }
        }
    }
}

/// Run the kill rules for `attacker` touching `defender`.
pub fn resolve_kill(
    world: &mut World,
    attacker: ParticipantId,
    defender: ParticipantId,
) -> Verdict {
    if let Some(reason) = kill_switch(world, attacker, defender) {
        return Verdict::Voided(reason);
    }
    if let Some(reason) = anti_feed(world, attacker, defender) {
        return Verdict::Voided(reason);
    }

    let now = world.now;
    let rules = &world.rules;
    let Some(d) = world.participants.get(&defender) else {
        return Verdict::Voided(VoidReason::Protected);
    };
    if d.level == 0 && d.energy <= 0.0 {
        eliminate(world, defender, Some(attacker));
        return Verdict::Eliminated;
    }
    if d.is(Status::Phased) && d.last_touch.is_some_and(|(by, _)| by == attacker) {
        return Verdict::Grazed;
    }

    let damage = rules.touch_damage;
    let until = now + rules.touch_debuff_ms;
    for id in [attacker, defender] {
        if let Some(p) = world.participants.get_mut(&id) {
            p.energy = (p.energy - damage).max(0.0);
            p.phase(until);
            p.last_update = now;
        }
    }
    if let Some(d) = world.participants.get_mut(&defender) {
        d.last_touch = Some((attacker, now));
    }
    world.emit(Event::Touched { attacker, defender });
    Verdict::Touched
}

fn kill_switch(
    world: &World,
    attacker: ParticipantId,
    defender: ParticipantId,
) -> Option<VoidReason> {
    if !world.rules.kills_enabled {
        return Some(VoidReason::KillsDisabled);
    }
    if world.is_paused() {
        return Some(VoidReason::Paused);
    }
    if !world.authority_online {
        return Some(VoidReason::AuthorityOffline);
    }
    let (Some(a), Some(d)) = (world.participants.get(&attacker), world.participants.get(&defender))
    else {
        return Some(VoidReason::Protected);
    };
    let protected = |p: &Participant| {
        p.is_privileged() || p.is(Status::Invincible) || p.is(Status::Dead) || !p.is_live()
    };
    if protected(a)
        || protected(d)
        || d.is_new_joiner(world.now, world.rules.new_joiner_grace_ms)
    {
        return Some(VoidReason::Protected);
    }
    None
}

/// Farming, kill-rate and collusion checks on the defender.
fn anti_feed(
    world: &mut World,
    attacker: ParticipantId,
    defender: ParticipantId,
) -> Option<VoidReason> {
    let live = world.live_count();
    let rules = &world.rules;
    let (Some(a), Some(d)) = (world.participants.get(&attacker), world.participants.get(&defender))
    else {
        return Some(VoidReason::Protected);
    };

    let fingerprint = d.identity.fingerprint.clone();
    let prior = a.kill_ledger.get(&fingerprint).copied().unwrap_or(0);
    let repeated = prior >= rules.farm_kill_threshold;
    let low_stats =
        d.stats.kills + d.stats.rewards + d.stats.pickups <= rules.farm_low_stat_threshold;
    let farming = repeated && low_stats;
    let expected_share = a.stats.kills as f32 / (live.saturating_sub(1)).max(1) as f32;
    let rate_capped = repeated && prior as f32 > rules.kill_rate_cap_factor * expected_share;
    let collusion = !fingerprint.is_empty() && a.identity.fingerprint == fingerprint;
    let (farm_void, collusion_void) = (rules.farm_void, rules.collusion_void);

    if farming || rate_capped {
        if let Some(a) = world.participants.get_mut(&attacker) {
            a.diagnostics.farming += 1;
        }
        tracing::warn!(
            participant_id = attacker,
            victim = defender,
            prior,
            farming,
            rate_capped,
            "Suspected kill farming"
        );
        if farming && farm_void {
            return Some(VoidReason::Farming);
        }
        if rate_capped {
            return Some(VoidReason::RateCap);
        }
    }

    if collusion {
        for id in [attacker, defender] {
            if let Some(p) = world.participants.get_mut(&id) {
                p.diagnostics.suspected_collusion += 1;
            }
        }
        tracing::warn!(participant_id = attacker, victim = defender, "Suspected collusion");
        if collusion_void {
            return Some(VoidReason::Collusion);
        }
    }
    None
}

/// Remove `defender` from play, crediting `attacker` if there is one.
pub fn eliminate(world: &mut World, defender: ParticipantId, attacker: Option<ParticipantId>) {
    let now = world.now;
    let rules = world.rules.clone();
    let remaining = world.round_remaining();
    let avoided = world.rng.random_bool(rules.avoid_penalty_chance);

    let Some(d) = world.participants.get_mut(&defender) else {
        return;
    };
    let before = d.stats.score;
    let level = d.level;
    let position = d.position;
    let fingerprint = d.identity.fingerprint.clone();
    d.status.insert(Status::Dead);
    d.status.remove(Status::Joining);
    d.stats.deaths += 1;
    d.last_update = now;
    let mut orb_value = 0;
    if !avoided {
        d.stats.score = before * u64::from(100 - rules.orb_percent) / 100;
        orb_value = before * u64::from(rules.orb_percent) / 100;
    }
    let defender_score = d.stats.score;
    let address = d.identity.address.clone();

    if let Some(address) = address {
        world.recent_eliminations.insert(address, now);
    }

    let mut attacker_score = None;
    if let Some(a) = attacker.and_then(|id| world.participants.get_mut(&id)) {
        a.stats.score += rules.kill_points * u64::from(level + 1);
        a.stats.kills += 1;
        *a.kill_ledger.entry(fingerprint).or_insert(0) += 1;
        a.energy = (a.energy + rules.kill_energy_refund).min(rules.energy_cap);
        a.last_update = now;
        if rules.post_kill_buff_enabled {
            a.grant_invincibility(now + rules.post_kill_buff_ms);
            a.burst = Some(SpeedBurst {
                speed: rules.burst_speed,
                until: now + rules.post_kill_buff_ms,
            });
        }
        attacker_score = Some((a.id, a.stats.score));
    }

    tracing::info!(
        participant_id = defender,
        attacker = ?attacker,
        level,
        orb_value,
        avoided,
        "Participant eliminated"
    );
    world.emit(Event::Eliminated { defender, attacker });
    if let Some((id, score)) = attacker_score {
        world.emit(Event::Score { id, score });
    }
    world.emit(Event::Score {
        id: defender,
        score: defender_score,
    });

    if orb_value > 0 && remaining > rules.orb_cutoff_ms {
        economy::spawn_orb(world, orb_value, position, now + rules.orb_delay_ms);
    }
    world.schedule(
        now + world.settings.eliminated_disconnect_ms,
        Action::Kick {
            id: defender,
            reason: "eliminated".to_string(),
        },
    );
}
