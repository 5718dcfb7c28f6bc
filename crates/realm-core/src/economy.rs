use rand::Rng;

use crate::entities::{Orb, Pickup, PickupKind, Reward, RewardDraw, RewardSlot};
use crate::events::Event;
use crate::geometry::Vec2;
use crate::participant::{ParticipantId, SpeedBurst, Status};
use crate::round::Claim;
use crate::rules::RuleConfig;
use crate::time::Millis;
use crate::world::World;

/// Pickups kept clear of the map by this half extent.
const PICKUP_HALF_SIZE: f32 = 10.0;

/// Pickup population for `live` participants in play.
pub fn target_pickups(rules: &RuleConfig, live: usize) -> usize {
    rules.base_pickups as usize + live * rules.pickups_per_participant as usize
}

/// Grow or shrink the pickup population to its target. Shrinking drops the
/// newest pickups first; growing spawns at clear random points.
pub fn sync_pickups(world: &mut World) {
    let target = target_pickups(&world.rules, world.live_count());
    let current = world.pickups.len();

    if current > target {
        let removed: Vec<Pickup> = world.pickups.drain(target..).collect();
        for pickup in removed {
            world.emit(Event::PickupRemoved {
                id: pickup.id,
                collector: None,
            });
        }
        return;
    }

    for _ in current..target {
        let position = world.clear_point(PICKUP_HALF_SIZE);
        let kind = PickupKind::from_roll(world.rng.random_range(0..100));
        let id = world.next_entity_id();
        world.pickups.push(Pickup {
            id,
            kind,
            position,
            scale: 1.0,
        });
        world.emit(Event::PickupSpawned { id, kind, position });
    }
}

/// Drop an orb that is visible now and collectible from `active_at`.
pub fn spawn_orb(world: &mut World, value: u64, position: Vec2, active_at: Millis) {
    let id = world.next_entity_id();
    world.orbs.push(Orb {
        id,
        value,
        active_at,
        position,
    });
    world.emit(Event::OrbSpawned {
        id,
        value,
        position,
        active_at,
    });
}

/// Collection pass of the fast tick: pickups, active orbs, and the active reward.
pub fn collect(world: &mut World) {
    let now = world.now;
    let ids: Vec<(ParticipantId, Vec2, f32)> = world
        .participants
        .values()
        .filter(|p| p.is_live())
        .map(|p| (p.id, p.position, world.rules.touch_radius(p.level)))
        .collect();

    for (id, position, radius) in ids {
        let (pickups, kept): (Vec<Pickup>, Vec<Pickup>) = std::mem::take(&mut world.pickups)
            .into_iter()
            .partition(|pk| pk.position.distance(position) <= radius);
        world.pickups = kept;
        for pickup in pickups {
            apply_pickup(world, id, pickup.kind);
            world.emit(Event::PickupRemoved {
                id: pickup.id,
                collector: Some(id),
            });
        }

        let (orbs, kept): (Vec<Orb>, Vec<Orb>) = std::mem::take(&mut world.orbs)
            .into_iter()
            .partition(|o| o.is_active(now) && o.position.distance(position) <= radius);
        world.orbs = kept;
        for orb in orbs {
            let score = world.participants.get_mut(&id).map(|p| {
                p.stats.score += orb.value;
                p.last_update = now;
                p.stats.score
            });
            world.emit(Event::OrbCollected {
                id: orb.id,
                collector: id,
            });
            if let Some(score) = score {
                world.emit(Event::Score { id, score });
            }
        }

        try_claim_reward(world, id, position);
    }
}

fn apply_pickup(world: &mut World, id: ParticipantId, kind: PickupKind) {
    let now = world.now;
    let effect = world.rules.pickup_effects.get(kind).clone();
    let base_speed = world.rules.base_speed;
    let Some(p) = world.participants.get_mut(&id) else {
        return;
    };
    p.energy += effect.energy;
    p.stats.score += effect.score;
    p.stats.pickups += 1;
    p.last_update = now;
    if effect.invincible_ms > 0 {
        p.grant_invincibility(now + effect.invincible_ms);
    }
    if effect.speed_ms > 0 && effect.speed_factor != 1.0 {
        p.burst = Some(SpeedBurst {
            speed: base_speed * p.speed_modifier * effect.speed_factor,
            until: now + effect.speed_ms,
        });
    }
    let score = p.stats.score;
    if effect.score > 0 {
        world.emit(Event::Score { id, score });
    }
    if let Some(zoom) = effect.zoom {
        world.emit(Event::Zoom { id, zoom });
    }
}

fn try_claim_reward(world: &mut World, id: ParticipantId, position: Vec2) {
    let RewardSlot::Active(reward) = &world.reward else {
        return;
    };
    if reward.position.distance(position) > world.rules.reward_radius {
        return;
    }
    let Some(p) = world.participants.get(&id) else {
        return;
    };
    if p.is(Status::Invincible) || p.is_new_joiner(world.now, world.rules.new_joiner_grace_ms) {
        return;
    }

    let RewardSlot::Active(reward) = std::mem::take(&mut world.reward) else {
        return;
    };
    let address = p.identity.address.clone();
    if let Some(p) = world.participants.get_mut(&id) {
        p.stats.rewards += 1;
    }
    tracing::info!(
        participant_id = id,
        category = %reward.draw.category,
        name = %reward.draw.name,
        "Reward claimed"
    );
    world.round.claims.push(Claim {
        participant: id,
        address,
        draw: reward.draw.clone(),
        at: world.now,
    });
    world.emit(Event::RewardClaimed {
        id: reward.id,
        collector: id,
    });
}

/// Start a reward draw if the slot is free. Called by the reward spawn timer.
pub fn begin_draw(world: &mut World) {
    if !world.rules.rewards_enabled
        || !world.reward.is_idle()
        || world.is_paused()
        || world.live_count() == 0
    {
        return;
    }
    let round_id = world.round.id;
    world.reward = RewardSlot::Drawing { round_id };
    world.request(crate::authority::AuthorityRequest::Draw { round_id });
}

/// Accept a draw result. The slot and round are rechecked because anything
/// may have happened while the draw was in flight.
pub fn accept_draw(world: &mut World, round_id: u64, draw: Option<RewardDraw>) {
    let drawing = matches!(world.reward, RewardSlot::Drawing { round_id: r } if r == round_id);
    if !drawing || world.round.id != round_id {
        tracing::debug!(round_id, "Discarding stale reward draw");
        return;
    }
    world.reward = RewardSlot::Idle;
    let Some(draw) = draw else {
        return;
    };
    let now = world.now;
    if !world
        .drops
        .allows(&draw.category, now, world.rules.reward_min_interval_ms)
    {
        tracing::debug!(category = %draw.category, "Reward category dropped too recently");
        return;
    }

    let position = world.clear_point(world.rules.reward_radius);
    let active_at = now + world.rules.reward_reveal_ms;
    let id = world.next_entity_id();
    world.reward = RewardSlot::Pending(Reward {
        id,
        draw,
        position,
        active_at,
        expires_at: active_at + world.rules.reward_timeout_ms,
    });
}

/// Make a pending reward visible once its delay has passed.
pub fn reveal_reward(world: &mut World) {
    let due = matches!(&world.reward, RewardSlot::Pending(r) if world.now >= r.active_at);
    if !due {
        return;
    }
    let RewardSlot::Pending(reward) = std::mem::take(&mut world.reward) else {
        return;
    };
    world.drops.record(&reward.draw.category, world.now);
    world.emit(Event::RewardSpawned {
        id: reward.id,
        category: reward.draw.category.clone(),
        name: reward.draw.name.clone(),
        rarity: reward.draw.rarity.clone(),
        quantity: reward.draw.quantity,
        position: reward.position,
    });
    world.reward = RewardSlot::Active(reward);
}

/// Drop an unclaimed reward after its timeout, freeing the slot.
pub fn expire_reward(world: &mut World) {
    let due = matches!(&world.reward, RewardSlot::Active(r) if world.now >= r.expires_at);
    if !due {
        return;
    }
    if let RewardSlot::Active(reward) = std::mem::take(&mut world.reward) {
        tracing::debug!(reward = reward.id, "Reward expired");
        world.emit(Event::RewardExpired { id: reward.id });
    }
}
