//! Timer callbacks. Each takes the current clock and runs one pass over the
//! world; the host decides when the next run happens.

use crate::error::TickError;
use crate::events::Event;
use crate::participant::{ParticipantId, Status};
use crate::round::{self, RoundSummary};
use crate::time::Millis;
use crate::world::{Action, Scheduled, World};
use crate::{combat, economy, evolution, movement, session};

/// One simulation step.
///
/// Order: timed statuses, movement, collection, evolution, combat, pickup
/// sync, due scheduled actions, reward reveal. Collection runs before
/// evolution so energy is back within its cap when the tick ends, paused
/// or not.
pub fn fast_tick(world: &mut World, now: Millis) -> Result<(), TickError> {
    world.now = now;
    let dt_ms = now.saturating_sub(world.last_fast_tick);

    for p in world.participants.values_mut() {
        p.expire_timers(now);
    }
    movement::step(world, dt_ms);
    economy::collect(world);
    evolution::step(world);
    combat::scan(world);
    economy::sync_pickups(world);
    run_scheduled(world);
    economy::reveal_reward(world);

    world.last_fast_tick = now;
    validate(world)
}

/// Fire scheduled actions whose time has come, oldest first.
pub fn run_scheduled(world: &mut World) {
    let now = world.now;
    let (mut due, pending): (Vec<Scheduled>, Vec<Scheduled>) =
        std::mem::take(&mut world.scheduled)
            .into_iter()
            .partition(|s| s.at <= now);
    world.scheduled = pending;
    due.sort_by_key(|s| s.at);

    for scheduled in due {
        match scheduled.action {
            Action::Kick { id, reason } => {
                if world.participants.contains_key(&id) {
                    world.kick(id, &reason);
                }
            },
            Action::Remove { id } => session::remove(world, id),
        }
    }
}

/// Check the invariants a tick must leave intact.
pub fn validate(world: &World) -> Result<(), TickError> {
    let top = world.rules.top_level();
    let cap = world.rules.energy_cap;
    for p in world.participants.values() {
        if !p.position.is_finite() {
            return Err(TickError::NonFinitePosition(p.id));
        }
        if !p.energy.is_finite() {
            return Err(TickError::NonFiniteEnergy(p.id));
        }
        if p.is_live() && p.level > top {
            return Err(TickError::LevelOutOfRange {
                id: p.id,
                level: p.level,
            });
        }
        if p.is_live() && !(0.0..=cap).contains(&p.energy) {
            return Err(TickError::EnergyOutOfRange {
                id: p.id,
                energy: p.energy,
            });
        }
    }
    Ok(())
}

/// Housekeeping: reward expiry, persistence retries, stale rejoin entries.
pub fn slow_tick(world: &mut World, now: Millis) {
    world.now = now;
    economy::expire_reward(world);
    if world.authority_online && !world.persist_queue.is_empty() {
        round::retry_persistence(world);
    }
    let cooldown = world.rules.rejoin_cooldown_ms;
    world
        .recent_eliminations
        .retain(|_, at| now < *at + cooldown);
}

/// Queue a movement event for every avatar that moved since the last broadcast.
pub fn update_tick(world: &mut World, now: Millis) {
    world.now = now;
    let mut moved = Vec::new();
    for p in world.participants.values_mut() {
        if !p.is_live() && !p.is(Status::Spectating) {
            continue;
        }
        if p.last_broadcast == Some(p.position) {
            continue;
        }
        p.last_broadcast = Some(p.position);
        moved.push(Event::Moved {
            id: p.id,
            position: p.position,
            target: p.target,
        });
    }
    for event in moved {
        world.emit(event);
    }
}

/// Try to start a reward draw.
pub fn reward_tick(world: &mut World, now: Millis) {
    world.now = now;
    economy::begin_draw(world);
}

/// Kick connections that have gone quiet for too long.
pub fn connection_tick(world: &mut World, now: Millis) {
    world.now = now;
    let timeout = world.rules.idle_timeout_ms;
    let idle: Vec<ParticipantId> = world
        .participants
        .values()
        .filter(|p| !p.is(Status::Disconnected) && !p.is_privileged())
        .filter(|p| now.saturating_sub(p.last_input) > timeout)
        .map(|p| p.id)
        .collect();
    for id in idle {
        world.kick(id, "idle");
    }
}

/// Settle the round if its deadline has passed.
pub fn round_tick(world: &mut World, now: Millis) -> Option<RoundSummary> {
    world.now = now;
    round::is_due(world).then(|| round::settle(world))
}
