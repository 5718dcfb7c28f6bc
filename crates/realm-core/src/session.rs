//! Inbound participant messages. Every handler validates against the current
//! world state; nothing the client says is trusted.

use crate::authority::{AuthorityRequest, IdentityVerdict, JoinVerdict};
use crate::entities::RewardSlot;
use crate::events::Event;
use crate::geometry::Vec2;
use crate::participant::{Participant, ParticipantId, Status};
use crate::protocol::{ClientMessage, PROTOCOL_VERSION, ParticipantView, ServerMessage, Snapshot};
use crate::round;
use crate::time::Millis;
use crate::world::{Action, World};

/// Register a new connection. The participant starts dead at a random spawn.
pub fn connect(world: &mut World, fingerprint: String) -> ParticipantId {
    let id = world.next_participant_id();
    let nonce = world.nonce();
    let spawn = world.clear_point(world.rules.avatar_half_size);
    let participant = Participant::new(id, fingerprint, nonce.clone(), spawn, world.now);
    world.participants.insert(id, participant);
    tracing::info!(participant_id = id, "Participant connected");
    world.send(
        id,
        ServerMessage::Welcome {
            id,
            nonce,
            version: PROTOCOL_VERSION,
        },
    );
    id
}

/// Route a decoded client message to its handler.
pub fn handle(world: &mut World, id: ParticipantId, msg: ClientMessage) {
    match msg {
        ClientMessage::Identify {
            address,
            signature,
            name,
            version,
        } => identify(world, id, address, signature, name, version),
        ClientMessage::JoinRoom => join(world, id),
        ClientMessage::UpdateSelf {
            position,
            target,
            sent_at,
        } => update_self(world, id, position, target, sent_at),
        ClientMessage::Spectate => spectate(world, id),
    }
}

/// Count a dropped message against the participant.
pub fn reject_input(world: &mut World, id: ParticipantId) {
    if let Some(p) = world.participants.get_mut(&id) {
        p.diagnostics.rejected_inputs += 1;
    }
}

fn info(world: &mut World, id: ParticipantId, message: &str) {
    world.send(
        id,
        ServerMessage::Info {
            message: message.to_string(),
        },
    );
}

pub fn identify(
    world: &mut World,
    id: ParticipantId,
    address: String,
    signature: String,
    name: Option<String>,
    version: u32,
) {
    let Some(p) = world.participants.get(&id) else {
        return;
    };
    if p.identified {
        reject_input(world, id);
        return;
    }
    let nonce = p.nonce.clone();
    if version != PROTOCOL_VERSION {
        world.kick(id, "version mismatch");
        return;
    }
    if world.bans.contains(&address) {
        world.kick(id, "banned");
        return;
    }
    world.request(AuthorityRequest::Verify {
        id,
        address,
        signature,
        nonce,
        name,
    });
}

/// Apply the authority's identity verdict, if the connection is still waiting for it.
pub fn identify_verdict(world: &mut World, id: ParticipantId, verdict: IdentityVerdict) {
    let Some(p) = world.participants.get(&id) else {
        return;
    };
    if p.identified || p.is(Status::Disconnected) {
        return;
    }
    match verdict {
        IdentityVerdict::Accepted {
            address,
            name,
            privileged,
        } => {
            if world.bans.contains(&address) {
                world.kick(id, "banned");
                return;
            }
            if world.maintenance && !privileged {
                world.kick(id, "maintenance");
                return;
            }
            let Some(p) = world.participants.get_mut(&id) else {
                return;
            };
            p.identified = true;
            p.identity.address = Some(address);
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                p.identity.name = name;
            }
            p.status.set(Status::Privileged, privileged);
            let name = p.identity.name.clone();
            tracing::info!(participant_id = id, %name, privileged, "Participant identified");
            world.send(id, ServerMessage::Identified { id, name });
        },
        IdentityVerdict::Rejected { reason } => {
            tracing::info!(participant_id = id, %reason, "Identity rejected");
            world.kick(id, "identity rejected");
        },
        IdentityVerdict::Banned => world.kick(id, "banned"),
        IdentityVerdict::Maintenance => world.kick(id, "maintenance"),
        IdentityVerdict::Unavailable => info(world, id, "realm not connected"),
    }
}

/// Dead or spectating: free to enter play.
fn out_of_play(p: &Participant) -> bool {
    p.is(Status::Dead) || p.is(Status::Spectating)
}

pub fn join(world: &mut World, id: ParticipantId) {
    let Some(p) = world.participants.get(&id) else {
        return;
    };
    if !p.identified {
        reject_input(world, id);
        info(world, id, "identify first");
        return;
    }
    if !out_of_play(p) || p.is(Status::Joining) {
        reject_input(world, id);
        return;
    }
    let privileged = p.is_privileged();
    let Some(address) = p.identity.address.clone() else {
        return;
    };
    if world.bans.contains(&address) {
        world.kick(id, "banned");
        return;
    }
    if world
        .recent_eliminations
        .get(&address)
        .is_some_and(|&at| world.now < at + world.rules.rejoin_cooldown_ms)
    {
        tracing::info!(participant_id = id, "Rejoin attempted within cooldown");
        world.kick(id, "rejoined too soon");
        return;
    }
    if world.maintenance && !privileged {
        info(world, id, "maintenance");
        return;
    }
    if let Some(p) = world.participants.get_mut(&id) {
        p.status.insert(Status::Joining);
    }
    world.request(AuthorityRequest::CheckJoin { id, address });
}

/// Finish or abandon a join once the ban check comes back.
pub fn join_verdict(world: &mut World, id: ParticipantId, verdict: JoinVerdict) {
    let pending = world
        .participants
        .get(&id)
        .is_some_and(|p| p.is(Status::Joining) && out_of_play(p) && !p.is(Status::Disconnected));
    if !pending {
        return;
    }
    match verdict {
        JoinVerdict::Allowed => complete_join(world, id),
        JoinVerdict::Banned => {
            if let Some(address) = world
                .participants
                .get(&id)
                .and_then(|p| p.identity.address.clone())
            {
                world.bans.insert(address);
            }
            world.kick(id, "banned");
        },
        JoinVerdict::Unavailable => {
            if let Some(p) = world.participants.get_mut(&id) {
                p.status.remove(Status::Joining);
            }
            info(world, id, "realm not connected");
        },
    }
}

fn complete_join(world: &mut World, id: ParticipantId) {
    let now = world.now;
    let spawn = world.clear_point(world.rules.avatar_half_size);
    let (start_level, start_energy) = (world.rules.start_level, world.rules.start_energy);
    let Some(p) = world.participants.get_mut(&id) else {
        return;
    };
    p.status.remove(Status::Dead);
    p.status.remove(Status::Spectating);
    p.status.remove(Status::Invincible);
    p.invincible_until = None;
    p.level = start_level;
    p.energy = start_energy;
    p.position = spawn;
    p.target = spawn;
    p.client_position = spawn;
    p.client_target = spawn;
    p.joined_at = Some(now);
    p.last_input = now;
    p.last_update = now;
    let event = Event::Joined {
        id,
        name: p.identity.name.clone(),
        level: p.level,
        position: spawn,
    };
    let (level, energy) = (p.level, p.energy);

    round::enlist(world, id);
    tracing::info!(participant_id = id, round = world.round.id, "Participant joined");
    world.emit(event);
    let snapshot = snapshot(world, id);
    world.send(
        id,
        ServerMessage::Joined {
            id,
            level,
            energy,
            position: spawn,
            snapshot: Box::new(snapshot),
        },
    );
}

/// World view for a joining participant, excluding themselves.
pub fn snapshot(world: &World, exclude: ParticipantId) -> Snapshot {
    let reward = match &world.reward {
        RewardSlot::Active(reward) => Some(reward.clone()),
        _ => None,
    };
    Snapshot {
        round: world.round.id,
        mode: world.rules.mode.clone(),
        guide: world.rules.guide.clone(),
        ends_at: world.round_ends_at,
        remaining_ms: world.round_remaining(),
        world_bounds: world.rules.world_bounds,
        participants: world
            .participants
            .values()
            .filter(|p| p.id != exclude && p.is_live())
            .map(|p| ParticipantView {
                id: p.id,
                name: p.identity.name.clone(),
                level: p.level,
                position: p.position,
                target: p.target,
                score: p.stats.score,
            })
            .collect(),
        pickups: world.pickups.clone(),
        orbs: world.orbs.clone(),
        reward,
    }
}

pub fn update_self(
    world: &mut World,
    id: ParticipantId,
    position: Vec2,
    target: Vec2,
    sent_at: Option<Millis>,
) {
    let now = world.now;
    let rules = &world.rules;
    let Some(p) = world.participants.get(&id) else {
        return;
    };
    if !p.is_live() && !p.is(Status::Spectating) {
        reject_input(world, id);
        return;
    }
    if !position.is_finite() || !target.is_finite() {
        reject_input(world, id);
        return;
    }

    if !p.is_privileged() {
        let bounds = rules.world_bounds.inflate(rules.avatar_half_size);
        if !bounds.contains(position) {
            reject_input(world, id);
            return;
        }
        // measured from the authoritative position so one rejected report
        // does not anchor every later one
        let jump = p.position.distance(position);
        if jump > rules.max_jump_distance * rules.jump_kick_factor {
            tracing::warn!(participant_id = id, jump, "Implausible position jump");
            world.kick(id, "implausible movement");
            return;
        }
        if jump > rules.max_jump_distance {
            if let Some(p) = world.participants.get_mut(&id) {
                p.diagnostics.speed_anomaly += 1;
                p.diagnostics.rejected_inputs += 1;
            }
            return;
        }
    }

    let Some(p) = world.participants.get_mut(&id) else {
        return;
    };
    p.client_position = position;
    p.client_target = target;
    p.target = target;
    p.last_input = now;
    p.status.remove(Status::Joining);
    if let Some(sent_at) = sent_at {
        p.last_latency = now.saturating_sub(sent_at);
    }
}

pub fn spectate(world: &mut World, id: ParticipantId) {
    let rules = &world.rules;
    let (cap, speed, zoom) = (rules.energy_cap, rules.spectator_speed, rules.spectator_zoom);
    let Some(p) = world.participants.get_mut(&id) else {
        return;
    };
    if p.is(Status::Spectating) {
        return;
    }
    p.status.insert(Status::Spectating);
    p.status.insert(Status::Invincible);
    p.status.remove(Status::Dead);
    p.status.remove(Status::Joining);
    p.energy = cap;
    p.target = p.position;
    tracing::info!(participant_id = id, "Participant spectating");
    world.emit(Event::Spectating { id });
    world.send(id, ServerMessage::Loadout { speed, zoom });
}

/// Connection closed. The participant leaves play now and is removed from the
/// registry after the grace period.
pub fn disconnect(world: &mut World, id: ParticipantId) {
    let Some(p) = world.participants.get_mut(&id) else {
        return;
    };
    if p.is(Status::Disconnected) {
        return;
    }
    p.status.insert(Status::Disconnected);
    round::snapshot_roster(world, Some(id));
    tracing::info!(participant_id = id, "Participant disconnected");
    world.emit(Event::Left { id });
    let at = world.now + world.settings.disconnect_grace_ms;
    world.schedule(at, Action::Remove { id });
}

/// Drop a participant from the registry. The round roster keeps their record.
pub fn remove(world: &mut World, id: ParticipantId) {
    if world.participants.remove(&id).is_some() {
        tracing::debug!(participant_id = id, "Participant removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{identified, test_world};

    fn verdict(address: &str) -> IdentityVerdict {
        IdentityVerdict::Accepted {
            address: address.to_string(),
            name: Some("ada".to_string()),
            privileged: false,
        }
    }

    #[test]
    fn connect_sends_welcome_and_starts_dead() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        let p = &world.participants[&id];
        assert!(p.is(Status::Dead));
        assert!(!p.identified);
        assert!(
            world
                .outbox
                .iter()
                .any(|(to, m)| *to == id && matches!(m, ServerMessage::Welcome { .. }))
        );
    }

    #[test]
    fn identify_goes_through_authority() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        identify(
            &mut world,
            id,
            "addr".to_string(),
            "sig".to_string(),
            None,
            PROTOCOL_VERSION,
        );
        assert!(matches!(
            world.requests.as_slice(),
            [AuthorityRequest::Verify { id: rid, .. }] if *rid == id
        ));
        identify_verdict(&mut world, id, verdict("addr"));
        let p = &world.participants[&id];
        assert!(p.identified);
        assert_eq!(p.identity.name, "ada");
        assert_eq!(p.identity.address.as_deref(), Some("addr"));
    }

    #[test]
    fn version_mismatch_is_kicked() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        identify(&mut world, id, "a".to_string(), "s".to_string(), None, 999);
        assert_eq!(world.kicks.len(), 1);
        assert!(world.requests.is_empty());
    }

    #[test]
    fn late_verdict_after_disconnect_is_ignored() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        disconnect(&mut world, id);
        identify_verdict(&mut world, id, verdict("addr"));
        assert!(!world.participants[&id].identified);
    }

    #[test]
    fn maintenance_refuses_non_privileged() {
        let mut world = test_world();
        world.maintenance = true;
        let id = connect(&mut world, "fp".to_string());
        identify_verdict(&mut world, id, verdict("addr"));
        assert_eq!(world.kicks, vec![(id, "maintenance".to_string())]);
    }

    #[test]
    fn join_requires_identity_then_ban_check() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        join(&mut world, id);
        assert!(world.requests.is_empty());
        assert_eq!(world.participants[&id].diagnostics.rejected_inputs, 1);

        identify_verdict(&mut world, id, verdict("addr"));
        join(&mut world, id);
        assert!(world.participants[&id].is(Status::Joining));
        assert!(
            world
                .requests
                .iter()
                .any(|r| matches!(r, AuthorityRequest::CheckJoin { .. }))
        );

        join_verdict(&mut world, id, JoinVerdict::Allowed);
        let p = &world.participants[&id];
        assert!(p.is_live());
        assert_eq!(p.level, world.rules.start_level);
        assert!(world.round.roster.iter().any(|e| e.id == id));
        assert!(
            world
                .outbox
                .iter()
                .any(|(to, m)| *to == id && matches!(m, ServerMessage::Joined { .. }))
        );
    }

    #[test]
    fn banned_join_is_remembered() {
        let mut world = test_world();
        let id = identified(&mut world, "addr");
        join(&mut world, id);
        join_verdict(&mut world, id, JoinVerdict::Banned);
        assert!(world.bans.contains("addr"));
        assert!(!world.participants[&id].is_live());

        let again = identified(&mut world, "addr");
        join(&mut world, again);
        assert!(world.kicks.iter().any(|(k, _)| *k == again));
    }

    #[test]
    fn rejoin_too_soon_is_kicked() {
        let mut world = test_world();
        let id = identified(&mut world, "addr");
        world.recent_eliminations.insert("addr".to_string(), world.now);
        join(&mut world, id);
        assert_eq!(world.kicks, vec![(id, "rejoined too soon".to_string())]);

        world.kicks.clear();
        let id = identified(&mut world, "addr");
        world.now += world.rules.rejoin_cooldown_ms;
        join(&mut world, id);
        assert!(world.kicks.is_empty());
    }

    #[test]
    fn update_self_plausibility() {
        let mut world = test_world();
        let id = identified(&mut world, "addr");
        join(&mut world, id);
        join_verdict(&mut world, id, JoinVerdict::Allowed);
        let start = world.participants[&id].position;

        let near = start + Vec2::new(10.0, 0.0);
        let now = world.now;
        update_self(&mut world, id, near, Vec2::new(500.0, 0.0), Some(now));
        let p = &world.participants[&id];
        assert_eq!(p.client_position, near);
        assert_eq!(p.target, Vec2::new(500.0, 0.0));
        assert!(!p.is(Status::Joining));

        let jump = start + Vec2::new(world.rules.max_jump_distance + 1.0, 0.0);
        update_self(&mut world, id, jump, Vec2::ZERO, None);
        let p = &world.participants[&id];
        assert_eq!(p.client_position, near);
        assert_eq!(p.diagnostics.speed_anomaly, 1);

        let outside = Vec2::new(world.rules.world_bounds.max.x * 10.0, 0.0);
        update_self(&mut world, id, outside, Vec2::ZERO, None);
        assert_eq!(world.participants[&id].client_position, near);
        assert!(world.kicks.is_empty());

        // jump back across the origin so the report stays inside the bounds
        let reach = world.rules.max_jump_distance * world.rules.jump_kick_factor + 1.0;
        let teleport = Vec2::new(start.x - reach * start.x.signum(), start.y);
        update_self(&mut world, id, teleport, Vec2::ZERO, None);
        assert_eq!(world.kicks.len(), 1);
    }

    #[test]
    fn rejected_report_does_not_anchor_later_ones() {
        let mut world = test_world();
        let id = identified(&mut world, "addr");
        join(&mut world, id);
        join_verdict(&mut world, id, JoinVerdict::Allowed);
        let start = world.participants[&id].position;
        let step = Vec2::new(-start.x.signum(), 0.0);

        let spike = start + step * (world.rules.max_jump_distance + 10.0);
        update_self(&mut world, id, spike, spike, None);
        assert_eq!(world.participants[&id].diagnostics.speed_anomaly, 1);

        // the server catches up with the client
        world.participants.get_mut(&id).unwrap().position = spike;
        let next = spike + step;
        update_self(&mut world, id, next, next, None);
        let p = &world.participants[&id];
        assert_eq!(p.client_position, next);
        assert_eq!(p.diagnostics.speed_anomaly, 1);
        assert!(world.kicks.is_empty());
    }

    #[test]
    fn spectate_loadout() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        spectate(&mut world, id);
        let p = &world.participants[&id];
        assert!(p.is(Status::Spectating));
        assert!(p.is(Status::Invincible));
        assert_eq!(p.energy, world.rules.energy_cap);
        assert!(
            world
                .outbox
                .iter()
                .any(|(_, m)| matches!(m, ServerMessage::Loadout { .. }))
        );
    }

    #[test]
    fn spectator_can_join_play() {
        let mut world = test_world();
        let id = identified(&mut world, "addr");
        spectate(&mut world, id);
        join(&mut world, id);
        assert!(world.participants[&id].is(Status::Joining));
        join_verdict(&mut world, id, JoinVerdict::Allowed);
        let p = &world.participants[&id];
        assert!(p.is_live());
        assert!(!p.is(Status::Spectating));
        assert!(!p.is(Status::Invincible));
        assert_eq!(p.level, world.rules.start_level);
    }

    #[test]
    fn disconnect_schedules_delayed_removal() {
        let mut world = test_world();
        let id = connect(&mut world, "fp".to_string());
        disconnect(&mut world, id);
        disconnect(&mut world, id);
        let removals = world
            .scheduled
            .iter()
            .filter(|s| s.action == Action::Remove { id })
            .count();
        assert_eq!(removals, 1);
        assert!(world.participants.contains_key(&id));
        remove(&mut world, id);
        assert!(!world.participants.contains_key(&id));
    }
}
