use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authority::{AuthorityRequest, Payout};
use crate::economy;
use crate::entities::{RewardDraw, RewardSlot};
use crate::events::{AuditEntry, AuditLog, Event};
use crate::participant::{Diagnostics, ParticipantId, RoundStats, Status};
use crate::protocol::ServerMessage;
use crate::time::Millis;
use crate::world::{Phase, World};

/// Records kept for retry while the authority is unreachable.
const MAX_PERSIST_QUEUE: usize = 64;

/// A participant who joined during the round. Kept after they leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: ParticipantId,
    pub name: String,
    pub address: Option<String>,
    pub fingerprint: String,
    pub stats: RoundStats,
    pub diagnostics: Diagnostics,
    pub left: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub participant: ParticipantId,
    pub address: Option<String>,
    pub draw: RewardDraw,
    pub at: Millis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub id: ParticipantId,
    pub name: String,
    pub address: Option<String>,
    pub score: u64,
}

/// The active round. Replaced wholesale at settle.
#[derive(Debug, Clone)]
pub struct Round {
    pub id: u64,
    /// Idempotency key for persistence retries.
    pub record_id: Uuid,
    pub preset: String,
    pub mode: String,
    pub started: Millis,
    pub ended: Option<Millis>,
    pub roster: Vec<RosterEntry>,
    pub claims: Vec<Claim>,
    pub log: AuditLog,
}

impl Round {
    pub fn new(id: u64, preset: &str, mode: &str, started: Millis, audit_sample_ms: u64) -> Self {
        Self {
            id,
            record_id: Uuid::new_v4(),
            preset: preset.to_string(),
            mode: mode.to_string(),
            started,
            ended: None,
            roster: Vec::new(),
            claims: Vec::new(),
            log: AuditLog::new(audit_sample_ms),
        }
    }
}

/// What gets persisted for a finished round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub record_id: Uuid,
    pub round: u64,
    pub preset: String,
    pub mode: String,
    pub started: Millis,
    pub ended: Millis,
    pub standings: Vec<Standing>,
    pub roster: Vec<RosterEntry>,
    pub claims: Vec<Claim>,
    pub events: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub round: u64,
    pub standings: Vec<Standing>,
    pub next_preset: String,
    pub next_mode: String,
}

/// Add a participant to the round roster on join.
pub fn enlist(world: &mut World, id: ParticipantId) {
    let Some(p) = world.participants.get(&id) else {
        return;
    };
    if let Some(entry) = world.round.roster.iter_mut().find(|e| e.id == id) {
        entry.left = false;
        return;
    }
    world.round.roster.push(RosterEntry {
        id,
        name: p.identity.name.clone(),
        address: p.identity.address.clone(),
        fingerprint: p.identity.fingerprint.clone(),
        stats: p.stats,
        diagnostics: p.diagnostics,
        left: false,
    });
}

/// Copy current stats into the roster so they outlive the participant.
pub fn snapshot_roster(world: &mut World, leaving: Option<ParticipantId>) {
    for entry in &mut world.round.roster {
        if let Some(p) = world.participants.get(&entry.id) {
            entry.stats = p.stats;
            entry.diagnostics = p.diagnostics;
            entry.name.clone_from(&p.identity.name);
        }
        if leaving == Some(entry.id) {
            entry.left = true;
        }
    }
}

/// Top participants by score among those updated within the trailing window.
/// Ties keep registry order.
pub fn standings(world: &World) -> Vec<Standing> {
    let window = world.rules.standings_window_ms;
    let mut ranked: Vec<Standing> = world
        .participants
        .values()
        .filter(|p| !p.is(Status::Spectating) && !p.is(Status::Disconnected))
        .filter(|p| p.joined_at.is_some())
        .filter(|p| world.now.saturating_sub(p.last_update) <= window)
        .map(|p| Standing {
            id: p.id,
            name: p.identity.name.clone(),
            address: p.identity.address.clone(),
            score: p.stats.score,
        })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked.truncate(world.rules.standings_size);
    ranked
}

/// Whether the round deadline has passed.
pub fn is_due(world: &World) -> bool {
    world.phase == Phase::Active && world.round_ends_at.is_some_and(|t| world.now >= t)
}

/// Pause the round clock. Returns false if the round was not running.
pub fn pause(world: &mut World) -> bool {
    if world.phase != Phase::Active {
        return false;
    }
    world.paused_remaining = Some(world.round_remaining());
    world.round_ends_at = None;
    world.phase = Phase::Paused;
    tracing::info!(round = world.round.id, "Round paused");
    world.emit(Event::Paused);
    true
}

/// Resume a paused round with the time it had left.
pub fn resume(world: &mut World) -> bool {
    if world.phase != Phase::Paused {
        return false;
    }
    let remaining = world.paused_remaining.take().unwrap_or_default();
    let ends_at = world.now + remaining;
    world.round_ends_at = Some(ends_at);
    world.phase = Phase::Active;
    tracing::info!(round = world.round.id, remaining, "Round resumed");
    world.emit(Event::Resumed { ends_at });
    true
}

/// End the current round and start the next one.
pub fn settle(world: &mut World) -> RoundSummary {
    world.phase = Phase::Settling;
    world.round_ends_at = None;
    let now = world.now;
    let standings = standings(world);
    snapshot_roster(world, None);

    let round_id = world.round.id;
    let record = RoundRecord {
        record_id: world.round.record_id,
        round: round_id,
        preset: world.round.preset.clone(),
        mode: world.round.mode.clone(),
        started: world.round.started,
        ended: now,
        standings: standings.clone(),
        roster: std::mem::take(&mut world.round.roster),
        claims: std::mem::take(&mut world.round.claims),
        events: std::mem::take(&mut world.round.log.entries),
    };
    world.round.ended = Some(now);
    tracing::info!(
        round = round_id,
        record_id = %record.record_id,
        participants = record.roster.len(),
        "Round settled"
    );
    if world.rules.settle_rewards && !standings.is_empty() {
        world.request(AuthorityRequest::Settle {
            record_id: record.record_id,
            standings: standings.clone(),
        });
    }
    world.request(AuthorityRequest::Persist(Box::new(record)));
    world.emit(Event::RoundEnded {
        round: round_id,
        standings: standings.iter().map(|s| (s.id, s.score)).collect(),
    });

    select_next_preset(world);
    reset_round_state(world, round_id + 1);

    world.rounds_played += 1;
    if world.reboot_after.is_some_and(|n| world.rounds_played >= n) {
        tracing::warn!(rounds = world.rounds_played, "Reboot threshold reached");
        world.emit(Event::Info {
            message: "server restarting".to_string(),
        });
        world.shutdown_requested = true;
    }

    RoundSummary {
        round: round_id,
        standings,
        next_preset: world.round.preset.clone(),
        next_mode: world.rules.mode.clone(),
    }
}

fn select_next_preset(world: &mut World) {
    let next = match world.forced_preset.take() {
        Some(forced) => forced,
        None => match world.ruleset.choose_next(world.preset, &mut world.rng) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(error = %e, "Preset selection failed, keeping current preset");
                world.preset
            },
        },
    };
    match world.ruleset.snapshot(next, &world.overrides) {
        Ok(rules) => {
            world.preset = next;
            world.rules = rules;
        },
        Err(e) => {
            tracing::error!(
                error = %e,
                preset = next,
                "Rule snapshot failed, keeping current rules"
            );
        },
    }
}

fn reset_round_state(world: &mut World, next_id: u64) {
    let now = world.now;
    let preset = world
        .ruleset
        .presets
        .get(world.preset)
        .map(|p| p.name.clone())
        .unwrap_or_default();
    world.round = Round::new(
        next_id,
        &preset,
        &world.rules.mode,
        now,
        world.settings.audit_sample_ms,
    );

    let (start_level, start_energy) = (world.rules.start_level, world.rules.start_energy);
    for p in world.participants.values_mut() {
        p.reset_round(start_level, start_energy);
        p.last_update = now;
    }
    let live: Vec<ParticipantId> = world
        .participants
        .values()
        .filter(|p| p.is_live())
        .map(|p| p.id)
        .collect();
    for id in live {
        enlist(world, id);
    }

    world.orbs.clear();
    if let RewardSlot::Active(reward) = std::mem::take(&mut world.reward) {
        world.emit(Event::RewardExpired { id: reward.id });
    }
    world.pickups.clear();

    let ends_at = now + world.rules.round_length_ms;
    world.round_ends_at = Some(ends_at);
    world.paused_remaining = None;
    world.phase = Phase::Active;
    world.emit(Event::RoundStarted {
        round: next_id,
        mode: world.rules.mode.clone(),
        ends_at,
    });
    world.emit(Event::Info {
        message: world.rules.guide.clone(),
    });
    economy::sync_pickups(world);
}

/// Send the oldest queued record again. Called after a successful authority call.
pub fn retry_persistence(world: &mut World) {
    if !world.authority_online {
        return;
    }
    if let Some(record) = world.persist_queue.pop_front() {
        tracing::info!(record_id = %record.record_id, "Retrying round persistence");
        world.request(AuthorityRequest::Persist(Box::new(record)));
    }
}

pub fn persist_failed(world: &mut World, record: RoundRecord) {
    tracing::warn!(record_id = %record.record_id, "Round persistence failed, queued for retry");
    if world
        .persist_queue
        .iter()
        .any(|r| r.record_id == record.record_id)
    {
        return;
    }
    if world.persist_queue.len() >= MAX_PERSIST_QUEUE
        && let Some(dropped) = world.persist_queue.pop_front()
    {
        tracing::error!(record_id = %dropped.record_id, "Persistence queue full, dropping record");
    }
    world.persist_queue.push_back(record);
}

pub fn settled(world: &mut World, record_id: Uuid, payouts: Vec<Payout>) {
    tracing::info!(%record_id, payouts = payouts.len(), "Round rewards settled");
    for payout in payouts {
        let recipient = world
            .participants
            .values()
            .find(|p| p.identity.address.as_deref() == Some(payout.address.as_str()))
            .map(|p| p.id);
        if let Some(id) = recipient {
            world.send(
                id,
                ServerMessage::Info {
                    message: format!("You earned {} {}", payout.amount, payout.currency),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthorityReply;
    use crate::geometry::Vec2;
    use crate::test_helpers::{join, test_world};

    fn scored(world: &mut World, score: u64) -> ParticipantId {
        let id = join(world, Vec2::ZERO);
        let p = world.participants.get_mut(&id).unwrap();
        p.stats.score = score;
        p.level = 3;
        id
    }

    #[test]
    fn standings_sorted_descending_within_window() {
        let mut world = test_world();
        let c = scored(&mut world, 10);
        let a = scored(&mut world, 50);
        let b = scored(&mut world, 30);
        let stale = scored(&mut world, 999);
        world.now += 10;
        world.participants.get_mut(&stale).unwrap().last_update =
            world.now - world.rules.standings_window_ms - 1;

        let ranked: Vec<_> = standings(&world).iter().map(|s| (s.id, s.score)).collect();
        assert_eq!(ranked, vec![(a, 50), (b, 30), (c, 10)]);
    }

    #[test]
    fn settle_resets_stats_and_level() {
        let mut world = test_world();
        for score in [50, 30, 10] {
            let id = scored(&mut world, score);
            enlist(&mut world, id);
        }
        world.now = world.round_ends_at.unwrap();
        assert!(is_due(&world));

        let summary = settle(&mut world);
        let scores: Vec<u64> = summary.standings.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![50, 30, 10]);
        for p in world.participants.values() {
            assert_eq!(p.stats.score, 0);
            assert_eq!(p.level, world.rules.start_level);
        }
        assert_eq!(world.round.id, 2);
        assert_eq!(world.round.roster.len(), 3);
        assert_eq!(world.phase, Phase::Active);
        assert!(!is_due(&world));
        let persisted = world.requests.iter().find_map(|r| match r {
            AuthorityRequest::Persist(record) => Some(record),
            _ => None,
        });
        assert_eq!(persisted.unwrap().roster.len(), 3);
    }

    #[test]
    fn settle_switches_mode() {
        let mut world = test_world();
        let before = world.rules.mode.clone();
        settle(&mut world);
        assert_ne!(world.rules.mode, before);
    }

    #[test]
    fn forced_preset_wins() {
        let mut world = test_world();
        world.forced_preset = Some(world.preset);
        let before = world.rules.mode.clone();
        settle(&mut world);
        assert_eq!(world.rules.mode, before);
        assert!(world.forced_preset.is_none());
    }

    #[test]
    fn settle_reseeds_pickups_and_drops_orbs() {
        let mut world = test_world();
        join(&mut world, Vec2::ZERO);
        world.pickups.clear();
        let now = world.now;
        economy::spawn_orb(&mut world, 10, Vec2::ZERO, now);
        settle(&mut world);
        assert!(world.orbs.is_empty());
        assert_eq!(
            world.pickups.len(),
            economy::target_pickups(&world.rules, world.live_count())
        );
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let mut world = test_world();
        world.now += 1_000;
        let remaining = world.round_remaining();
        assert!(pause(&mut world));
        assert!(!pause(&mut world));
        world.now += 60_000;
        assert_eq!(world.round_remaining(), remaining);
        assert!(!is_due(&world));
        assert!(resume(&mut world));
        assert!(!resume(&mut world));
        assert_eq!(world.round_ends_at, Some(world.now + remaining));
    }

    #[test]
    fn failed_persistence_is_retried_after_next_success() {
        let mut world = test_world();
        settle(&mut world);
        let record = world
            .take_outbound()
            .requests
            .into_iter()
            .find_map(|r| match r {
                AuthorityRequest::Persist(record) => Some(record),
                _ => None,
            })
            .unwrap();
        let record_id = record.record_id;

        world.apply_authority(AuthorityReply::PersistFailed(record.clone()));
        world.apply_authority(AuthorityReply::PersistFailed(record));
        assert_eq!(world.persist_queue.len(), 1);
        assert!(!world.authority_online);
        assert!(world.take_outbound().requests.is_empty());

        world.apply_authority(AuthorityReply::Drawn {
            round_id: 0,
            draw: None,
            reached: true,
        });
        assert!(world.persist_queue.is_empty());
        let retried = world.take_outbound().requests;
        assert!(
            retried
                .iter()
                .any(|r| matches!(r, AuthorityRequest::Persist(rec) if rec.record_id == record_id))
        );
    }

    #[test]
    fn reboot_flag_requests_shutdown() {
        let mut world = test_world();
        world.reboot_after = Some(2);
        settle(&mut world);
        assert!(!world.shutdown_requested);
        settle(&mut world);
        assert!(world.shutdown_requested);
    }

    #[test]
    fn payouts_reach_connected_winners() {
        let mut world = test_world();
        let id = join(&mut world, Vec2::ZERO);
        let address = world.participants[&id].identity.address.clone().unwrap();
        settled(
            &mut world,
            Uuid::new_v4(),
            vec![Payout {
                address,
                amount: 5,
                currency: "gems".to_string(),
            }],
        );
        assert!(
            world
                .outbox
                .iter()
                .any(|(to, m)| *to == id && matches!(m, ServerMessage::Info { .. }))
        );
    }
}
