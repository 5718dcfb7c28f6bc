use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::authority::{AuthorityReply, AuthorityRequest};
use crate::entities::{DropHistory, EntityId, Orb, Pickup, RewardSlot};
use crate::error::RulesError;
use crate::events::{Event, EventBatch};
use crate::geometry::{MapGeometry, Rect, Vec2};
use crate::participant::{Participant, ParticipantId};
use crate::protocol::ServerMessage;
use crate::round::{self, Round, RoundRecord};
use crate::rules::{Layer, RuleConfig, RuleSet};
use crate::time::Millis;
use crate::{economy, session};

/// Host-level settings that are not part of the per-round rules.
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub fast_tick_ms: u64,
    /// Minimum interval between audit samples of one participant's movement.
    pub audit_sample_ms: u64,
    /// Delay between a disconnect and removal from the registry.
    pub disconnect_grace_ms: u64,
    /// Delay between an elimination broadcast and the defender's disconnect.
    pub eliminated_disconnect_ms: u64,
    /// Exit after this many rounds; restart is the supervisor's job.
    pub reboot_after_rounds: Option<u32>,
    pub spawn_attempts: u32,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            fast_tick_ms: 50,
            audit_sample_ms: 1_000,
            disconnect_grace_ms: 2_000,
            eliminated_disconnect_ms: 1_500,
            reboot_after_rounds: None,
            spawn_attempts: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Active,
    Paused,
    Settling,
}

/// Deferred work fired by the fast tick once `at` has passed.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Kick { id: ParticipantId, reason: String },
    Remove { id: ParticipantId },
}

#[derive(Debug, Clone)]
pub struct Scheduled {
    pub at: Millis,
    pub action: Action,
}

/// Everything the host has to deliver after a world operation.
#[derive(Debug, Default)]
pub struct Outbound {
    pub batch: Option<String>,
    pub direct: Vec<(ParticipantId, ServerMessage)>,
    pub kicks: Vec<(ParticipantId, String)>,
    pub requests: Vec<AuthorityRequest>,
}

/// The whole simulation state. One owner mutates it; nothing else holds a reference.
pub struct World {
    pub settings: WorldSettings,
    pub map: Arc<MapGeometry>,
    pub ruleset: RuleSet,
    /// Snapshot of the layered rules for the current round.
    pub rules: RuleConfig,
    pub preset: usize,
    pub forced_preset: Option<usize>,
    pub overrides: Layer,
    pub participants: BTreeMap<ParticipantId, Participant>,
    /// In spawn order; the newest pickup is last.
    pub pickups: Vec<Pickup>,
    pub orbs: Vec<Orb>,
    pub reward: RewardSlot,
    pub drops: DropHistory,
    pub round: Round,
    pub phase: Phase,
    /// Round deadline on the world clock; `None` while paused or settling.
    pub round_ends_at: Option<Millis>,
    pub paused_remaining: Option<u64>,
    pub rounds_played: u32,
    pub reboot_after: Option<u32>,
    pub shutdown_requested: bool,
    pub maintenance: bool,
    pub authority_online: bool,
    pub bans: HashSet<String>,
    /// Address -> time of the last elimination, for the rejoin cooldown.
    pub recent_eliminations: HashMap<String, Millis>,
    pub persist_queue: VecDeque<RoundRecord>,
    pub batch: EventBatch,
    pub outbox: Vec<(ParticipantId, ServerMessage)>,
    pub kicks: Vec<(ParticipantId, String)>,
    pub requests: Vec<AuthorityRequest>,
    pub scheduled: Vec<Scheduled>,
    pub rng: StdRng,
    pub now: Millis,
    pub last_fast_tick: Millis,
    next_participant_id: ParticipantId,
    next_entity_id: EntityId,
}

impl World {
    /// Build a world and start its first round at `now`.
    pub fn new(
        settings: WorldSettings,
        map: Arc<MapGeometry>,
        ruleset: RuleSet,
        seed: u64,
        now: Millis,
    ) -> Result<Self, RulesError> {
        let mut rng = StdRng::seed_from_u64(seed);
        // no current preset yet, so every selectable preset is a candidate
        let preset = ruleset.choose_next(usize::MAX, &mut rng)?;
        let rules = ruleset.snapshot(preset, &Layer::new())?;
        let reboot_after = settings.reboot_after_rounds;
        let round = Round::new(
            1,
            &ruleset.presets[preset].name,
            &rules.mode,
            now,
            settings.audit_sample_ms,
        );

        let mut world = Self {
            settings,
            map,
            ruleset,
            rules,
            preset,
            forced_preset: None,
            overrides: Layer::new(),
            participants: BTreeMap::new(),
            pickups: Vec::new(),
            orbs: Vec::new(),
            reward: RewardSlot::Idle,
            drops: DropHistory::default(),
            round,
            phase: Phase::Active,
            round_ends_at: None,
            paused_remaining: None,
            rounds_played: 0,
            reboot_after,
            shutdown_requested: false,
            maintenance: false,
            authority_online: true,
            bans: HashSet::new(),
            recent_eliminations: HashMap::new(),
            persist_queue: VecDeque::new(),
            batch: EventBatch::default(),
            outbox: Vec::new(),
            kicks: Vec::new(),
            requests: Vec::new(),
            scheduled: Vec::new(),
            rng,
            now,
            last_fast_tick: now,
            next_participant_id: 1,
            next_entity_id: 1,
        };
        world.round_ends_at = Some(now + world.rules.round_length_ms);
        economy::sync_pickups(&mut world);
        tracing::info!(
            preset = %world.round.preset,
            mode = %world.rules.mode,
            "World started"
        );
        Ok(world)
    }

    /// Queue an event for the next batch and record it in the round log.
    pub fn emit(&mut self, event: Event) {
        self.round.log.record(self.now, &event);
        self.batch.push(event);
    }

    /// Queue a direct message for one participant.
    pub fn send(&mut self, id: ParticipantId, msg: ServerMessage) {
        self.outbox.push((id, msg));
    }

    /// Ask the host to close a participant's connection.
    pub fn kick(&mut self, id: ParticipantId, reason: &str) {
        if self.kicks.iter().any(|(k, _)| *k == id) {
            return;
        }
        tracing::info!(participant_id = id, reason, "Kicking participant");
        self.send(
            id,
            ServerMessage::Kicked {
                reason: reason.to_string(),
            },
        );
        self.kicks.push((id, reason.to_string()));
    }

    pub fn request(&mut self, req: AuthorityRequest) {
        self.requests.push(req);
    }

    pub fn schedule(&mut self, at: Millis, action: Action) {
        self.scheduled.push(Scheduled { at, action });
    }

    pub fn next_entity_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }

    pub fn next_participant_id(&mut self) -> ParticipantId {
        let id = self.next_participant_id;
        self.next_participant_id += 1;
        id
    }

    pub fn nonce(&mut self) -> String {
        format!("{:016x}", self.rng.random::<u64>())
    }

    /// Participants in play: joined, not eliminated, not spectating.
    pub fn live_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_live()).count()
    }

    pub fn is_paused(&self) -> bool {
        self.phase == Phase::Paused
    }

    /// Milliseconds until the round deadline.
    pub fn round_remaining(&self) -> u64 {
        match (self.round_ends_at, self.paused_remaining) {
            (Some(end), _) => end.saturating_sub(self.now),
            (None, Some(remaining)) => remaining,
            (None, None) => 0,
        }
    }

    pub fn random_point(&mut self, area: Rect) -> Vec2 {
        let x = if area.max.x > area.min.x {
            self.rng.random_range(area.min.x..area.max.x)
        } else {
            area.min.x
        };
        let y = if area.max.y > area.min.y {
            self.rng.random_range(area.min.y..area.max.y)
        } else {
            area.min.y
        };
        Vec2::new(x, y)
    }

    /// Sample a point in the spawn area whose `half`-sized box is clear of the
    /// map. Falls back to the area's centre if no clear point is found.
    pub fn clear_point(&mut self, half: f32) -> Vec2 {
        let area = self.rules.spawn_area;
        for _ in 0..self.settings.spawn_attempts {
            let p = self.random_point(area);
            if !self.map.overlaps_any(&Rect::around(p, half)) {
                return p;
            }
        }
        tracing::warn!("No clear spawn point found, using spawn area centre");
        Vec2::new(
            (area.min.x + area.max.x) / 2.0,
            (area.min.y + area.max.y) / 2.0,
        )
    }

    /// Track whether the authority is reachable, telling participants when it
    /// goes away or comes back.
    pub fn note_authority(&mut self, reached: bool) {
        if reached == self.authority_online {
            return;
        }
        self.authority_online = reached;
        if reached {
            tracing::info!("Authority reachable again");
            self.emit(Event::Info {
                message: "realm connected".to_string(),
            });
            round::retry_persistence(self);
        } else {
            tracing::warn!("Authority unreachable, eliminations paused");
            self.emit(Event::Info {
                message: "realm not connected".to_string(),
            });
        }
    }

    /// Feed an authority result back into the world.
    pub fn apply_authority(&mut self, reply: AuthorityReply) {
        let reached = reply.reached();
        let was_online = self.authority_online;
        self.note_authority(reached);
        if reached && was_online {
            round::retry_persistence(self);
        }
        match reply {
            AuthorityReply::Verified { id, verdict } => {
                session::identify_verdict(self, id, verdict)
            },
            AuthorityReply::JoinChecked { id, verdict } => session::join_verdict(self, id, verdict),
            AuthorityReply::Drawn { round_id, draw, .. } => {
                economy::accept_draw(self, round_id, draw);
            },
            AuthorityReply::Persisted { record_id } => {
                tracing::info!(%record_id, "Round persisted");
            },
            AuthorityReply::PersistFailed(record) => round::persist_failed(self, *record),
            AuthorityReply::Settled {
                record_id, payouts, ..
            } => round::settled(self, record_id, payouts),
        }
    }

    /// Leave the event batch queued for the next tick and drain the rest.
    pub fn take_unicast(&mut self) -> Outbound {
        Outbound {
            batch: None,
            direct: std::mem::take(&mut self.outbox),
            kicks: std::mem::take(&mut self.kicks),
            requests: std::mem::take(&mut self.requests),
        }
    }

    /// Drain everything produced since the last call.
    pub fn take_outbound(&mut self) -> Outbound {
        Outbound {
            batch: self.batch.flush(),
            direct: std::mem::take(&mut self.outbox),
            kicks: std::mem::take(&mut self.kicks),
            requests: std::mem::take(&mut self.requests),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{join, test_world};

    #[test]
    fn new_world_seeds_pickups_and_round() {
        let world = test_world();
        assert_eq!(world.round.id, 1);
        assert_eq!(world.phase, Phase::Active);
        assert_eq!(world.pickups.len(), world.rules.base_pickups as usize);
        assert_eq!(world.round_remaining(), world.rules.round_length_ms);
    }

    #[test]
    fn take_outbound_drains_everything() {
        let mut world = test_world();
        let id = join(&mut world, Vec2::ZERO);
        world.emit(Event::Info {
            message: "hi".to_string(),
        });
        world.kick(id, "test");
        world.kick(id, "test");
        let out = world.take_outbound();
        assert!(out.batch.is_some());
        assert_eq!(out.kicks.len(), 1);
        assert!(
            out.direct
                .iter()
                .any(|(to, m)| *to == id && matches!(m, ServerMessage::Kicked { .. }))
        );
        let again = world.take_outbound();
        assert!(again.batch.is_none());
        assert!(again.kicks.is_empty());
        assert!(again.direct.is_empty());
    }

    #[test]
    fn take_unicast_keeps_the_batch() {
        let mut world = test_world();
        let id = join(&mut world, Vec2::ZERO);
        world.emit(Event::Info {
            message: "hi".to_string(),
        });
        world.kick(id, "test");
        let out = world.take_unicast();
        assert!(out.batch.is_none());
        assert_eq!(out.kicks.len(), 1);
        assert!(!world.batch.is_empty());
        assert!(world.take_outbound().batch.is_some());
    }

    #[test]
    fn authority_outage_is_announced_once() {
        let mut world = test_world();
        world.note_authority(false);
        world.note_authority(false);
        let infos = world
            .batch
            .pending()
            .iter()
            .filter(|e| matches!(e, Event::Info { .. }))
            .count();
        assert_eq!(infos, 1);
        assert!(!world.authority_online);
    }

    #[test]
    fn clear_point_avoids_colliders() {
        let mut world = test_world();
        for _ in 0..50 {
            let p = world.clear_point(20.0);
            assert!(!world.map.overlaps_any(&Rect::around(p, 20.0)));
            assert!(world.rules.spawn_area.contains(p));
        }
    }
}
