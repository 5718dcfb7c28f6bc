use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geometry::{Rect, Vec2};
use crate::time::Millis;

/// Unique per-connection participant identifier, assigned in connection order.
pub type ParticipantId = u64;

/// Who is behind a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Verified address, set once the authority accepts the identify request.
    pub address: Option<String>,
    pub name: String,
    /// Network fingerprint of the connection, used by collusion and farming checks.
    pub fingerprint: String,
}

/// Mutable per-participant status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Dead = 0,
    Joining = 1,
    Spectating = 2,
    Disconnected = 3,
    Invincible = 4,
    Phased = 5,
    Privileged = 6,
}

/// Compact set of [`Status`] flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSet(u8);

impl StatusSet {
    pub fn with(status: Status) -> Self {
        let mut set = Self::default();
        set.insert(status);
        set
    }

    pub fn contains(self, status: Status) -> bool {
        self.0 & (1 << status as u8) != 0
    }

    pub fn insert(&mut self, status: Status) {
        self.0 |= 1 << status as u8;
    }

    pub fn remove(&mut self, status: Status) {
        self.0 &= !(1 << status as u8);
    }

    pub fn set(&mut self, status: Status, on: bool) {
        if on {
            self.insert(status);
        } else {
            self.remove(status);
        }
    }
}

/// Round-scoped score and counters. Reset in place at every round settle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStats {
    pub score: u64,
    pub kills: u32,
    pub deaths: u32,
    pub evolves: u32,
    pub pickups: u32,
    pub rewards: u32,
}

/// Anomaly counters. Data for operators, not a log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub out_of_bounds: u32,
    pub stuck: u32,
    pub collided: u32,
    pub speed_anomaly: u32,
    pub desync: u32,
    pub suspected_collusion: u32,
    pub farming: u32,
    pub rejected_inputs: u32,
}

/// Temporary speed override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedBurst {
    pub speed: f32,
    pub until: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub identity: Identity,
    pub identified: bool,
    /// Challenge the client signs in its identify request.
    pub nonce: String,
    /// Authoritative position and movement target.
    pub position: Vec2,
    pub target: Vec2,
    /// Last position/target reported by the client. Only used for plausibility checks.
    pub client_position: Vec2,
    pub client_target: Vec2,
    pub level: u32,
    pub energy: f32,
    pub stats: RoundStats,
    pub status: StatusSet,
    pub diagnostics: Diagnostics,
    /// Multiplier on effective speed (1.0 = unchanged).
    pub speed_modifier: f32,
    /// Percentage applied to decay when per-participant decay modifiers are enabled.
    pub decay_modifier: u32,
    pub burst: Option<SpeedBurst>,
    pub invincible_until: Option<Millis>,
    pub phased_until: Option<Millis>,
    pub joined_at: Option<Millis>,
    pub connected_at: Millis,
    pub last_input: Millis,
    /// Last time the participant's state changed in a way worth reporting.
    pub last_update: Millis,
    pub last_latency: Millis,
    /// Most recent combat touch: (attacker, time).
    pub last_touch: Option<(ParticipantId, Millis)>,
    /// Kills this participant has scored against each victim fingerprint this round.
    pub kill_ledger: HashMap<String, u32>,
    /// Position in the last movement broadcast.
    pub last_broadcast: Option<Vec2>,
}

impl Participant {
    /// A freshly connected participant: dead, unidentified, at `spawn`.
    pub fn new(
        id: ParticipantId,
        fingerprint: String,
        nonce: String,
        spawn: Vec2,
        now: Millis,
    ) -> Self {
        Self {
            id,
            identity: Identity {
                address: None,
                name: format!("guest-{id}"),
                fingerprint,
            },
            identified: false,
            nonce,
            position: spawn,
            target: spawn,
            client_position: spawn,
            client_target: spawn,
            level: 0,
            energy: 0.0,
            stats: RoundStats::default(),
            status: StatusSet::with(Status::Dead),
            diagnostics: Diagnostics::default(),
            speed_modifier: 1.0,
            decay_modifier: 100,
            burst: None,
            invincible_until: None,
            phased_until: None,
            joined_at: None,
            connected_at: now,
            last_input: now,
            last_update: now,
            last_latency: 0,
            last_touch: None,
            kill_ledger: HashMap::new(),
            last_broadcast: None,
        }
    }

    pub fn is(&self, status: Status) -> bool {
        self.status.contains(status)
    }

    /// In play: joined, not dead, not spectating, not disconnected.
    pub fn is_live(&self) -> bool {
        !self.is(Status::Dead) && !self.is(Status::Spectating) && !self.is(Status::Disconnected)
    }

    pub fn is_privileged(&self) -> bool {
        self.is(Status::Privileged)
    }

    /// Within the post-join grace window.
    pub fn is_new_joiner(&self, now: Millis, grace_ms: u64) -> bool {
        self.joined_at.is_some_and(|t| now < t + grace_ms)
    }

    /// Avatar box used for map classification.
    pub fn avatar(&self, half_size: f32) -> Rect {
        Rect::around(self.position, half_size)
    }

    /// Clear round-scoped state. Identity and connection state persist.
    pub fn reset_round(&mut self, start_level: u32, start_energy: f32) {
        self.stats = RoundStats::default();
        self.diagnostics = Diagnostics::default();
        self.kill_ledger.clear();
        self.last_touch = None;
        self.level = start_level;
        self.energy = start_energy;
        self.burst = None;
        self.phased_until = None;
        self.status.remove(Status::Phased);
    }

    /// Expire timed effects whose deadline has passed.
    pub fn expire_timers(&mut self, now: Millis) {
        if self.burst.is_some_and(|b| now >= b.until) {
            self.burst = None;
        }
        if self.phased_until.is_some_and(|t| now >= t) {
            self.phased_until = None;
            self.status.remove(Status::Phased);
        }
        if self.invincible_until.is_some_and(|t| now >= t) {
            self.invincible_until = None;
            // spectators stay invincible for as long as they spectate
            if !self.is(Status::Spectating) {
                self.status.remove(Status::Invincible);
            }
        }
    }

    /// Apply a movement debuff and mark the participant phased until `until`.
    pub fn phase(&mut self, until: Millis) {
        self.phased_until = Some(self.phased_until.map_or(until, |t| t.max(until)));
        self.status.insert(Status::Phased);
    }

    /// Grant invincibility until `until`, extending any current window.
    pub fn grant_invincibility(&mut self, until: Millis) {
        self.invincible_until = Some(self.invincible_until.map_or(until, |t| t.max(until)));
        self.status.insert(Status::Invincible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_participant_is_dead_guest() {
        let p = Participant::new(4, "fp".to_string(), String::new(), Vec2::new(1.0, 2.0), 100);
        assert!(p.is(Status::Dead));
        assert!(!p.is_live());
        assert_eq!(p.identity.name, "guest-4");
        assert_eq!(p.position, p.target);
    }

    #[test]
    fn status_set_flags_are_independent() {
        let mut s = StatusSet::default();
        s.insert(Status::Phased);
        s.insert(Status::Privileged);
        assert!(s.contains(Status::Phased));
        assert!(s.contains(Status::Privileged));
        assert!(!s.contains(Status::Dead));
        s.remove(Status::Phased);
        assert!(!s.contains(Status::Phased));
        assert!(s.contains(Status::Privileged));
        s.set(Status::Dead, true);
        assert!(s.contains(Status::Dead));
    }

    #[test]
    fn timers_expire() {
        let mut p = Participant::new(1, String::new(), String::new(), Vec2::ZERO, 0);
        p.phase(500);
        p.grant_invincibility(1_000);
        p.burst = Some(SpeedBurst {
            speed: 10.0,
            until: 200,
        });

        p.expire_timers(499);
        assert!(p.is(Status::Phased));
        assert!(p.burst.is_none());

        p.expire_timers(1_000);
        assert!(!p.is(Status::Phased));
        assert!(!p.is(Status::Invincible));
    }

    #[test]
    fn spectators_keep_invincibility() {
        let mut p = Participant::new(1, String::new(), String::new(), Vec2::ZERO, 0);
        p.status.insert(Status::Spectating);
        p.grant_invincibility(10);
        p.expire_timers(20);
        assert!(p.is(Status::Invincible));
    }

    #[test]
    fn reset_round_keeps_identity() {
        let mut p = Participant::new(9, "fp".to_string(), String::new(), Vec2::ZERO, 0);
        p.identity.address = Some("addr".to_string());
        p.stats.score = 500;
        p.diagnostics.stuck = 3;
        p.level = 4;
        p.kill_ledger.insert("x".to_string(), 2);
        p.reset_round(1, 40.0);
        assert_eq!(p.stats, RoundStats::default());
        assert_eq!(p.diagnostics, Diagnostics::default());
        assert_eq!(p.level, 1);
        assert_eq!(p.energy, 40.0);
        assert!(p.kill_ledger.is_empty());
        assert_eq!(p.identity.address.as_deref(), Some("addr"));
    }

    #[test]
    fn new_joiner_window() {
        let mut p = Participant::new(1, String::new(), String::new(), Vec2::ZERO, 0);
        assert!(!p.is_new_joiner(10, 1_000));
        p.joined_at = Some(100);
        assert!(p.is_new_joiner(500, 1_000));
        assert!(!p.is_new_joiner(1_100, 1_000));
    }
}
