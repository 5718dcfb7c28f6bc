use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::entities::{EntityId, PickupKind};
use crate::geometry::Vec2;
use crate::participant::ParticipantId;
use crate::time::Millis;

/// A client-observable state change. Queued during a tick and flushed once.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Joined {
        id: ParticipantId,
        name: String,
        level: u32,
        position: Vec2,
    },
    Left {
        id: ParticipantId,
    },
    Spectating {
        id: ParticipantId,
    },
    Moved {
        id: ParticipantId,
        position: Vec2,
        target: Vec2,
    },
    Evolved {
        id: ParticipantId,
        level: u32,
    },
    Regressed {
        id: ParticipantId,
        level: u32,
    },
    Touched {
        attacker: ParticipantId,
        defender: ParticipantId,
    },
    /// `attacker` is `None` for a decay elimination with no claimant.
    Eliminated {
        defender: ParticipantId,
        attacker: Option<ParticipantId>,
    },
    Score {
        id: ParticipantId,
        score: u64,
    },
    Zoom {
        id: ParticipantId,
        zoom: f32,
    },
    PickupSpawned {
        id: EntityId,
        kind: PickupKind,
        position: Vec2,
    },
    PickupRemoved {
        id: EntityId,
        collector: Option<ParticipantId>,
    },
    OrbSpawned {
        id: EntityId,
        value: u64,
        position: Vec2,
        active_at: Millis,
    },
    OrbCollected {
        id: EntityId,
        collector: ParticipantId,
    },
    RewardSpawned {
        id: EntityId,
        category: String,
        name: String,
        rarity: String,
        quantity: u32,
        position: Vec2,
    },
    RewardClaimed {
        id: EntityId,
        collector: ParticipantId,
    },
    RewardExpired {
        id: EntityId,
    },
    RoundStarted {
        round: u64,
        mode: String,
        ends_at: Millis,
    },
    RoundEnded {
        round: u64,
        standings: Vec<(ParticipantId, u64)>,
    },
    Paused,
    Resumed {
        ends_at: Millis,
    },
    Info {
        message: String,
    },
}

type Args = SmallVec<[String; 8]>;

fn coord(v: f32) -> String {
    format!("{}", v.round() as i64)
}

/// Arguments are colon-joined on the wire, so free text must not contain one.
fn text(s: &str) -> String {
    s.replace(':', ";")
}

fn opt_id(id: Option<ParticipantId>) -> String {
    id.map_or_else(|| "0".to_string(), |id| id.to_string())
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Joined { .. } => "joined",
            Event::Left { .. } => "left",
            Event::Spectating { .. } => "spectating",
            Event::Moved { .. } => "moved",
            Event::Evolved { .. } => "evolved",
            Event::Regressed { .. } => "regressed",
            Event::Touched { .. } => "touched",
            Event::Eliminated { .. } => "eliminated",
            Event::Score { .. } => "score",
            Event::Zoom { .. } => "zoom",
            Event::PickupSpawned { .. } => "pickup",
            Event::PickupRemoved { .. } => "pickup-gone",
            Event::OrbSpawned { .. } => "orb",
            Event::OrbCollected { .. } => "orb-gone",
            Event::RewardSpawned { .. } => "reward",
            Event::RewardClaimed { .. } => "reward-claimed",
            Event::RewardExpired { .. } => "reward-expired",
            Event::RoundStarted { .. } => "round-start",
            Event::RoundEnded { .. } => "round-end",
            Event::Paused => "paused",
            Event::Resumed { .. } => "resumed",
            Event::Info { .. } => "info",
        }
    }

    /// Ordered argument list.
    pub fn args(&self) -> Args {
        match self {
            Event::Joined {
                id,
                name,
                level,
                position,
            } => smallvec![
                id.to_string(),
                text(name),
                level.to_string(),
                coord(position.x),
                coord(position.y),
            ],
            Event::Left { id } | Event::Spectating { id } => smallvec![id.to_string()],
            Event::Moved {
                id,
                position,
                target,
            } => smallvec![
                id.to_string(),
                coord(position.x),
                coord(position.y),
                coord(target.x),
                coord(target.y),
            ],
            Event::Evolved { id, level } | Event::Regressed { id, level } => {
                smallvec![id.to_string(), level.to_string()]
            },
            Event::Touched { attacker, defender } => {
                smallvec![attacker.to_string(), defender.to_string()]
            },
            Event::Eliminated { defender, attacker } => {
                smallvec![defender.to_string(), opt_id(*attacker)]
            },
            Event::Score { id, score } => smallvec![id.to_string(), score.to_string()],
            Event::Zoom { id, zoom } => smallvec![id.to_string(), format!("{zoom:.2}")],
            Event::PickupSpawned { id, kind, position } => smallvec![
                id.to_string(),
                kind.as_str().to_string(),
                coord(position.x),
                coord(position.y),
            ],
            Event::PickupRemoved { id, collector } => {
                smallvec![id.to_string(), opt_id(*collector)]
            },
            Event::OrbSpawned {
                id,
                value,
                position,
                active_at,
            } => smallvec![
                id.to_string(),
                value.to_string(),
                coord(position.x),
                coord(position.y),
                active_at.to_string(),
            ],
            Event::OrbCollected { id, collector } | Event::RewardClaimed { id, collector } => {
                smallvec![id.to_string(), collector.to_string()]
            },
            Event::RewardSpawned {
                id,
                category,
                name,
                rarity,
                quantity,
                position,
            } => smallvec![
                id.to_string(),
                text(category),
                text(name),
                text(rarity),
                quantity.to_string(),
                coord(position.x),
                coord(position.y),
            ],
            Event::RewardExpired { id } => smallvec![id.to_string()],
            Event::RoundStarted {
                round,
                mode,
                ends_at,
            } => smallvec![round.to_string(), text(mode), ends_at.to_string()],
            Event::RoundEnded { round, standings } => {
                let ranked = standings
                    .iter()
                    .map(|(id, score)| format!("{id}={score}"))
                    .collect::<Vec<_>>()
                    .join(",");
                smallvec![round.to_string(), ranked]
            },
            Event::Paused => SmallVec::new(),
            Event::Resumed { ends_at } => smallvec![ends_at.to_string()],
            Event::Info { message } => smallvec![text(message)],
        }
    }

    /// Continuous updates that are sampled before entering the audit log.
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, Event::Moved { .. })
    }

    /// Wire triple `[name, "a:b:c"]`.
    pub fn encode(&self) -> (&'static str, String) {
        (self.name(), self.args().join(":"))
    }
}

/// Per-tick outbound queue. One flush produces one broadcast frame.
#[derive(Debug, Default)]
pub struct EventBatch {
    queue: Vec<Event>,
}

impl EventBatch {
    pub fn push(&mut self, event: Event) {
        self.queue.push(event);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> &[Event] {
        &self.queue
    }

    /// Serialize the whole queue as one JSON array and clear it.
    /// Returns `None` when nothing was queued this tick.
    pub fn flush(&mut self) -> Option<String> {
        if self.queue.is_empty() {
            return None;
        }
        let triples: Vec<(&'static str, String)> =
            self.queue.drain(..).map(|e| e.encode()).collect();
        match serde_json::to_string(&triples) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode event batch");
                None
            },
        }
    }
}

/// One line of a round's audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: Millis,
    pub name: String,
    pub args: String,
}

/// Ordered record of everything broadcast during a round, with high-frequency
/// events thinned to one sample per participant per interval.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    pub entries: Vec<AuditEntry>,
    sample_ms: u64,
    last_sample: HashMap<ParticipantId, Millis>,
}

impl AuditLog {
    pub fn new(sample_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            sample_ms,
            last_sample: HashMap::new(),
        }
    }

    pub fn record(&mut self, at: Millis, event: &Event) {
        if let Event::Moved { id, .. } = event {
            if let Some(&last) = self.last_sample.get(id)
                && at < last + self.sample_ms
            {
                return;
            }
            self.last_sample.insert(*id, at);
        }
        let (name, args) = event.encode();
        self.entries.push(AuditEntry {
            at,
            name: name.to_string(),
            args,
        });
    }
}
