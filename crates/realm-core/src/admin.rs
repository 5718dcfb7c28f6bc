//! Administrative commands. Authorization happens at the transport; these
//! only check that the command makes sense against the current world.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AdminError, RulesError};
use crate::events::Event;
use crate::participant::{ParticipantId, Status};
use crate::{evolution, round};
use crate::rules::set_path;
use crate::world::{Phase, World};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum AdminCommand {
    Pause,
    Resume,
    /// Use this preset for the next round instead of a random one.
    ForcePreset { name: String },
    SetMaintenance { enabled: bool },
    /// Override one rule by dotted key. Applies now and to later rounds.
    SetRule { key: String, value: Value },
    Broadcast { message: String },
    Kick { id: ParticipantId, reason: String },
    Ban { address: String },
    SetField { id: ParticipantId, field: String, value: Value },
    ScheduleReboot { after_rounds: u32 },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum AdminOutcome {
    Applied,
    /// The command was valid but the world already matched it.
    Unchanged,
    Status(StatusReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub round: u64,
    pub phase: Phase,
    pub preset: String,
    pub mode: String,
    pub remaining_ms: u64,
    pub participants: usize,
    pub live: usize,
    pub maintenance: bool,
    pub authority_online: bool,
    pub rounds_played: u32,
    pub reboot_after: Option<u32>,
    pub queued_records: usize,
}

pub fn apply(world: &mut World, cmd: AdminCommand) -> Result<AdminOutcome, AdminError> {
    tracing::info!(command = ?cmd, "Admin command");
    match cmd {
        AdminCommand::Pause => Ok(changed(round::pause(world))),
        AdminCommand::Resume => Ok(changed(round::resume(world))),
        AdminCommand::ForcePreset { name } => {
            let index = world
                .ruleset
                .index_of(&name)
                .ok_or(RulesError::UnknownPreset(name))?;
            Ok(changed(world.forced_preset.replace(index) != Some(index)))
        },
        AdminCommand::SetMaintenance { enabled } => {
            if world.maintenance == enabled {
                return Ok(AdminOutcome::Unchanged);
            }
            world.maintenance = enabled;
            if enabled {
                world.emit(Event::Info {
                    message: "maintenance".to_string(),
                });
            }
            Ok(AdminOutcome::Applied)
        },
        AdminCommand::SetRule { key, value } => set_rule(world, &key, value),
        AdminCommand::Broadcast { message } => {
            world.emit(Event::Info { message });
            Ok(AdminOutcome::Applied)
        },
        AdminCommand::Kick { id, reason } => {
            if !world.participants.contains_key(&id) {
                return Err(AdminError::UnknownParticipant(id));
            }
            world.kick(id, &reason);
            Ok(AdminOutcome::Applied)
        },
        AdminCommand::Ban { address } => {
            let fresh = world.bans.insert(address.clone());
            let targets: Vec<ParticipantId> = world
                .participants
                .values()
                .filter(|p| p.identity.address.as_deref() == Some(address.as_str()))
                .map(|p| p.id)
                .collect();
            for id in &targets {
                world.kick(*id, "banned");
            }
            Ok(changed(fresh || !targets.is_empty()))
        },
        AdminCommand::SetField { id, field, value } => set_field(world, id, &field, value),
        AdminCommand::ScheduleReboot { after_rounds } => {
            let at = world.rounds_played + after_rounds.max(1);
            if world.reboot_after == Some(at) {
                return Ok(AdminOutcome::Unchanged);
            }
            world.reboot_after = Some(at);
            world.emit(Event::Info {
                message: format!("server restarts after round {at}"),
            });
            Ok(AdminOutcome::Applied)
        },
        AdminCommand::Status => Ok(AdminOutcome::Status(status(world))),
    }
}

fn changed(applied: bool) -> AdminOutcome {
    if applied {
        AdminOutcome::Applied
    } else {
        AdminOutcome::Unchanged
    }
}

pub fn status(world: &World) -> StatusReport {
    StatusReport {
        round: world.round.id,
        phase: world.phase,
        preset: world.round.preset.clone(),
        mode: world.rules.mode.clone(),
        remaining_ms: world.round_remaining(),
        participants: world.participants.len(),
        live: world.live_count(),
        maintenance: world.maintenance,
        authority_online: world.authority_online,
        rounds_played: world.rounds_played,
        reboot_after: world.reboot_after,
        queued_records: world.persist_queue.len(),
    }
}

/// Re-derive the rule snapshot with one more override. The live rules are only
/// replaced if the new snapshot builds.
fn set_rule(world: &mut World, key: &str, value: Value) -> Result<AdminOutcome, AdminError> {
    let current = serde_json::to_value(&world.rules).map_err(|e| AdminError::InvalidValue {
        field: key.to_string(),
        reason: e.to_string(),
    })?;
    let existing = key
        .split('.')
        .try_fold(&current, |v, part| v.get(part))
        .ok_or_else(|| AdminError::UnknownField(key.to_string()))?;
    if *existing == value {
        return Ok(AdminOutcome::Unchanged);
    }

    let mut overrides = world.overrides.clone();
    set_path(&mut overrides, key, value);
    let rules = world.ruleset.snapshot(world.preset, &overrides)?;
    world.overrides = overrides;
    world.rules = rules;
    evolution::clamp_to_rules(world);
    tracing::info!(key, "Rule override applied");
    Ok(AdminOutcome::Applied)
}

fn invalid(field: &str, reason: &str) -> AdminError {
    AdminError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn set_field(
    world: &mut World,
    id: ParticipantId,
    field: &str,
    value: Value,
) -> Result<AdminOutcome, AdminError> {
    let top_level = world.rules.top_level();
    let cap = world.rules.energy_cap;
    let now = world.now;
    let p = world
        .participants
        .get_mut(&id)
        .ok_or(AdminError::UnknownParticipant(id))?;

    match field {
        "level" => {
            let level = value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|&v| v <= top_level)
                .ok_or_else(|| invalid(field, "expected a level within the rules"))?;
            p.level = level;
        },
        "energy" => {
            let energy = value
                .as_f64()
                .map(|v| v as f32)
                .filter(|v| v.is_finite() && (0.0..=cap).contains(v))
                .ok_or_else(|| invalid(field, "expected energy within [0, cap]"))?;
            p.energy = energy;
        },
        "score" => {
            p.stats.score = value
                .as_u64()
                .ok_or_else(|| invalid(field, "expected a non-negative integer"))?;
        },
        "speed_modifier" => {
            p.speed_modifier = value
                .as_f64()
                .map(|v| v as f32)
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| invalid(field, "expected a positive number"))?;
        },
        "decay_modifier" => {
            p.decay_modifier = value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| invalid(field, "expected a percentage"))?;
        },
        "name" => {
            let name = value
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid(field, "expected a non-empty string"))?;
            p.identity.name = name.to_string();
        },
        "invincible" => {
            let on = value
                .as_bool()
                .ok_or_else(|| invalid(field, "expected a boolean"))?;
            p.status.set(Status::Invincible, on);
            p.invincible_until = None;
        },
        other => return Err(AdminError::UnknownField(other.to_string())),
    }
    p.last_update = now;
    tracing::info!(participant_id = id, field, "Participant field set by admin");
    Ok(AdminOutcome::Applied)
}
