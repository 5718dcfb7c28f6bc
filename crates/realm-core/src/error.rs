use crate::participant::ParticipantId;

/// Failure assembling a rule snapshot from its layers.
#[derive(Debug)]
pub enum RulesError {
    NoPresets,
    UnknownPreset(String),
    Parse(String),
    Merge(String),
}

impl std::fmt::Display for RulesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPresets => write!(f, "no selectable presets"),
            Self::UnknownPreset(name) => write!(f, "unknown preset: {name}"),
            Self::Parse(e) => write!(f, "rule layer parse error: {e}"),
            Self::Merge(e) => write!(f, "rule layer merge error: {e}"),
        }
    }
}

impl std::error::Error for RulesError {}

/// Rejected administrative command.
#[derive(Debug)]
pub enum AdminError {
    UnknownParticipant(ParticipantId),
    UnknownField(String),
    InvalidValue { field: String, reason: String },
    Rules(RulesError),
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownParticipant(id) => write!(f, "unknown participant: {id}"),
            Self::UnknownField(name) => write!(f, "unknown field: {name}"),
            Self::InvalidValue { field, reason } => {
                write!(f, "invalid value for {field}: {reason}")
            },
            Self::Rules(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AdminError {}

impl From<RulesError> for AdminError {
    fn from(e: RulesError) -> Self {
        Self::Rules(e)
    }
}

/// World corruption detected at the end of a fast tick. The process does not
/// continue from a partially applied tick.
#[derive(Debug)]
pub enum TickError {
    NonFinitePosition(ParticipantId),
    NonFiniteEnergy(ParticipantId),
    LevelOutOfRange { id: ParticipantId, level: u32 },
    EnergyOutOfRange { id: ParticipantId, energy: f32 },
}

impl std::fmt::Display for TickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFinitePosition(id) => write!(f, "participant {id} has a non-finite position"),
            Self::NonFiniteEnergy(id) => write!(f, "participant {id} has non-finite energy"),
            Self::LevelOutOfRange { id, level } => {
                write!(f, "participant {id} has out-of-range level {level}")
            },
            Self::EnergyOutOfRange { id, energy } => {
                write!(f, "participant {id} has out-of-range energy {energy}")
            },
        }
    }
}

impl std::error::Error for TickError {}
