//! Requests the world makes of the remote authority service, and the replies
//! the control loop feeds back in.
//!
//! The world never waits on the authority. It queues an [`AuthorityRequest`],
//! the host performs the call off the tick path, and the outcome comes back as
//! an [`AuthorityReply`] that is revalidated against the current state before
//! anything is committed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::RewardDraw;
use crate::participant::ParticipantId;
use crate::round::{RoundRecord, Standing};

/// Outcome of an identity verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum IdentityVerdict {
    Accepted {
        address: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        privileged: bool,
    },
    Rejected {
        reason: String,
    },
    Banned,
    Maintenance,
    /// The authority could not be reached in time.
    Unavailable,
}

/// Outcome of the ban check made before a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinVerdict {
    Allowed,
    Banned,
    Unavailable,
}

/// End-of-round payout computed by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub address: String,
    pub amount: u64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub enum AuthorityRequest {
    Verify {
        id: ParticipantId,
        address: String,
        signature: String,
        nonce: String,
        name: Option<String>,
    },
    CheckJoin {
        id: ParticipantId,
        address: String,
    },
    Draw {
        round_id: u64,
    },
    Persist(Box<RoundRecord>),
    Settle {
        record_id: Uuid,
        standings: Vec<Standing>,
    },
}

#[derive(Debug, Clone)]
pub enum AuthorityReply {
    Verified {
        id: ParticipantId,
        verdict: IdentityVerdict,
    },
    JoinChecked {
        id: ParticipantId,
        verdict: JoinVerdict,
    },
    /// `draw` is `None` when the catalog had nothing or the call failed.
    Drawn {
        round_id: u64,
        draw: Option<RewardDraw>,
        reached: bool,
    },
    Persisted {
        record_id: Uuid,
    },
    /// The record comes back so it can be queued for a later retry.
    PersistFailed(Box<RoundRecord>),
    Settled {
        record_id: Uuid,
        payouts: Vec<Payout>,
        reached: bool,
    },
}

impl AuthorityReply {
    /// Whether the call actually reached the authority.
    pub fn reached(&self) -> bool {
        match self {
            AuthorityReply::Verified { verdict, .. } => *verdict != IdentityVerdict::Unavailable,
            AuthorityReply::JoinChecked { verdict, .. } => *verdict != JoinVerdict::Unavailable,
            AuthorityReply::Drawn { reached, .. } | AuthorityReply::Settled { reached, .. } => {
                *reached
            },
            AuthorityReply::Persisted { .. } => true,
            AuthorityReply::PersistFailed(_) => false,
        }
    }
}
