//! Clients for the external authority service. Every call resolves to an
//! [`AuthorityReply`]; failures become the degraded reply for that call.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use realm_core::authority::{AuthorityReply, AuthorityRequest, IdentityVerdict, JoinVerdict, Payout};
use realm_core::entities::RewardDraw;

use crate::auth::{SIGNATURE_HEADER, sign_body};
use crate::config::AuthorityConfig;

pub type ReplyFuture<'a> = Pin<Box<dyn Future<Output = AuthorityReply> + Send + 'a>>;

/// Something that can answer world requests. Implementations must never fail:
/// errors map to the fallback reply.
pub trait Authority: Send + Sync {
    fn call(&self, req: AuthorityRequest) -> ReplyFuture<'_>;
}

#[derive(Debug)]
pub enum AuthorityError {
    Transport(String),
    Timeout,
    Status(u16),
    Decode(String),
}

impl std::fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Timeout => write!(f, "deadline exceeded"),
            Self::Status(code) => write!(f, "unexpected status {code}"),
            Self::Decode(e) => write!(f, "bad response body: {e}"),
        }
    }
}

impl std::error::Error for AuthorityError {}

/// The reply a request gets when the authority cannot be reached.
pub fn fallback(req: AuthorityRequest) -> AuthorityReply {
    match req {
        AuthorityRequest::Verify { id, .. } => AuthorityReply::Verified {
            id,
            verdict: IdentityVerdict::Unavailable,
        },
        AuthorityRequest::CheckJoin { id, .. } => AuthorityReply::JoinChecked {
            id,
            verdict: JoinVerdict::Unavailable,
        },
        AuthorityRequest::Draw { round_id } => AuthorityReply::Drawn {
            round_id,
            draw: None,
            reached: false,
        },
        AuthorityRequest::Persist(record) => AuthorityReply::PersistFailed(record),
        AuthorityRequest::Settle { record_id, .. } => AuthorityReply::Settled {
            record_id,
            payouts: Vec::new(),
            reached: false,
        },
    }
}

#[derive(Debug, Deserialize)]
struct DrawResponse {
    #[serde(default)]
    draw: Option<RewardDraw>,
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    verdict: JoinVerdict,
}

#[derive(Debug, Deserialize)]
struct SettleResponse {
    #[serde(default)]
    payouts: Vec<Payout>,
}

/// JSON-over-HTTP authority with a fixed per-call deadline.
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
    deadline: Duration,
    secret: Option<String>,
}

impl HttpAuthority {
    pub fn new(base_url: &str, config: &AuthorityConfig) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .user_agent("realm-server/0.1")
            .build()
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            deadline: Duration::from_millis(config.deadline_ms),
            secret: config.secret.clone(),
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, AuthorityError> {
        let bytes = serde_json::to_vec(&body).map_err(|e| AuthorityError::Decode(e.to_string()))?;
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("content-type", "application/json");
        if let Some(signature) = self.secret.as_deref().and_then(|s| sign_body(s, &bytes)) {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let send = async {
            let resp = request
                .body(bytes)
                .send()
                .await
                .map_err(|e| AuthorityError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(AuthorityError::Status(resp.status().as_u16()));
            }
            resp.json::<T>()
                .await
                .map_err(|e| AuthorityError::Decode(e.to_string()))
        };
        tokio::time::timeout(self.deadline, send)
            .await
            .map_err(|_| AuthorityError::Timeout)?
    }

    async fn dispatch(&self, req: &AuthorityRequest) -> Result<AuthorityReply, AuthorityError> {
        Ok(match req {
            AuthorityRequest::Verify {
                id,
                address,
                signature,
                nonce,
                name,
            } => {
                let body = serde_json::json!({
                    "address": address,
                    "signature": signature,
                    "nonce": nonce,
                    "name": name,
                });
                AuthorityReply::Verified {
                    id: *id,
                    verdict: self.post("/identity/verify", body).await?,
                }
            },
            AuthorityRequest::CheckJoin { id, address } => {
                let resp: JoinResponse = self
                    .post("/identity/check", serde_json::json!({ "address": address }))
                    .await?;
                AuthorityReply::JoinChecked {
                    id: *id,
                    verdict: resp.verdict,
                }
            },
            AuthorityRequest::Draw { round_id } => {
                let resp: DrawResponse = self
                    .post("/rewards/draw", serde_json::json!({ "round": round_id }))
                    .await?;
                AuthorityReply::Drawn {
                    round_id: *round_id,
                    draw: resp.draw,
                    reached: true,
                }
            },
            AuthorityRequest::Persist(record) => {
                let body = serde_json::to_value(record)
                    .map_err(|e| AuthorityError::Decode(e.to_string()))?;
                let _: serde_json::Value = self.post("/rounds", body).await?;
                AuthorityReply::Persisted {
                    record_id: record.record_id,
                }
            },
            AuthorityRequest::Settle {
                record_id,
                standings,
            } => {
                let body = serde_json::json!({ "record_id": record_id, "standings": standings });
                let resp: SettleResponse = self.post("/rewards/settle", body).await?;
                AuthorityReply::Settled {
                    record_id: *record_id,
                    payouts: resp.payouts,
                    reached: true,
                }
            },
        })
    }
}

impl Authority for HttpAuthority {
    fn call(&self, req: AuthorityRequest) -> ReplyFuture<'_> {
        Box::pin(async move {
            match self.dispatch(&req).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        request = request_name(&req),
                        "Authority call failed"
                    );
                    fallback(req)
                },
            }
        })
    }
}

fn request_name(req: &AuthorityRequest) -> &'static str {
    match req {
        AuthorityRequest::Verify { .. } => "verify",
        AuthorityRequest::CheckJoin { .. } => "check-join",
        AuthorityRequest::Draw { .. } => "draw",
        AuthorityRequest::Persist(_) => "persist",
        AuthorityRequest::Settle { .. } => "settle",
    }
}

/// Local authority used when none is configured. Accepts every identity,
/// bans nobody, draws from a small built-in catalog and pays nothing.
#[derive(Default)]
pub struct OfflineAuthority {
    /// Addresses granted the privileged flag.
    pub privileged: Vec<String>,
}

/// (weight, category, name, rarity)
const CATALOG: &[(u32, &str, &str, &str)] = &[
    (60, "cosmetic", "Trail", "common"),
    (25, "cosmetic", "Halo", "rare"),
    (10, "badge", "Founder", "epic"),
    (5, "crown", "Crown", "legendary"),
];

/// Trim a requested display name to something safe to broadcast.
pub fn sanitize_name(name: &str) -> Option<String> {
    let clean: String = name
        .chars()
        .filter(|c| !c.is_control())
        .take(24)
        .collect();
    let clean = clean.trim();
    (!clean.is_empty()).then(|| clean.to_string())
}

impl OfflineAuthority {
    fn draw(&self) -> Option<RewardDraw> {
        let total: u32 = CATALOG.iter().map(|(w, ..)| w).sum();
        let mut roll = rand::rng().random_range(0..total);
        for &(weight, category, name, rarity) in CATALOG {
            if roll < weight {
                return Some(RewardDraw {
                    category: category.to_string(),
                    name: name.to_string(),
                    rarity: rarity.to_string(),
                    quantity: 1,
                });
            }
            roll -= weight;
        }
        None
    }
}

impl Authority for OfflineAuthority {
    fn call(&self, req: AuthorityRequest) -> ReplyFuture<'_> {
        let reply = match req {
            AuthorityRequest::Verify {
                id, address, name, ..
            } => {
                let privileged = self.privileged.contains(&address);
                AuthorityReply::Verified {
                    id,
                    verdict: IdentityVerdict::Accepted {
                        address,
                        name: name.as_deref().and_then(sanitize_name),
                        privileged,
                    },
                }
            },
            AuthorityRequest::CheckJoin { id, .. } => AuthorityReply::JoinChecked {
                id,
                verdict: JoinVerdict::Allowed,
            },
            AuthorityRequest::Draw { round_id } => AuthorityReply::Drawn {
                round_id,
                draw: self.draw(),
                reached: true,
            },
            AuthorityRequest::Persist(record) => AuthorityReply::Persisted {
                record_id: record.record_id,
            },
            AuthorityRequest::Settle { record_id, .. } => AuthorityReply::Settled {
                record_id,
                payouts: Vec::new(),
                reached: true,
            },
        };
        Box::pin(async move { reply })
    }
}
