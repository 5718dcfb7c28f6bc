use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::auth::AdminAuth;
use crate::config::ServerConfig;
use crate::game_loop::GameCommand;

#[derive(Clone)]
pub struct AppState {
    /// Commands into the control loop.
    pub commands: mpsc::Sender<GameCommand>,
    pub auth: AdminAuth,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: ServerConfig, commands: mpsc::Sender<GameCommand>) -> Self {
        let auth = AdminAuth {
            bearer_token: config.admin.bearer_token.clone(),
        };
        Self {
            commands,
            auth,
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Counts one open connection for as long as it lives.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Reserve a slot, or `None` if `max` connections are already open.
    pub fn try_acquire(count: Arc<AtomicUsize>, max: usize) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(Self { count })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
