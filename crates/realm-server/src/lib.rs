pub mod api;
pub mod auth;
pub mod authority;
pub mod config;
pub mod error;
pub mod game_loop;
pub mod state;
pub mod ws;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;

use realm_core::error::RulesError;
use realm_core::geometry::load_map;
use realm_core::rules::RuleSet;
use realm_core::time::Millis;
use realm_core::world::World;

use authority::{Authority, HttpAuthority, OfflineAuthority};
use config::ServerConfig;
use game_loop::GameCommand;
use state::AppState;

/// Admin requests that wait longer than this on the control loop fail.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the Axum router and application state from a config and the
/// control loop's command sender.
pub fn build_app(
    config: ServerConfig,
    commands: mpsc::Sender<GameCommand>,
) -> (Router<()>, AppState) {
    let state = AppState::new(config, commands);

    let admin_routes = Router::new()
        .route("/pause", post(api::pause))
        .route("/resume", post(api::resume))
        .route("/preset", post(api::force_preset))
        .route("/maintenance", post(api::set_maintenance))
        .route("/rules", post(api::set_rule))
        .route("/broadcast", post(api::broadcast))
        .route("/kick", post(api::kick))
        .route("/ban", post(api::ban))
        .route("/participant", post(api::set_field))
        .route("/reboot", post(api::schedule_reboot))
        .route("/status", get(api::status))
        .layer(TimeoutLayer::new(ADMIN_TIMEOUT))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_layer,
        ));

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(api::health))
        .nest("/admin", admin_routes)
        .with_state(state.clone());

    (app, state)
}

/// Middleware wrapper that injects AdminAuth into request extensions for the
/// bearer auth middleware.
async fn bearer_auth_layer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Result<axum::response::Response, axum::http::StatusCode> {
    request.extensions_mut().insert(state.auth.clone());
    auth::bearer_auth_middleware(request.headers().clone(), request, next).await
}

/// Rule layers from the configured directory, or the built-in presets.
pub fn load_rules(config: &ServerConfig) -> RuleSet {
    match RuleSet::load_dir(Path::new(&config.rules_dir)) {
        Ok(set) => {
            tracing::info!(
                dir = %config.rules_dir,
                presets = set.presets.len(),
                "Loaded rule layers"
            );
            set
        },
        Err(e) => {
            tracing::warn!(dir = %config.rules_dir, error = %e, "Using built-in presets");
            RuleSet::builtin()
        },
    }
}

/// Build the world described by `config`, starting its first round at `now`.
pub fn build_world(config: &ServerConfig, now: Millis) -> Result<World, RulesError> {
    let map = Arc::new(load_map(&config.map_path));
    let seed = config.seed.unwrap_or_else(rand::random);
    World::new(config.world_settings(), map, load_rules(config), seed, now)
}

/// The HTTP authority when one is configured, otherwise the offline one.
pub fn build_authority(config: &ServerConfig) -> Arc<dyn Authority> {
    if let Some(url) = &config.authority.url {
        match HttpAuthority::new(url, &config.authority) {
            Ok(authority) => {
                tracing::info!(url = %url, "Using remote authority");
                return Arc::new(authority);
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to build authority client, running offline");
            },
        }
    }
    Arc::new(OfflineAuthority::default())
}
