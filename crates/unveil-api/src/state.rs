use unveil_engine::Engine;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub jwt_secret: String,
    /// Shared with the delivery relays. Unset disables the status webhook.
    pub webhook_secret: Option<String>,
}
