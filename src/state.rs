use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::AuthVerifier;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::presence::PresenceStore;
use crate::replay::ReplayCoordinator;
use crate::repository::MessageRepository;
use crate::websocket::hub::Hub;

/// Shared application state passed to all handlers, the delivery worker, and
/// extractors.
///
/// `Hub`, `PresenceStore`, `MessageBus`, `MessageRepository`, and
/// `ReplayCoordinator` are cheaply cloneable (they wrap an `Arc`/connection
/// pool internally), so cloning `AppState` per request or per connection is
/// inexpensive.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub presence: PresenceStore,
    pub bus: MessageBus,
    pub hub: Hub,
    pub repository: MessageRepository,
    pub replay: ReplayCoordinator,
    pub auth_verifier: Arc<dyn AuthVerifier>,
    pub config: Arc<Config>,
}
