use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use parley_db::Database;
use parley_gateway::EventBus;

use crate::conversations::ConversationService;
use crate::messages::MessageService;
use crate::users::UserService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub conversations: ConversationService,
    pub messages: MessageService,
    pub users: UserService,
    pub bus: EventBus,
    pub jwt_secret: String,
    shutdown: watch::Sender<bool>,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, bus: EventBus, jwt_secret: String) -> AppState {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            conversations: ConversationService::new(db.clone(), bus.clone()),
            messages: MessageService::new(db.clone(), bus.clone()),
            users: UserService::new(db),
            bus,
            jwt_secret,
            shutdown,
        })
    }

    /// Receiver that flips when the server starts shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tell every open gateway connection to close.
    pub fn begin_shutdown(&self) {
        info!("Closing gateway connections");
        self.shutdown.send_replace(true);
    }
}
