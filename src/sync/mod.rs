//! State synchronization between the durable context and ephemeral attachments.

pub mod bus;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod ws;

pub use bus::{LocalBus, MessageBus, SyncClient};
pub use protocol::{ExtractionCommand, ExtractionEvent, Notification, Request, Response};
pub use state::{ApplicationState, StatePatch};
pub use supervisor::Supervisor;
pub use ws::sync_routes;
