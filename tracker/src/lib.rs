mod hlc;
mod http;
mod persist;
mod security;
mod state;
mod sync;

pub use hlc::Hlc;
pub use http::{router, App};
pub use persist::{load_from_file, save_to_file, PersistError};
pub use state::{Peer, Swarm, Tracker};
pub use sync::{spawn_sync_push, SyncMessage};
