pub mod change;
pub mod error;
pub mod event;
pub mod id;
pub mod store;

pub use change::{Change, ChangeOperation};
pub use error::{ErrorCategory, ReactiveError, Result};
pub use event::{GLOBAL_SCOPE, InvalidationEvent};
pub use id::{generate_connection_id, generate_event_id};
pub use store::{DataStore, ReplicationMode, StoreError, TransactionOptions};
