//! Execution contexts used by transports and resolvers.

mod sequential;
mod sync_context;

pub use sequential::SequentialExecutor;
pub use sync_context::{panic_message, SyncContext};
