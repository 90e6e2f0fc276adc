pub mod backend;
pub mod config;
pub mod connections;
pub mod history;
pub mod import;
pub mod query_executor;
pub mod results;
pub mod schema;
pub mod session;
pub mod snapshot;
pub mod tabs;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, EmbeddedBackend, EmbeddedHandle, RemoteEndpoint, RemoteTransport};
pub use results::{CellValue, QueryResult};
pub use session::{SessionController, SessionError, SessionOptions, SessionStatus};
