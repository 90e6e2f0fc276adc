pub mod duckdb;
pub mod export;
pub mod http;

pub use crate::duckdb::{DuckDbBackend, DuckDbHandle};
pub use crate::http::ReqwestTransport;
