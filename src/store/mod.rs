//! Persistence layer — profiles and items behind one async `Store` trait.

pub mod libsql_backend;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Store;
