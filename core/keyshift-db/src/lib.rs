//! SQLite connection management for keyshift.
//!
//! A single [`Database`] handle is shared by stores and migrators. Blocking
//! rusqlite calls run on tokio's blocking pool through [`Database::call`].

mod connection;
mod error;
pub mod schema;

pub use connection::Database;
pub use error::{DbError, DbResult};
pub use rusqlite;
