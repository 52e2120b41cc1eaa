//! Concrete [`Key`](crate::Key) implementations.

mod noop;
mod symmetric;
pub mod testing;
mod transit;

pub use noop::NoopKey;
pub use symmetric::SymmetricKey;
pub use transit::{TransitConfig, TransitKey};
