//! Execution unit: an isolated tokio task that runs one task at a time and
//! talks to the pool only through its request/response channels.

pub mod protocol;
pub(crate) mod worker;

pub use self::protocol::{UnitRequest, UnitResponse};
