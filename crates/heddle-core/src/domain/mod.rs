//! Domain model (ids, task envelope, results, handler errors).

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod task;

pub use self::errors::{ErrorKind, HandlerError};
pub use self::ids::{TaskId, UnitId};
pub use self::outcome::TaskResult;
pub use self::task::{HandlerKind, TaskEnvelope};
