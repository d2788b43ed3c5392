//! Internal SMTP relay forwarding approved mail to a cloud email API.

pub mod notify;
pub mod restart;
pub mod supervisor;

pub use restart::{RestartRecord, RestartWindow};
pub use supervisor::{Supervisor, SupervisorError, UnitError};
