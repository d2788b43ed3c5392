pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod status;

pub use tracing;

/// Lifecycle signal broadcast by the supervisor to every running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
