//! The SMTP side of the relay: a listener accepting clients on the local
//! network, the per-connection protocol machine, and the rewriting of
//! accepted messages into envelopes for the delivery queue.

pub mod command;
pub mod error;
pub mod listener;
pub mod machine;
pub mod response;
pub mod session;
pub mod state;
pub mod transform;
pub mod verify;

pub use command::{Command, HeloVariant};
pub use error::{ListenerError, SessionError, TransformError, VerifyError};
pub use listener::SmtpListener;
pub use machine::{Action, Machine};
pub use response::Reply;
pub use session::{Session, SessionConfig, SessionConfigBuilder};
pub use state::{State, Transaction};
pub use transform::Transformer;
pub use verify::Verifier;
