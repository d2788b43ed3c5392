pub mod api;
pub mod error;
pub mod policy;
pub mod queue;
pub mod send_log;
pub mod sender;
pub mod testing;
pub mod worker;

pub use api::EmailApiClient;
pub use error::{ApiError, DeliveryError, ErrorClass, PermanentError, TransientError};
pub use policy::RetryPolicy;
pub use queue::{DeliveryQueue, Lease, QueueError};
pub use send_log::{Outcome, SendLog, SendLogEntry};
pub use sender::{EmailSender, SendReceipt};
pub use worker::DeliveryWorker;
