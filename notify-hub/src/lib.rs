//! notify-hub library crate.
//!
//! Delivers one logical message to many destinations across pluggable
//! platforms, either right away ([`NotificationHub::send`]) or through a
//! bounded queue and worker pool ([`NotificationHub::send_async`]) with
//! retries, receipts and async handles.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handle;
pub mod hub;
pub mod logging;
pub mod message;
pub mod platform;
pub mod queue;
pub mod receipt;
pub mod retry;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::HubConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{Error, ErrorCategory, PlatformError, Result};
pub use events::HubEvent;
pub use handle::{
    AsyncHandle, BatchHandle, BatchOptions, BatchProgress, HandleSnapshot, HandleStatus,
    SendOptions,
};
pub use hub::{HubStats, NotificationHub, NotificationHubBuilder};
pub use message::{Message, MessageFormat, Priority, Target, TargetType};
pub use platform::{Platform, PlatformCapabilities, PlatformHealth, PlatformRegistry};
pub use queue::{MemoryQueueStore, QueueStore, ShutdownReport};
pub use receipt::{AggregationConfig, DeliveryStatus, PlatformResult, Receipt, ReceiptAggregator};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
