pub mod cache;
pub mod config;
pub mod controller;
pub mod decision;
pub mod dry_run;
pub mod error;
pub mod gateway;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod stream;
pub mod transport;
pub mod types;

// Re-export key types/functions for easier use by other crates
pub use cache::ObservationCache;
pub use config::load_price_config;
pub use controller::{Controller, ControllerConfig};
pub use decision::{evaluate, should_update};
pub use dry_run::DryRunLedger;
pub use error::{ConfigError, DecodeError, StreamError};
pub use gateway::{LedgerGateway, PriceSource, SubmissionReceipt, UpdatePayload};
pub use registry::PriceCallback;
pub use scheduler::{PushScheduler, PushState, SchedulerConfig, SubmissionFailure};
pub use stream::{PriceStreamClient, SubscriptionHandle};
pub use transport::{ConnectionState, SessionConfig, SessionHooks, TransportSession};
pub use types::{FeedId, Observation, PriceConfig, UpdateCondition, UpdateThresholds};
