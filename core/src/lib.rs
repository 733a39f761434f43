pub mod callback;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod outbound;
pub mod reconciliation;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod types;

pub use engine::{BillingEngine, TestRig};
pub use error::{BillingError, BillingResult};
