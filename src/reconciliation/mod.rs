pub mod backoff;
pub mod client;
pub mod worker;

pub use client::AccrualClient;
pub use worker::{OrderReconciliationWorker, ReconciliationConfig};
