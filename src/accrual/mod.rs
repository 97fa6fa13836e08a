pub mod calculator;
pub mod handler;
pub mod models;
pub mod repository;
pub mod worker;

#[cfg(test)]
pub mod memory;

pub use repository::AccrualRepository;
pub use worker::{AccrualCalculationWorker, CalculationConfig};
