pub mod aggregate;
pub mod analysis;
pub mod batch;
pub mod config;
pub mod database;
pub mod error;
pub mod housekeeping;
pub mod insights;
pub mod lease;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod routes;
pub mod stages;
pub mod stores;
pub mod task_registry;
pub mod worker_processing;
pub mod worker_scheduler;
