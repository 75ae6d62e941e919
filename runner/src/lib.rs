pub mod collector;
pub mod config;
pub mod error;
pub mod executors;
pub mod harvester;
pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod packager;
pub mod storage;
pub mod summary;
pub mod sync;
pub mod tasks;
