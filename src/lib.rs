//! SceneBench drives scene-based performance runs of a mobile build over `adb`, scrapes the
//! result the app writes to its log, and reconciles every sample with a remote metrics index.

pub mod attributes;
pub mod cli;
pub mod config;
pub mod correlate;
pub mod device;
pub mod error;
pub mod events;
pub mod inventory;
pub mod orchestrator;
pub mod payload;
pub mod results;
pub mod runner;
pub mod scrape;
pub mod store;
pub mod telemetry;
