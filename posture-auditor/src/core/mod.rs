/*!
Core architecture modules for the posture auditor
*/

pub mod auditor;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod finding;
pub mod logging;
pub mod output_plugins;
pub mod registry;
