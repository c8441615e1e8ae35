pub mod admission;
pub mod app;
pub mod cli;
pub mod config;
pub mod detector;
pub mod disposal;
pub mod error;
pub mod launcher;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod scanner;
pub mod signal;
pub mod storage;
pub mod watch;

pub use app::run;
