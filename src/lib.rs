pub mod app;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod discovery;
pub mod driver;
pub mod estimator;
pub mod lenient;
pub mod models;
pub mod monitor;
pub mod rpc;
pub mod schedule;
pub mod selection;
pub mod state;
pub mod steps;
pub mod ui;
pub mod usage;
pub mod util;
