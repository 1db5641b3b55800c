#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::return_self_not_must_use
)]

pub mod agent;
pub mod app;
pub mod bus;
pub mod channels;
pub mod config;
pub mod cron;
pub mod providers;
pub mod sentinel;
pub mod state;
pub mod telemetry;
pub mod tools;
pub mod util;

pub use config::Config;
