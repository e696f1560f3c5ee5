pub mod clap_args;
pub mod config;
pub mod execution_plan;
pub mod expression;
pub mod mdlog;
pub mod optimizer;
pub mod process_control;
pub mod scheduler;
pub mod tuner;
