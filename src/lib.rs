#![forbid(unsafe_code)]

pub mod app;
pub mod classify;
pub mod cli;
pub mod commands;
pub mod config;
pub mod coverage;
pub mod formats;
pub mod gating;
pub mod grounding;
pub mod ladder;
pub mod lease;
pub mod logging;
pub mod openai;
pub mod orchestrator;
pub mod reachability;
pub mod search;
pub mod state;
pub mod validation;
