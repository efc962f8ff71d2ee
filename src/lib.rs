//! Forensic evidence processing engine.
//!
//! Evidence items are collected from a file, a directory tree or an image,
//! dispatched to format plugins by worker tasks, and the produced timeline
//! events are batched into an append-only store.

pub mod cli;
pub mod config;
pub mod constants;
pub mod engine;
pub mod event;
pub mod evidence;
pub mod filter;
pub mod logging;
pub mod pipeline;
pub mod plugins;
pub mod preprocess;
pub mod storage;
pub mod util;
