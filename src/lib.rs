#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod allocator;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod invocation;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod paths;
pub mod process;
pub mod provision;
pub mod reconcile;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod util;
