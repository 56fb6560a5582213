pub mod adb;
pub mod artifact;
pub mod config;
pub mod context;
pub mod error;
pub mod ios;
pub mod logging;
pub mod models;
pub mod perf;
pub mod remote;
pub mod ui_tree;

#[cfg(test)]
pub(crate) mod testing;
