pub mod activity;
pub mod device;
pub mod install;
pub mod locator;
pub mod parse;
pub mod paths;
pub mod process;
pub mod runner;
pub mod session;
