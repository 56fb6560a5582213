pub mod kit;
pub mod ports;
