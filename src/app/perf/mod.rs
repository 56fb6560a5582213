pub mod cpu;
pub mod dump_log;
pub mod mem;
