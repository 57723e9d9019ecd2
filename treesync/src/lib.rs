pub mod config;
pub mod console;
pub mod session_log;
pub mod sync;
