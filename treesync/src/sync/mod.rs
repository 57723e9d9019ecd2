pub mod action;
pub mod paths;
pub mod plan;
pub mod pool;
pub mod session;
pub mod snapshot;
pub mod workers;

#[cfg(test)]
pub mod testing;
