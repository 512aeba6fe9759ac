pub mod config;
pub mod service;
pub mod tracing;

#[cfg(test)]
mod testing;
