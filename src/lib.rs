pub mod app;
pub mod bruteforcer;
pub mod cli;
pub mod collect;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod engine;
pub mod filter;
pub mod fingerprint;
pub mod http;
pub mod output;
pub mod processing;
pub mod runner;
pub mod template;
pub mod transform;

#[cfg(test)]
mod tests;
