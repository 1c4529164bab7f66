pub mod app;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod error;
pub mod newick;
pub mod ott;
pub mod output;
pub mod progress;
pub mod store;
