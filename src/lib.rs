pub mod app;
pub mod casrn;
pub mod cmgroup;
pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod output;
pub mod params;
pub mod pubchem;
pub mod scheduler;
pub mod store;
