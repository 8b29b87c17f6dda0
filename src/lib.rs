pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod runtime;
pub mod sandbox;
pub mod service;
pub mod trace;
pub mod worker;
