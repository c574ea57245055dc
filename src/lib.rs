pub mod backend;
pub mod bundle;
pub mod config;
pub mod controller;
pub mod job;
pub mod lifecycle;
pub mod relay;
