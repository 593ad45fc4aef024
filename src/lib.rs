pub mod api;
pub mod collaborator;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod job;
pub mod queue;
pub mod service;
pub mod shutdown;
pub mod worker;
