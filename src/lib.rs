pub mod api;
pub mod config;
pub mod humanize;
pub mod manager;
pub mod network;
pub mod observability;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;
