//! Watchpost - host monitoring agent
//!
//! This crate provides an agent that evaluates metric item keys through a
//! plugin scheduler and serves them to monitoring servers, either passively
//! over a TCP listener or actively by pushing batches to configured servers.

pub mod agent;
pub mod config;
pub mod connector;
pub mod error;
pub mod itemkey;
pub mod items;
pub mod listener;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod scheduler;
