//! Inbox Agent: a durable human-in-the-loop email workflow engine.

pub mod agent;
pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod store;
pub mod tools;
