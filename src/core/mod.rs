//! Core business logic module

pub mod adapter;
pub mod central;
pub mod completion;
pub mod discovery;
pub mod error;
pub mod link;
pub mod router;
pub mod scanner;
pub mod types;
