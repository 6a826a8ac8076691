//! Data models for the query engine.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod execution;
pub mod metadata;

// Re-export commonly used types
pub use connection::{
    ConnectionDescriptor, ConnectionUpdate, Dialect, NewConnection, mask_url,
    parse_connection_url,
};
pub use execution::{
    Cell, ExecuteRequest, ExecutionRecord, ExecutionStatus, QueryResult, TabularResult,
};
pub use metadata::{
    IntrospectRequest, MetadataEntry, ObjectAttributes, ObjectType, Snapshot, StructuralFact,
};
