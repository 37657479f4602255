//! Task graph: external document format, validated model, and indexes.

pub mod model;
pub mod parser;

pub use model::{TaskDef, TaskGraph, TaskGraphDocument, Verification};
pub use parser::{parse_graph, GraphError};
