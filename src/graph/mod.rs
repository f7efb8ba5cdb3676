//! Resource graph module.
//!
//! This module turns a spec into a validated dependency graph:
//! - Extracting `${name.attr}` references from property values
//! - Inferring dependency edges and checking they resolve
//! - Rejecting cycles and computing a stable topological order

mod builder;
mod dag;
mod node;
mod reference;

pub use builder::GraphBuilder;
pub use dag::{stable_topological_order, ResourceGraph};
pub use node::ResourceNode;
pub use reference::{
    contains_reference, extract_references, field_references, malformed_references, resolve_properties,
    resolve_value, Reference,
};
