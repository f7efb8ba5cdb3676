//! Resource type registry.
//!
//! Resource kinds are tagged variants; behaviour that differs per kind lives
//! in a static operation table looked up by tag.

mod kind;
mod ops;

pub use kind::ResourceType;
pub use ops::{diff_fields, DiffFn, FieldChange, Handler, TypeOps, ValidateFn};
