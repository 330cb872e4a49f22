//! Object identity and ownership model.
//!
//! # Responsibility
//! - Define identities, handles, field metadata and value shapes shared by
//!   every other layer.
//!
//! # Invariants
//! - Every domain object is identified by a stable `ObjectId`.
//! - An object has at most one owner and the owner graph is a forest.

pub mod id;
pub mod meta;
pub mod object;
pub mod value;
