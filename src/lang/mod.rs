//! # yaspl value and object model
//!
//! Values are small `Copy` tags; everything with identity lives in the
//! collector's arena and is reached through an [`object::ObjRef`].
//!
//! - [`value`]: the tagged `Value` union, equality, truthiness and hashing.
//! - [`object`]: heap object variants and their GC header.
//! - [`table`]: the chained hash map used for interning, globals and dicts.
//! - [`ops`]: indexing, concatenation and string conversion.

pub mod object;
pub mod ops;
pub mod table;
pub mod value;
