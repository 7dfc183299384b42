//! Byte-level codecs: the self-delimited variable-length integer and the
//! typed value serialization used by the data store, the wire messages and
//! the checkpoint log.

pub mod value;
pub mod vint;

pub use value::{DataType, Value};
