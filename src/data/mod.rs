//! The shared data store hosted by every server: typed datums addressed by
//! `i64` ids, split read/write reference counts, container subscripts,
//! closure/insertion listeners, and container-reference promises.

pub mod notify;
pub mod store;

pub use notify::NotifSet;
pub use store::{DataStore, Datum};
