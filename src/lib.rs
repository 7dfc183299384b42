//! Public interface to the taskmill core library, linked by both the server
//! executable and worker-side applications.
//!
//! A taskmill cluster is a fixed set of `N` ranks; the last `S` ranks run
//! the server event loop and the first `N - S` are workers. Servers host
//! the work queues, the shared data store and the checkpoint index; workers
//! submit tasks, retrieve tasks and read/write shared data objects.

#[macro_use]
pub mod utils;

pub mod codec;
pub mod data;
pub mod layout;
pub mod msg;
pub mod server;
pub mod transport;
pub mod worker;
pub mod xpt;

pub use crate::layout::{Layout, Rank, ANY_RANK, NULL_RANK};
pub use crate::msg::{DataError, Status};
pub use crate::server::{Server, ServerConfig};
pub use crate::utils::TaskmillError;
pub use crate::worker::WorkerStub;
