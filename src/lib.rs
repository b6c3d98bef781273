//! Distributed mutual exclusion for a fixed group of processes that share no
//! memory and only talk through one-sided window access and tagged messages.

pub mod sync;
pub mod transport;

pub use sync::rma_mutex::{Handoff, Options, RmaMutex, State};
pub use sync::{Mutex, MutexGuard};
pub use transport::{Communicator, Window, UNLOCK_TAG};
