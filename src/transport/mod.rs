//! One-sided communication contract the lock protocol runs on.
//!
//! A [`Communicator`] is one member of a fixed group of processes. It can expose
//! memory to the group as a [`Window`] and exchange tagged point-to-point
//! messages. Windows are only accessed inside an exclusive epoch
//! (`lock_exclusive` .. `unlock`), and epochs from different ranks against the
//! same target never overlap.

pub mod local;

use std::ops::Range;

use thiserror::Error;

pub type Rank = usize;
pub type Tag = u32;

/// Tag reserved for lock hand-off notifications.
pub const UNLOCK_TAG: Tag = 0xBEEF;

/// Source filter for [`Communicator::recv`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Rank(Rank),
    Any,
}

impl Source {
    pub fn matches(&self, rank: Rank) -> bool {
        match self {
            Source::Rank(r) => *r == rank,
            Source::Any => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rank {rank} is outside a group of {size}")]
    InvalidRank { rank: Rank, size: usize },
    #[error("access to rank {target} outside of an exclusive epoch")]
    NoEpoch { target: Rank },
    #[error("rank {origin} already holds an epoch on rank {target}")]
    EpochAlreadyOpen { origin: Rank, target: Rank },
    #[error("rank {target} exposes no memory in this window")]
    NotExposed { target: Rank },
    #[error("byte range {start}..{end} exceeds window of {len} bytes")]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[error("buffer of {actual} bytes does not fit a layout of {expected} bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("collective call mismatch: {0}")]
    CollectiveMismatch(String),
    #[error("window has been freed")]
    WindowFreed,
    #[error("group aborted")]
    Aborted,
    #[error("injected failure in {0:?}")]
    Injected(local::Op),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Which bytes of a window a gather reads.
///
/// Implemented by layouts that describe a window as a list of disjoint,
/// ascending byte blocks.
pub trait Layout {
    fn blocks(&self) -> Box<dyn Iterator<Item = Range<usize>> + '_>;

    /// Total bytes covered by all blocks.
    fn len(&self) -> usize {
        self.blocks().map(|b| b.len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Communicator {
    type Window: Window;

    fn rank(&self) -> Rank;
    fn size(&self) -> usize;

    /// Blocks until every rank of the group has called `barrier`.
    fn barrier(&self) -> Result<()>;

    /// Ends the whole group. Calls blocked on any rank, and every later call,
    /// fail with [`TransportError::Aborted`].
    fn abort(&self);

    /// Collective. `owner` exposes `len` zeroed bytes, every other rank must pass 0.
    fn create_window(&self, owner: Rank, len: usize) -> Result<Self::Window>;

    /// Collective. Returns once every rank has released its handle.
    fn free_window(&self, window: Self::Window) -> Result<()>;

    /// Never waits for a matching receive.
    fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Blocks until a message from `source` with `tag` arrives. Messages from the
    /// same sender and tag are received in the order they were sent.
    fn recv(&self, source: Source, tag: Tag) -> Result<Message>;
}

pub trait Window {
    fn owner(&self) -> Rank;

    /// Opens an exclusive epoch on `target`; waits while another rank holds one.
    fn lock_exclusive(&self, target: Rank) -> Result<()>;

    /// Closes the epoch. Every get/put issued inside it is complete and visible
    /// to the next epoch once this returns.
    fn unlock(&self, target: Rank) -> Result<()>;

    /// Gathers the blocks of `layout` from `target` into `dst`, back to back.
    fn get(&self, target: Rank, dst: &mut [u8], layout: &dyn Layout) -> Result<()>;

    fn put(&self, target: Rank, offset: usize, src: &[u8]) -> Result<()>;
}
