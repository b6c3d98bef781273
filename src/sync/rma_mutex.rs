//! Mutual exclusion over one-sided communication, after the request-queue lock of
//! Latham, Ross and Thakur (2007).
//!
//! One rank, the owner, exposes a byte per group member. A member announces
//! interest by setting its byte inside an exclusive epoch, fetching every other
//! byte in the same epoch. If all of them are clear it holds the lock, otherwise
//! it blocks until a releaser hands the lock over with a zero byte message.
//!
//! Transport failures are fatal: an epoch that fails halfway leaves the request
//! vector in a state no other rank can observe or repair.

use std::{
    cell::{Cell, RefCell},
    ops::Range,
};

use tracing::{debug, error, trace};

use super::{Mutex, MutexGuard};
use crate::transport::{
    Communicator, Layout, Rank, Source, Tag, TransportError, Window, UNLOCK_TAG,
};

const SET: u8 = 1;
const CLEAR: u8 = 0;

/// Every byte of the request vector except the one belonging to `rank`, as at
/// most two ascending blocks `0..rank` and `rank+1..size`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExcludeSelf {
    rank: Rank,
    head: Range<usize>,
    tail: Range<usize>,
}

impl ExcludeSelf {
    pub fn new(rank: Rank, size: usize) -> Self {
        assert!(rank < size, "Expect 0-based rank {rank} < size={size}");
        Self {
            rank,
            head: 0..rank,
            tail: rank + 1..size,
        }
    }

    /// Rank whose flag lands at index `j` of a gathered snapshot.
    pub fn rank_at(&self, j: usize) -> Rank {
        if j < self.rank {
            j
        } else {
            j + 1
        }
    }
}

impl Layout for ExcludeSelf {
    fn blocks(&self) -> Box<dyn Iterator<Item = Range<usize>> + '_> {
        Box::new(
            [self.head.clone(), self.tail.clone()]
                .into_iter()
                .filter(|b| !b.is_empty()),
        )
    }
}

/// Who receives the lock when more than one rank is waiting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Handoff {
    /// Lowest waiting rank first. Can starve high ranks under sustained load.
    #[default]
    LowestRank,
    /// First waiting rank after the releaser, wrapping around. Not part of the
    /// published algorithm: a waiter is passed over at most `size - 1` times.
    RoundRobin,
}

impl Handoff {
    /// Picks the next holder from a snapshot gathered through `slice`.
    pub fn next(&self, slice: &ExcludeSelf, snapshot: &[u8]) -> Option<Rank> {
        let start = match self {
            Handoff::LowestRank => 0,
            // index of rank + 1 in a snapshot that skips `rank`
            Handoff::RoundRobin => slice.rank.min(snapshot.len()),
        };
        (start..snapshot.len())
            .chain(0..start)
            .find(|&j| snapshot[j] != CLEAR)
            .map(|j| slice.rank_at(j))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Options {
    pub owner: Rank,
    /// Tag of hand-off messages. Locks sharing a communicator need distinct tags.
    pub tag: Tag,
    pub handoff: Handoff,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            owner: 0,
            tag: UNLOCK_TAG,
            handoff: Handoff::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Inside the epoch that sets our flag.
    Requesting,
    /// Flag set, lock contested, blocked on the hand-off message.
    Waiting,
    Holding,
    /// Inside the epoch that clears our flag, or handing the lock over.
    Releasing,
}

pub struct RmaMutex<'c, C: Communicator> {
    comm: &'c C,
    window: C::Window,
    owner: Rank,
    rank: Rank,
    size: usize,
    tag: Tag,
    handoff: Handoff,
    slice: ExcludeSelf,
    snapshot: RefCell<Vec<u8>>,
    state: Cell<State>,
}

// The rest of the group cannot tell how far a failed epoch or hand-off got, so
// it goes down with us.
fn fatal<C: Communicator>(comm: &C, op: &str, err: TransportError) -> ! {
    let rank = comm.rank();
    error!(rank, op, %err, "transport failure, aborting group");
    comm.abort();
    panic!("rank {rank}: {op} failed: {err}")
}

impl<'c, C: Communicator> RmaMutex<'c, C> {
    /// Collective. Every rank of `comm` must call it with the same `owner`.
    pub fn init(comm: &'c C, owner: Rank) -> Self {
        Self::with_options(
            comm,
            Options {
                owner,
                ..Options::default()
            },
        )
    }

    /// Collective. Every rank of `comm` must pass the same options.
    pub fn with_options(comm: &'c C, options: Options) -> Self {
        let rank = comm.rank();
        let size = comm.size();
        let len = if rank == options.owner { size } else { 0 };
        let window = comm
            .create_window(options.owner, len)
            .unwrap_or_else(|e| fatal(comm, "create_window", e));
        debug!(rank, size, owner = options.owner, handoff = ?options.handoff, "mutex created");
        Self {
            comm,
            window,
            owner: options.owner,
            rank,
            size,
            tag: options.tag,
            handoff: options.handoff,
            slice: ExcludeSelf::new(rank, size),
            snapshot: RefCell::new(vec![CLEAR; size - 1]),
            state: Cell::new(State::Idle),
        }
    }

    /// Collective. No rank may be holding or waiting for the lock.
    pub fn free(self) {
        let state = self.state.get();
        assert_eq!(
            state,
            State::Idle,
            "rank {} called free while {state:?}",
            self.rank
        );
        let (rank, comm) = (self.rank, self.comm);
        comm.free_window(self.window)
            .unwrap_or_else(|e| fatal(comm, "free_window", e));
        debug!(rank, "mutex freed");
    }

    /// Blocks until this rank holds the lock.
    pub fn lock(&self) {
        self.transition(State::Idle, State::Requesting, "lock");
        let contested = {
            let mut snapshot = self.snapshot.borrow_mut();
            self.exchange(SET, &mut snapshot);
            snapshot.iter().any(|&f| f != CLEAR)
        };
        if contested {
            self.state.set(State::Waiting);
            debug!(rank = self.rank, "lock contested, waiting for hand-off");
            let msg = self
                .comm
                .recv(Source::Any, self.tag)
                .unwrap_or_else(|e| fatal(self.comm, "recv", e));
            trace!(rank = self.rank, from = msg.source, "lock handed over");
        }
        self.state.set(State::Holding);
    }

    /// Releases the lock, handing it to a waiting rank if there is one.
    pub fn unlock(&self) {
        self.transition(State::Holding, State::Releasing, "unlock");
        let next = {
            let mut snapshot = self.snapshot.borrow_mut();
            self.exchange(CLEAR, &mut snapshot);
            self.handoff.next(&self.slice, &snapshot)
        };
        if let Some(next) = next {
            debug!(rank = self.rank, next, "handing lock over");
            self.comm
                .send(next, self.tag, &[])
                .unwrap_or_else(|e| fatal(self.comm, "send", e));
        }
        self.state.set(State::Idle);
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn owner(&self) -> Rank {
        self.owner
    }

    pub fn window(&self) -> &C::Window {
        &self.window
    }

    // One epoch: gather everyone else's flag and write ours.
    fn exchange(&self, flag: u8, snapshot: &mut [u8]) {
        let (rank, owner, comm) = (self.rank, self.owner, self.comm);
        self.window
            .lock_exclusive(owner)
            .unwrap_or_else(|e| fatal(comm, "lock_exclusive", e));
        self.window
            .get(owner, snapshot, &self.slice)
            .unwrap_or_else(|e| fatal(comm, "get", e));
        self.window
            .put(owner, rank, &[flag])
            .unwrap_or_else(|e| fatal(comm, "put", e));
        self.window
            .unlock(owner)
            .unwrap_or_else(|e| fatal(comm, "unlock", e));
        trace!(rank, flag, snapshot = ?snapshot, "request vector exchanged");
    }

    fn transition(&self, from: State, to: State, op: &str) {
        let state = self.state.get();
        assert_eq!(
            state, from,
            "rank {} called {op} while {state:?}",
            self.rank
        );
        self.state.set(to);
    }
}

impl<C: Communicator> Mutex for RmaMutex<'_, C> {
    type Output = Self;
    fn acquire(&self) -> MutexGuard<'_, Self::Output> {
        self.lock();
        MutexGuard::new(self)
    }
    fn release(&self) {
        self.unlock()
    }
}
