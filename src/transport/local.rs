//! In-process group: every rank is a thread, windows and mailboxes live behind
//! `Arc`s shared by the whole group.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{trace, warn};

use super::{Communicator, Layout, Message, Rank, Result, Source, Tag, TransportError};

/// Operations that can be made to fail with [`LocalComm::fail_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    CreateWindow,
    FreeWindow,
    LockExclusive,
    Unlock,
    Get,
    Put,
    Send,
    Recv,
}

struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
}

#[derive(Default)]
struct Arrivals {
    count: usize,
    generation: u64,
}

struct GroupBarrier {
    arrivals: Mutex<Arrivals>,
    all_arrived: Condvar,
}

struct Shared {
    size: usize,
    barrier: GroupBarrier,
    mailboxes: Vec<Mailbox>,
    // Windows published by their owner, waiting for the rest of the group to attach.
    published: Mutex<HashMap<u64, Arc<Region>>>,
    // Every window ever created, so an abort can wake ranks waiting on an epoch.
    regions: Mutex<Vec<Weak<Region>>>,
    aborted: AtomicBool,
    latency: Option<Duration>,
    sent: AtomicUsize,
}

impl Shared {
    fn check_alive(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(TransportError::Aborted)
        } else {
            Ok(())
        }
    }

    fn barrier(&self) -> Result<()> {
        let mut arrivals = self.barrier.arrivals.lock();
        self.check_alive()?;
        arrivals.count += 1;
        if arrivals.count == self.size {
            arrivals.count = 0;
            arrivals.generation += 1;
            self.barrier.all_arrived.notify_all();
            return Ok(());
        }
        let generation = arrivals.generation;
        while arrivals.generation == generation {
            self.check_alive()?;
            self.barrier.all_arrived.wait(&mut arrivals);
        }
        Ok(())
    }

    // Flag first, then take each lock before notifying: a waiter either saw the
    // flag before sleeping or is asleep and gets the notification.
    fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _arrivals = self.barrier.arrivals.lock();
            self.barrier.all_arrived.notify_all();
        }
        for mailbox in &self.mailboxes {
            let _queue = mailbox.queue.lock();
            mailbox.ready.notify_all();
        }
        for region in self.regions.lock().iter().filter_map(Weak::upgrade) {
            let _holder = region.holder.lock();
            region.released.notify_all();
        }
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < self.size {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }

    fn delay(&self) {
        if let Some(max) = self.latency {
            let us = rand::thread_rng().gen_range(0..=max_micros(max));
            thread::sleep(Duration::from_micros(us));
        }
    }
}

fn max_micros(max: Duration) -> u64 {
    u64::try_from(max.as_micros()).unwrap_or(u64::MAX)
}

struct Region {
    owner: Rank,
    // None once the window is freed
    data: Mutex<Option<Vec<u8>>>,
    holder: Mutex<Option<Rank>>,
    released: Condvar,
}

#[derive(Default)]
struct Faults(Mutex<Vec<Op>>);

impl Faults {
    fn check(&self, op: Op) -> Result<()> {
        let mut pending = self.0.lock();
        match pending.iter().position(|&o| o == op) {
            Some(i) => {
                pending.remove(i);
                Err(TransportError::Injected(op))
            }
            None => Ok(()),
        }
    }
}

/// A group of `size` in-process ranks.
pub struct LocalGroup {
    comms: Vec<LocalComm>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        Self::build(size, None)
    }

    /// Every epoch is held for a random duration up to `max`, which widens the
    /// windows in which ranks race each other.
    pub fn with_latency(size: usize, max: Duration) -> Self {
        Self::build(size, Some(max))
    }

    fn build(size: usize, latency: Option<Duration>) -> Self {
        assert!(size > 0, "Expect a group of at least one rank");
        let shared = Arc::new(Shared {
            size,
            barrier: GroupBarrier {
                arrivals: Mutex::new(Arrivals::default()),
                all_arrived: Condvar::new(),
            },
            mailboxes: (0..size)
                .map(|_| Mailbox {
                    queue: Mutex::new(VecDeque::new()),
                    ready: Condvar::new(),
                })
                .collect(),
            published: Mutex::new(HashMap::new()),
            regions: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            latency,
            sent: AtomicUsize::new(0),
        });
        Self {
            comms: (0..size)
                .map(|rank| LocalComm {
                    rank,
                    shared: shared.clone(),
                    collectives: AtomicU64::new(0),
                    faults: Arc::default(),
                })
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.comms.len()
    }

    pub fn into_comms(self) -> Vec<LocalComm> {
        self.comms
    }

    /// Runs `f` once per rank, each on its own thread, and returns the results
    /// in rank order. A rank that panics aborts the group, so its peers fail
    /// instead of waiting for it forever.
    pub fn run<F, R>(self, f: F) -> anyhow::Result<Vec<R>>
    where
        F: Fn(&LocalComm) -> R + Sync,
        R: Send,
    {
        let f = &f;
        thread::scope(|s| -> anyhow::Result<Vec<R>> {
            let handles = self
                .comms
                .into_iter()
                .map(|comm| {
                    thread::Builder::new()
                        .name(format!("rank-{}", comm.rank))
                        .spawn_scoped(s, move || {
                            let _abort = AbortOnPanic(&comm);
                            f(&comm)
                        })
                })
                .collect::<std::io::Result<Vec<_>>>()?;
            // join everyone before reporting, a panicked thread left unjoined
            // would make the scope itself panic
            let joined: Vec<_> = handles
                .into_iter()
                .enumerate()
                .map(|(rank, h)| {
                    h.join().map_err(|e| {
                        let msg = e
                            .downcast_ref::<String>()
                            .map(String::as_str)
                            .or_else(|| e.downcast_ref::<&str>().copied())
                            .unwrap_or("unknown panic");
                        anyhow!("rank {rank} panicked: {msg}")
                    })
                })
                .collect();
            joined.into_iter().collect()
        })
    }
}

struct AbortOnPanic<'a>(&'a LocalComm);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

pub struct LocalComm {
    rank: Rank,
    shared: Arc<Shared>,
    // Collective calls are issued in the same order on every rank, so this counter
    // names the same window on all of them.
    collectives: AtomicU64,
    faults: Arc<Faults>,
}

impl LocalComm {
    /// The next call of `op` on this rank, or on a window it created, fails.
    pub fn fail_next(&self, op: Op) {
        self.faults.0.lock().push(op);
    }

    /// Messages sent by the whole group so far.
    pub fn messages_sent(&self) -> usize {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Messages delivered to this rank and not yet received.
    pub fn pending_messages(&self) -> usize {
        self.shared.mailboxes[self.rank].queue.lock().len()
    }

    fn next_collective(&self) -> u64 {
        self.collectives.fetch_add(1, Ordering::Relaxed)
    }
}

impl Communicator for LocalComm {
    type Window = LocalWindow;

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier()
    }

    fn abort(&self) {
        warn!(rank = self.rank, "aborting group");
        self.shared.abort();
    }

    fn create_window(&self, owner: Rank, len: usize) -> Result<LocalWindow> {
        self.faults.check(Op::CreateWindow)?;
        self.shared.check_alive()?;
        self.shared.check_rank(owner)?;
        let id = self.next_collective();

        if self.rank == owner {
            let region = Arc::new(Region {
                owner,
                data: Mutex::new(Some(vec![0; len])),
                holder: Mutex::new(None),
                released: Condvar::new(),
            });
            self.shared.regions.lock().push(Arc::downgrade(&region));
            self.shared.published.lock().insert(id, region);
        }
        self.barrier()?;
        let region = self.shared.published.lock().get(&id).cloned();
        self.barrier()?;
        if self.rank == owner {
            self.shared.published.lock().remove(&id);
        }

        let region = region.ok_or_else(|| {
            TransportError::CollectiveMismatch(format!("rank {owner} published no window"))
        })?;
        if region.owner != owner {
            return Err(TransportError::CollectiveMismatch(format!(
                "owner {owner} given, window owned by {}",
                region.owner
            )));
        }
        if self.rank != owner && len != 0 {
            return Err(TransportError::CollectiveMismatch(format!(
                "rank {} is not the owner but exposes {len} bytes",
                self.rank
            )));
        }
        trace!(rank = self.rank, owner, id, "window created");
        Ok(LocalWindow {
            rank: self.rank,
            region,
            shared: self.shared.clone(),
            faults: self.faults.clone(),
        })
    }

    fn free_window(&self, window: LocalWindow) -> Result<()> {
        self.faults.check(Op::FreeWindow)?;
        self.next_collective();
        self.barrier()?;
        if self.rank == window.region.owner {
            window.region.data.lock().take();
        }
        trace!(rank = self.rank, owner = window.region.owner, "window freed");
        Ok(())
    }

    fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.faults.check(Op::Send)?;
        self.shared.check_alive()?;
        self.shared.check_rank(dest)?;
        let mailbox = &self.shared.mailboxes[dest];
        mailbox.queue.lock().push_back(Message {
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        });
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        mailbox.ready.notify_all();
        Ok(())
    }

    fn recv(&self, source: Source, tag: Tag) -> Result<Message> {
        self.faults.check(Op::Recv)?;
        if let Source::Rank(r) = source {
            self.shared.check_rank(r)?;
        }
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock();
        loop {
            self.shared.check_alive()?;
            let pos = queue
                .iter()
                .position(|m| m.tag == tag && source.matches(m.source));
            if let Some(msg) = pos.and_then(|pos| queue.remove(pos)) {
                return Ok(msg);
            }
            mailbox.ready.wait(&mut queue);
        }
    }
}

pub struct LocalWindow {
    rank: Rank,
    region: Arc<Region>,
    shared: Arc<Shared>,
    faults: Arc<Faults>,
}

impl LocalWindow {
    /// Copy of the owner's bytes, read without an epoch. `None` once freed.
    pub fn peek(&self) -> Option<Vec<u8>> {
        self.region.data.lock().clone()
    }

    fn check_target(&self, target: Rank) -> Result<()> {
        self.shared.check_rank(target)?;
        if target != self.region.owner {
            return Err(TransportError::NotExposed { target });
        }
        Ok(())
    }

    fn check_epoch(&self, target: Rank) -> Result<()> {
        if *self.region.holder.lock() == Some(self.rank) {
            Ok(())
        } else {
            Err(TransportError::NoEpoch { target })
        }
    }
}

fn bounds(range: &std::ops::Range<usize>, len: usize) -> Result<()> {
    if range.end <= len {
        Ok(())
    } else {
        Err(TransportError::OutOfBounds {
            start: range.start,
            end: range.end,
            len,
        })
    }
}

impl super::Window for LocalWindow {
    fn owner(&self) -> Rank {
        self.region.owner
    }

    fn lock_exclusive(&self, target: Rank) -> Result<()> {
        self.faults.check(Op::LockExclusive)?;
        self.shared.check_alive()?;
        self.check_target(target)?;
        if self.region.data.lock().is_none() {
            return Err(TransportError::WindowFreed);
        }
        let mut holder = self.region.holder.lock();
        if *holder == Some(self.rank) {
            return Err(TransportError::EpochAlreadyOpen {
                origin: self.rank,
                target,
            });
        }
        while holder.is_some() {
            self.shared.check_alive()?;
            self.region.released.wait(&mut holder);
        }
        *holder = Some(self.rank);
        drop(holder);
        trace!(rank = self.rank, target, "epoch opened");
        self.shared.delay();
        Ok(())
    }

    fn unlock(&self, target: Rank) -> Result<()> {
        self.faults.check(Op::Unlock)?;
        self.check_target(target)?;
        self.shared.delay();
        let mut holder = self.region.holder.lock();
        if *holder != Some(self.rank) {
            return Err(TransportError::NoEpoch { target });
        }
        *holder = None;
        drop(holder);
        self.region.released.notify_one();
        trace!(rank = self.rank, target, "epoch closed");
        Ok(())
    }

    fn get(&self, target: Rank, dst: &mut [u8], layout: &dyn Layout) -> Result<()> {
        self.faults.check(Op::Get)?;
        self.check_target(target)?;
        self.check_epoch(target)?;
        if dst.len() != layout.len() {
            return Err(TransportError::LengthMismatch {
                expected: layout.len(),
                actual: dst.len(),
            });
        }
        let data = self.region.data.lock();
        let data = data.as_ref().ok_or(TransportError::WindowFreed)?;
        let mut at = 0;
        for block in layout.blocks() {
            bounds(&block, data.len())?;
            dst[at..at + block.len()].copy_from_slice(&data[block.clone()]);
            at += block.len();
        }
        Ok(())
    }

    fn put(&self, target: Rank, offset: usize, src: &[u8]) -> Result<()> {
        self.faults.check(Op::Put)?;
        self.check_target(target)?;
        self.check_epoch(target)?;
        let mut data = self.region.data.lock();
        let data = data.as_mut().ok_or(TransportError::WindowFreed)?;
        let range = offset..offset + src.len();
        bounds(&range, data.len())?;
        data[range].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::transport::{
        local::{max_micros, LocalGroup, Op},
        Communicator, Layout, Source, TransportError, Window,
    };
    use std::ops::Range;

    struct Blocks(Vec<Range<usize>>);
    impl Layout for Blocks {
        fn blocks(&self) -> Box<dyn Iterator<Item = Range<usize>> + '_> {
            Box::new(self.0.iter().cloned())
        }
    }

    #[test]
    fn send_before_recv_is_buffered() {
        let out = LocalGroup::new(2)
            .run(|comm| {
                if comm.rank() == 0 {
                    comm.send(1, 7, b"hi").unwrap();
                    comm.barrier().unwrap();
                    None
                } else {
                    // sender is already done before we post the receive
                    comm.barrier().unwrap();
                    Some(comm.recv(Source::Any, 7).unwrap())
                }
            })
            .unwrap();
        let msg = out[1].as_ref().unwrap();
        assert_eq!(msg.source, 0);
        assert_eq!(msg.payload, b"hi");
    }

    #[test]
    fn recv_matches_tag_and_source() {
        let mut comms = LocalGroup::new(3).into_comms();
        let c2 = comms.pop().unwrap();
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();
        c1.send(0, 1, b"a").unwrap();
        c2.send(0, 2, b"b").unwrap();
        c1.send(0, 2, b"c").unwrap();
        c1.send(0, 2, b"d").unwrap();

        assert_eq!(c0.recv(Source::Rank(1), 2).unwrap().payload, b"c");
        assert_eq!(c0.recv(Source::Any, 2).unwrap().payload, b"b");
        assert_eq!(c0.recv(Source::Any, 2).unwrap().payload, b"d");
        assert_eq!(c0.recv(Source::Rank(1), 1).unwrap().payload, b"a");
        assert_eq!(c0.pending_messages(), 0);
        assert_eq!(c0.messages_sent(), 4);
    }

    #[test]
    fn access_requires_epoch() {
        let comms = LocalGroup::new(1).into_comms();
        let comm = &comms[0];
        let win = comm.create_window(0, 4).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            win.put(0, 0, &[1]),
            Err(TransportError::NoEpoch { target: 0 })
        );
        assert_eq!(
            win.get(0, &mut buf, &Blocks(vec![0..1])),
            Err(TransportError::NoEpoch { target: 0 })
        );
        assert_eq!(win.unlock(0), Err(TransportError::NoEpoch { target: 0 }));

        win.lock_exclusive(0).unwrap();
        assert_eq!(
            win.lock_exclusive(0),
            Err(TransportError::EpochAlreadyOpen {
                origin: 0,
                target: 0
            })
        );
        win.unlock(0).unwrap();
        comm.free_window(win).unwrap();
    }

    #[test]
    fn gather_and_bounds() {
        let comms = LocalGroup::new(1).into_comms();
        let comm = &comms[0];
        let win = comm.create_window(0, 5).unwrap();
        win.lock_exclusive(0).unwrap();
        win.put(0, 0, &[1, 2, 3, 4, 5]).unwrap();
        let mut buf = [0u8; 3];
        win.get(0, &mut buf, &Blocks(vec![0..1, 3..5])).unwrap();
        assert_eq!(buf, [1, 4, 5]);
        assert_eq!(
            win.put(0, 4, &[9, 9]),
            Err(TransportError::OutOfBounds {
                start: 4,
                end: 6,
                len: 5
            })
        );
        assert_eq!(
            win.get(0, &mut buf, &Blocks(vec![0..1])),
            Err(TransportError::LengthMismatch {
                expected: 1,
                actual: 3
            })
        );
        win.unlock(0).unwrap();
        assert_eq!(win.peek(), Some(vec![1, 2, 3, 4, 5]));
        comm.free_window(win).unwrap();
    }

    #[test]
    fn only_owner_is_exposed() {
        let out = LocalGroup::new(3)
            .run(|comm| {
                let len = if comm.rank() == 1 { 3 } else { 0 };
                let win = comm.create_window(1, len).unwrap();
                assert_eq!(win.owner(), 1);
                let err = win.lock_exclusive(2).err();
                comm.free_window(win).unwrap();
                err
            })
            .unwrap();
        assert!(out
            .iter()
            .all(|e| *e == Some(TransportError::NotExposed { target: 2 })));
    }

    #[test]
    fn non_owner_exposing_memory_is_a_mismatch() {
        let out = LocalGroup::new(2)
            .run(|comm| comm.create_window(0, 2).map(|_| ()))
            .unwrap();
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(TransportError::CollectiveMismatch(_))));
    }

    #[test]
    fn epochs_never_overlap() {
        const N: usize = 4;
        const WORK: usize = 200;
        let out = LocalGroup::new(N)
            .run(|comm| {
                let len = if comm.rank() == 0 { 1 } else { 0 };
                let win = comm.create_window(0, len).unwrap();
                for _ in 0..WORK {
                    // unprotected read-modify-write, only correct if epochs serialize
                    win.lock_exclusive(0).unwrap();
                    let mut b = [0u8; 1];
                    win.get(0, &mut b, &Blocks(vec![0..1])).unwrap();
                    std::thread::yield_now();
                    win.put(0, 0, &[b[0].wrapping_add(1)]).unwrap();
                    win.unlock(0).unwrap();
                }
                comm.barrier().unwrap();
                let seen = win.peek();
                comm.free_window(win).unwrap();
                seen
            })
            .unwrap();
        assert_eq!(out[0], Some(vec![((N * WORK) % 256) as u8]));
    }

    #[test]
    fn injected_fault_fires_once() {
        let comms = LocalGroup::new(1).into_comms();
        let comm = &comms[0];
        let win = comm.create_window(0, 1).unwrap();
        comm.fail_next(Op::LockExclusive);
        assert_eq!(
            win.lock_exclusive(0),
            Err(TransportError::Injected(Op::LockExclusive))
        );
        win.lock_exclusive(0).unwrap();
        win.unlock(0).unwrap();
        comm.free_window(win).unwrap();
    }

    #[test]
    fn rank_panic_is_reported() {
        let err = LocalGroup::new(2)
            .run(|comm| {
                if comm.rank() == 1 {
                    panic!("boom");
                }
                // rank 1 never arrives
                assert_eq!(comm.barrier(), Err(TransportError::Aborted));
            })
            .unwrap_err();
        assert!(err.to_string().contains("rank 1 panicked: boom"));
    }

    #[test]
    fn abort_wakes_blocked_peers() {
        let out = LocalGroup::new(4)
            .run(|comm| {
                let len = if comm.rank() == 0 { 1 } else { 0 };
                let win = comm.create_window(0, len).unwrap();
                if comm.rank() == 2 {
                    win.lock_exclusive(0).unwrap();
                }
                comm.barrier().unwrap();
                match comm.rank() {
                    0 => comm.recv(Source::Any, 9).map(|_| ()),
                    1 => win.lock_exclusive(0),
                    2 => {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        comm.abort();
                        Ok(())
                    }
                    _ => comm.barrier(),
                }
            })
            .unwrap();
        assert_eq!(
            out,
            vec![
                Err(TransportError::Aborted),
                Err(TransportError::Aborted),
                Ok(()),
                Err(TransportError::Aborted),
            ]
        );
    }

    #[test]
    fn latency_bound_saturates() {
        use std::time::Duration;
        assert_eq!(max_micros(Duration::from_millis(3)), 3_000);
        assert_eq!(max_micros(Duration::ZERO), 0);
        assert_eq!(max_micros(Duration::MAX), u64::MAX);
    }

    #[test]
    fn calls_after_abort_fail() {
        let comms = LocalGroup::new(2).into_comms();
        comms[1].abort();
        assert_eq!(comms[0].send(1, 0, &[]), Err(TransportError::Aborted));
        assert_eq!(
            comms[0].recv(Source::Any, 0).err(),
            Some(TransportError::Aborted)
        );
        assert_eq!(
            comms[0].create_window(0, 2).err(),
            Some(TransportError::Aborted)
        );
    }
}
