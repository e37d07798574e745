//! Tagged message transport between ranks
//!
//! [`Transport`] is the point-to-point plus one-to-all interface the
//! pipelines communicate through. Sends never block; receives block until the
//! matching message arrives or the transport is aborted.
//!
//! [`LocalFabric`] runs every rank as a thread of the current process, which
//! is how multi-rank runs are exercised in tests and benchmarks.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Message family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Tile broadcast
    Tile,
    /// Panel tiles sent to the diagonal owner
    Gather,
    /// Pivot records
    Pivot,
    /// Row interchange inside the pipeline
    RowSwap,
    /// Row interchange left of the panel, after the pipeline
    DeferredSwap,
}

/// Message tag: block index, family, update offset and item index
///
/// Two messages between the same pair of ranks must never share a tag while
/// both are in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub stage: usize,
    pub channel: Channel,
    pub offset: usize,
    pub index: usize,
}

impl Tag {
    pub fn new(stage: usize, channel: Channel, offset: usize, index: usize) -> Self {
        Self {
            stage,
            channel,
            offset,
            index,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[stage {}, offset {}, index {}]",
            self.channel, self.stage, self.offset, self.index
        )
    }
}

/// Communication between the ranks of one run
pub trait Transport: Send + Sync {
    /// This process
    fn rank(&self) -> usize;

    /// Number of processes
    fn size(&self) -> usize;

    /// Queue a message for `dest`; never blocks
    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<()>;

    /// Block until the message `(source, tag)` arrives
    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>>;

    /// Collective one-to-all: every rank returns the root's payload
    ///
    /// Non-root ranks pass an empty payload.
    fn broadcast_all(&self, root: usize, tag: Tag, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send(dest, tag, payload.clone())
                    .map_err(|e| relabel(e, "broadcast_all"))?;
            }
            Ok(payload)
        } else {
            self.recv(root, tag).map_err(|e| relabel(e, "broadcast_all"))
        }
    }

    /// Fail every pending and future operation on all ranks
    fn abort(&self, reason: &str);

    fn is_aborted(&self) -> bool;
}

fn relabel(err: Error, operation: &'static str) -> Error {
    match err {
        Error::Transport { stage, reason, .. } => Error::Transport {
            operation,
            stage,
            reason,
        },
        other => other,
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<HashMap<(usize, Tag), VecDeque<Vec<u8>>>>,
    arrived: Condvar,
}

#[derive(Debug, Default)]
struct RankCounters {
    messages: AtomicUsize,
    bytes: AtomicUsize,
}

#[derive(Debug)]
struct Fabric {
    mailboxes: Vec<Mailbox>,
    counters: Vec<RankCounters>,
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Traffic sent by one rank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: usize,
    pub bytes_sent: usize,
}

/// In-process transport connecting `size` ranks
pub struct LocalFabric;

impl LocalFabric {
    /// One endpoint per rank
    pub fn endpoints(size: usize) -> Vec<LocalEndpoint> {
        let fabric = Arc::new(Fabric {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            counters: (0..size).map(|_| RankCounters::default()).collect(),
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
        });
        (0..size)
            .map(|rank| LocalEndpoint {
                rank,
                fabric: Arc::clone(&fabric),
            })
            .collect()
    }

    /// Run `f` once per rank on its own thread and collect the results
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LocalEndpoint) -> R + Sync,
    {
        let endpoints = Self::endpoints(size);
        std::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    let f = &f;
                    scope.spawn(move || f(endpoint))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

/// One rank's connection to a [`LocalFabric`]
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    rank: usize,
    fabric: Arc<Fabric>,
}

impl LocalEndpoint {
    pub fn stats(&self) -> TransportStats {
        let counters = &self.fabric.counters[self.rank];
        TransportStats {
            messages_sent: counters.messages.load(Ordering::Relaxed),
            bytes_sent: counters.bytes.load(Ordering::Relaxed),
        }
    }

    fn abort_reason(&self) -> String {
        self.fabric
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| "transport aborted".to_string())
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.mailboxes.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<()> {
        if self.fabric.aborted.load(Ordering::Acquire) {
            return Err(Error::transport("send", tag.stage, self.abort_reason()));
        }
        let mailbox = self.fabric.mailboxes.get(dest).ok_or_else(|| {
            Error::InvalidParameter(format!("send to rank {dest} of {}", self.size()))
        })?;
        let counters = &self.fabric.counters[self.rank];
        counters.messages.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(payload.len(), Ordering::Relaxed);
        let mut queue = mailbox.queue.lock();
        queue.entry((self.rank, tag)).or_default().push_back(payload);
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        if source >= self.size() {
            return Err(Error::InvalidParameter(format!(
                "receive from rank {source} of {}",
                self.size()
            )));
        }
        let mailbox = &self.fabric.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock();
        loop {
            if let Some(messages) = queue.get_mut(&(source, tag)) {
                if let Some(payload) = messages.pop_front() {
                    if messages.is_empty() {
                        queue.remove(&(source, tag));
                    }
                    return Ok(payload);
                }
            }
            if self.fabric.aborted.load(Ordering::Acquire) {
                drop(queue);
                return Err(Error::transport(
                    "recv",
                    tag.stage,
                    format!("{} while waiting for {tag} from rank {source}", self.abort_reason()),
                ));
            }
            mailbox.arrived.wait(&mut queue);
        }
    }

    fn abort(&self, reason: &str) {
        {
            let mut stored = self.fabric.reason.lock();
            if stored.is_none() {
                *stored = Some(format!("rank {} aborted: {reason}", self.rank));
            }
        }
        self.fabric.aborted.store(true, Ordering::Release);
        for mailbox in &self.fabric.mailboxes {
            let _queue = mailbox.queue.lock();
            mailbox.arrived.notify_all();
        }
        tracing::warn!(rank = self.rank, reason, "transport aborted");
    }

    fn is_aborted(&self) -> bool {
        self.fabric.aborted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_to_point() {
        let results = LocalFabric::run(2, |ep| {
            let tag = Tag::new(0, Channel::Tile, 0, 7);
            if ep.rank() == 0 {
                ep.send(1, tag, vec![1, 2, 3]).unwrap();
                ep.recv(1, tag).unwrap()
            } else {
                let got = ep.recv(0, tag).unwrap();
                ep.send(0, tag, got.iter().map(|b| b * 2).collect()).unwrap();
                got
            }
        });
        assert_eq!(results, vec![vec![2, 4, 6], vec![1, 2, 3]]);
    }

    #[test]
    fn test_tags_do_not_mix() {
        let eps = LocalFabric::endpoints(2);
        let a = Tag::new(1, Channel::RowSwap, 0, 0);
        let b = Tag::new(1, Channel::RowSwap, 1, 0);
        eps[0].send(1, a, vec![1]).unwrap();
        eps[0].send(1, b, vec![2]).unwrap();
        assert_eq!(eps[1].recv(0, b).unwrap(), vec![2]);
        assert_eq!(eps[1].recv(0, a).unwrap(), vec![1]);
        assert_eq!(eps[0].stats().messages_sent, 2);
        assert_eq!(eps[0].stats().bytes_sent, 2);
    }

    #[test]
    fn test_broadcast_all() {
        let results = LocalFabric::run(4, |ep| {
            let payload = if ep.rank() == 2 { vec![9, 9] } else { Vec::new() };
            ep.broadcast_all(2, Tag::new(3, Channel::Pivot, 0, 0), payload)
                .unwrap()
        });
        assert!(results.iter().all(|r| r == &vec![9, 9]));
    }

    #[test]
    fn test_abort_wakes_receivers() {
        let results = LocalFabric::run(3, |ep| {
            if ep.rank() == 0 {
                std::thread::sleep(std::time::Duration::from_millis(20));
                ep.abort("panel failed");
                Ok(Vec::new())
            } else {
                ep.recv(0, Tag::new(5, Channel::Tile, 0, 0))
            }
        });
        for result in &results[1..] {
            match result {
                Err(Error::Transport {
                    operation, stage, reason,
                }) => {
                    assert_eq!(*operation, "recv");
                    assert_eq!(*stage, 5);
                    assert!(reason.contains("panel failed"));
                }
                other => panic!("expected transport error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_send_after_abort_fails() {
        let eps = LocalFabric::endpoints(2);
        eps[1].abort("bye");
        assert!(eps[0].is_aborted());
        assert!(matches!(
            eps[0].send(1, Tag::new(0, Channel::Gather, 0, 0), vec![]),
            Err(Error::Transport { operation: "send", .. })
        ));
    }
}
