//! Fan-out/fan-in bookkeeping for request broadcasts.
//!
//! A coordination is registered with the correlation id of the broadcast,
//! the destinations a reply is expected from, and a completion policy.
//! Replies and failure notices whittle the outstanding set down; the
//! policy runs exactly once, when the last destination is accounted for.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use xatmi_core::protocol::ProcessHandle;

type Policy<R> = Box<dyn FnOnce(Vec<R>, Vec<ProcessHandle>) + Send>;

struct Pending<R> {
    outstanding: Vec<ProcessHandle>,
    received: Vec<R>,
    failed: Vec<ProcessHandle>,
    policy: Policy<R>,
}

impl<R> Pending<R> {
    fn finished(self) {
        (self.policy)(self.received, self.failed);
    }
}

/// Tracks every in-flight broadcast and completes each exactly once.
///
/// Destinations are process handles and may repeat: a broadcast that
/// expects two replies from the same process lists it twice, and each
/// reply retires one slot.
pub struct Coordinate<R> {
    pending: HashMap<Uuid, Pending<R>>,
}

impl<R> Default for Coordinate<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Coordinate<R> {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Number of broadcasts still awaiting replies.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true when no broadcast is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registers a broadcast.
    ///
    /// With no destinations the policy runs before this call returns,
    /// with empty reply and failure sets.
    pub fn add<F>(&mut self, correlation: Uuid, destinations: Vec<ProcessHandle>, policy: F)
    where
        F: FnOnce(Vec<R>, Vec<ProcessHandle>) + Send + 'static,
    {
        let pending = Pending {
            outstanding: destinations,
            received: Vec::new(),
            failed: Vec::new(),
            policy: Box::new(policy),
        };
        if pending.outstanding.is_empty() {
            debug!(%correlation, "broadcast with no destinations completes immediately");
            pending.finished();
            return;
        }
        self.pending.insert(correlation, pending);
    }

    /// Records one reply.
    ///
    /// A reply for an unknown correlation, or from a process no reply is
    /// outstanding from, is logged and discarded.
    pub fn accumulate(&mut self, correlation: Uuid, process: ProcessHandle, reply: R) {
        let Some(pending) = self.pending.get_mut(&correlation) else {
            debug!(%correlation, %process, "reply for unknown or completed broadcast discarded");
            return;
        };
        let Some(slot) = pending.outstanding.iter().position(|p| *p == process) else {
            warn!(%correlation, %process, "unexpected reply discarded");
            return;
        };
        pending.outstanding.remove(slot);
        pending.received.push(reply);
        self.complete_if_done(correlation);
    }

    /// Records the death of a process.
    ///
    /// Every outstanding slot held by that process, in every broadcast,
    /// moves to the failed set.
    pub fn failed(&mut self, process: ProcessHandle) {
        let affected: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.outstanding.contains(&process))
            .map(|(correlation, _)| *correlation)
            .collect();

        for correlation in affected {
            if let Some(pending) = self.pending.get_mut(&correlation) {
                let before = pending.outstanding.len();
                pending.outstanding.retain(|p| *p != process);
                for _ in 0..before - pending.outstanding.len() {
                    pending.failed.push(process);
                }
                warn!(%correlation, %process, "destination failed before replying");
            }
            self.complete_if_done(correlation);
        }
    }

    /// Records a send failure to one destination of one broadcast.
    ///
    /// Used when dispatch itself fails, so the slot is never waited on.
    pub fn failed_send(&mut self, correlation: Uuid, process: ProcessHandle) {
        let Some(pending) = self.pending.get_mut(&correlation) else {
            return;
        };
        if let Some(slot) = pending.outstanding.iter().position(|p| *p == process) {
            pending.outstanding.remove(slot);
            pending.failed.push(process);
        }
        self.complete_if_done(correlation);
    }

    fn complete_if_done(&mut self, correlation: Uuid) {
        let done = self
            .pending
            .get(&correlation)
            .map_or(false, |pending| pending.outstanding.is_empty());
        if done {
            if let Some(pending) = self.pending.remove(&correlation) {
                pending.finished();
            }
        }
    }
}
