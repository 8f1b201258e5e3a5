//! The transaction manager: owns the transaction table and drives
//! two-phase commit across resource branches and subordinate domains.
//!
//! The manager is a single task. Directives fan out through an
//! [`Outbound`] seam under one correlation id per phase; replies flow
//! back through the manager's inbound channel and are folded in by the
//! broadcast bookkeeping. Durability discipline: the decision is written
//! to the log before the first directive of the decided phase leaves the
//! process.

mod state;

pub use state::{
    Instance, InstanceSnapshot, InstanceState, PendingRequests, Resource, ResourceSnapshot, Stat,
    State,
};

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use xatmi_core::protocol::{DirectiveReply, DirectiveRequest, Message, ProcessHandle, ResourceId};
use xatmi_core::xa::{
    vote_is_ok, Xid, XA_OK, XA_RBBASE, XA_RBEND, XA_RBROLLBACK, XA_TMNOFLAGS, XAER_NOTA,
    XAER_PROTO,
};
use xatmi_core::{Result, XatmiError};

use crate::config::ManagerConfig;
use crate::coordinate::Coordinate;
use crate::log::{BranchRecord, Decision, Log, LogStore};
use crate::transport::{Inbound, Transport};

/// Where directives leave the manager.
///
/// Production wires this to the [`Transport`]; tests substitute an
/// implementation that scripts replies and observes dispatch order.
#[async_trait]
pub trait Outbound: Send {
    /// Delivers one message to one destination under the given
    /// correlation.
    async fn dispatch(
        &self,
        destination: ProcessHandle,
        correlation: Uuid,
        message: Message,
    ) -> Result<()>;
}

#[async_trait]
impl Outbound for Transport {
    async fn dispatch(
        &self,
        destination: ProcessHandle,
        correlation: Uuid,
        message: Message,
    ) -> Result<()> {
        self.send_correlated(destination, correlation, &message)
    }
}

/// Coordinator-side lifecycle of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Open for work and new participants.
    Active,
    /// Prepare directives are in flight.
    Preparing,
    /// Every branch voted yes; the commit decision is durable.
    Prepared,
    /// Commit directives are in flight.
    Committing,
    /// The decision to roll back has been taken.
    Aborting,
    /// Rollback directives are in flight.
    RollingBack,
    /// All branches reached the decided outcome.
    Completed,
}

/// One enlisted participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participant {
    /// A resource branch served by one proxy instance.
    Resource {
        /// Configured resource id.
        resource: ResourceId,
        /// The proxy instance holding the branch.
        process: ProcessHandle,
    },
    /// A subordinate domain acting as one branch.
    Domain {
        /// The remote domain's manager process.
        process: ProcessHandle,
    },
}

impl Participant {
    fn process(&self) -> ProcessHandle {
        match self {
            Participant::Resource { process, .. } | Participant::Domain { process } => *process,
        }
    }

    fn resource(&self) -> ResourceId {
        match self {
            Participant::Resource { resource, .. } => *resource,
            Participant::Domain { .. } => ResourceId::new(0),
        }
    }
}

/// One branch of a transaction.
#[derive(Debug, Clone)]
pub struct Branch {
    /// Branch trid handed to the participant.
    pub trid: Xid,
    /// The participant holding the branch.
    pub participant: Participant,
}

/// One coordinated transaction.
#[derive(Debug)]
pub struct Transaction {
    trid: Xid,
    branches: Vec<Branch>,
    started: Instant,
    deadline: Instant,
    stage: Stage,
}

impl Transaction {
    /// Global transaction identifier.
    pub fn trid(&self) -> &Xid {
        &self.trid
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Enlisted branches.
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// When the transaction began.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// When the deadline sweep may roll the transaction back.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Enlists a participant, idempotently.
    ///
    /// A participant already enlisted keeps its branch trid; a new one
    /// gets the next branch qualifier in sequence.
    fn involve(&mut self, participant: Participant) -> Xid {
        if let Some(branch) = self
            .branches
            .iter()
            .find(|b| b.participant == participant)
        {
            return branch.trid.clone();
        }
        let trid = self.trid.branch(self.branches.len() as u64 + 1);
        self.branches.push(Branch {
            trid: trid.clone(),
            participant,
        });
        trid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Prepare,
    Commit,
    Rollback,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// A commit acknowledgement the coordinator can retire the branch on.
/// `XAER_NOTA` means the resource already forgot the branch, which is
/// the normal answer to a recovery re-drive.
fn commit_acceptable(code: i32) -> bool {
    code == XA_OK || code == XAER_NOTA
}

/// A rollback acknowledgement that leaves nothing behind: the rollback
/// family of codes reports the branch was already rolled back.
fn rollback_acceptable(code: i32) -> bool {
    code == XA_OK || code == XAER_NOTA || (XA_RBBASE..=XA_RBEND).contains(&code)
}

/// The transaction manager of one domain.
pub struct Manager<S: LogStore, O: Outbound> {
    process: ProcessHandle,
    state: State,
    transactions: HashMap<Xid, Transaction>,
    log: Log<S>,
    outbound: O,
    inbound: Inbound,
    coordinate: Coordinate<DirectiveReply>,
    backlog: VecDeque<(Uuid, Message)>,
    timeout: Duration,
    sweep_interval: Duration,
    upstream: Option<ProcessHandle>,
}

impl<S: LogStore, O: Outbound> Manager<S, O> {
    /// Creates a manager from validated configuration.
    pub fn new(config: &ManagerConfig, log: Log<S>, outbound: O, inbound: Inbound) -> Self {
        Self {
            process: inbound.process(),
            state: State::configure(config),
            transactions: HashMap::new(),
            log,
            outbound,
            inbound,
            coordinate: Coordinate::new(),
            backlog: VecDeque::new(),
            timeout: config.transaction_timeout,
            sweep_interval: config.sweep_interval,
            upstream: None,
        }
    }

    /// The manager's own process handle.
    pub fn process(&self) -> ProcessHandle {
        self.process
    }

    /// Resource and instance state, for embedding and tests.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// The transaction for a trid, if still active.
    pub fn transaction(&self, trid: &Xid) -> Option<&Transaction> {
        self.transactions.get(trid)
    }

    /// Designates the superior domain that prepare/commit replies for
    /// inbound domain directives are sent to.
    pub fn set_upstream(&mut self, process: ProcessHandle) {
        self.upstream = Some(process);
    }

    /// Starts a transaction under a fresh trid.
    pub fn begin(&mut self) -> Result<Xid> {
        self.begin_with(Xid::generate())
    }

    /// Starts a transaction under a caller-supplied trid, as when work
    /// arrives from a superior domain.
    pub fn begin_with(&mut self, trid: Xid) -> Result<Xid> {
        if trid.is_null() {
            return Err(XatmiError::Protocol(
                "cannot begin a transaction under the null trid".to_string(),
            ));
        }
        if self.transactions.contains_key(&trid) {
            return Err(XatmiError::Protocol(format!(
                "transaction {} is already active",
                trid
            )));
        }
        let now = Instant::now();
        self.transactions.insert(
            trid.clone(),
            Transaction {
                trid: trid.clone(),
                branches: Vec::new(),
                started: now,
                deadline: now + self.timeout,
                stage: Stage::Active,
            },
        );
        info!(%trid, "transaction started");
        Ok(trid)
    }

    /// Enlists a participant in an active transaction and returns the
    /// branch trid. Idempotent per participant.
    pub fn involve(&mut self, trid: &Xid, participant: Participant) -> Result<Xid> {
        let transaction = self
            .transactions
            .get_mut(trid)
            .ok_or_else(|| XatmiError::Protocol(format!("unknown transaction {}", trid)))?;
        if transaction.stage != Stage::Active {
            return Err(XatmiError::Protocol(format!(
                "transaction {} is {:?}, cannot enlist",
                trid, transaction.stage
            )));
        }
        Ok(transaction.involve(participant))
    }

    /// Enlists an idle instance of the resource with the given key.
    pub fn involve_resource(&mut self, trid: &Xid, key: &str) -> Result<Xid> {
        let resource = self
            .state
            .resource_by_key(key)
            .ok_or_else(|| XatmiError::Configuration(format!("unknown resource key {}", key)))?;
        let id = resource.id;
        let process = resource
            .instances
            .iter()
            .find_map(|i| match (i.process, i.state) {
                (Some(process), InstanceState::Idle) => Some(process),
                _ => None,
            })
            .ok_or_else(|| {
                XatmiError::Transport(format!("no idle instance of resource {}", key))
            })?;
        self.involve(trid, Participant::Resource { resource: id, process })
    }

    /// Enlists a subordinate domain.
    pub fn involve_domain(&mut self, trid: &Xid, process: ProcessHandle) -> Result<Xid> {
        self.involve(trid, Participant::Domain { process })
    }

    /// Drains bookkeeping messages (connect reports, replies, process
    /// exits) currently queued, without blocking.
    pub fn pump(&mut self) -> Result<()> {
        while let Some((correlation, message)) = self.inbound.try_next()? {
            self.consume(correlation, message);
        }
        Ok(())
    }

    /// Runs two-phase commit and returns the decided outcome.
    ///
    /// One dissenting vote, one unreachable participant or one failed
    /// dispatch forces the global decision to roll back. The outcome is
    /// `Ok` either way; `Err` is reserved for coordinator-side failures
    /// such as a log that cannot be written.
    #[instrument(skip(self), fields(trid = %trid))]
    pub async fn commit(&mut self, trid: &Xid) -> Result<Decision> {
        self.expect_stage(trid, Stage::Active)?;
        self.set_stage(trid, Stage::Preparing);

        let (votes, unreachable) = self.broadcast(trid, Directive::Prepare).await?;
        let unanimous = unreachable.is_empty() && votes.iter().all(|v| vote_is_ok(v.code));
        if !unanimous {
            for vote in votes.iter().filter(|v| !vote_is_ok(v.code)) {
                warn!(branch = %vote.trid, code = vote.code, "branch voted no");
            }
            for process in &unreachable {
                warn!(%process, "participant unreachable during prepare");
            }
            self.set_stage(trid, Stage::Aborting);
            self.finish_rollback(trid).await?;
            return Ok(Decision::RolledBack);
        }

        self.set_stage(trid, Stage::Prepared);
        let records = self.branch_records(trid);
        // The commit decision must be durable before any commit
        // directive leaves the process.
        self.log.prepare(trid, records)?;
        self.set_stage(trid, Stage::Committing);

        let (acks, unreachable) = self.broadcast(trid, Directive::Commit).await?;
        let complete = unreachable.is_empty() && acks.iter().all(|a| commit_acceptable(a.code));
        if complete {
            // Terminal state first, then release; a crash in between
            // re-drives a commit every branch answers XAER_NOTA to.
            self.log.committed(trid)?;
            self.log.remove(trid)?;
            info!(%trid, "transaction committed");
        } else {
            warn!(%trid, "commit not fully acknowledged, branches left in doubt");
        }
        self.retire(trid);
        Ok(Decision::Committed)
    }

    /// Rolls an active transaction back.
    #[instrument(skip(self), fields(trid = %trid))]
    pub async fn rollback(&mut self, trid: &Xid) -> Result<Decision> {
        self.expect_stage(trid, Stage::Active)?;
        self.set_stage(trid, Stage::Aborting);
        self.finish_rollback(trid).await?;
        Ok(Decision::RolledBack)
    }

    /// Transactions whose deadline has passed while still active.
    pub fn expired(&self, now: Instant) -> Vec<Xid> {
        self.transactions
            .values()
            .filter(|t| t.stage == Stage::Active && t.deadline <= now)
            .map(|t| t.trid.clone())
            .collect()
    }

    /// Rolls back every transaction past its deadline.
    pub async fn sweep(&mut self) -> Result<usize> {
        let expired = self.expired(Instant::now());
        let count = expired.len();
        for trid in expired {
            warn!(%trid, "deadline passed, rolling back unilaterally");
            self.set_stage(&trid, Stage::Aborting);
            self.finish_rollback(&trid).await?;
        }
        Ok(count)
    }

    /// Re-drives every in-doubt transaction found in the log.
    ///
    /// Branch membership comes from the log entry; each recorded resource
    /// branch is re-addressed to whichever instance currently serves the
    /// resource. An entry is released only once every recorded branch
    /// acknowledged the outcome; otherwise it stays for the next pass.
    pub async fn recover(&mut self) -> Result<usize> {
        let entries = self.log.in_doubt();
        let count = entries.len();

        for entry in entries {
            let directive = match entry.state {
                Decision::Prepared | Decision::Committed => Directive::Commit,
                Decision::RolledBack => Directive::Rollback,
            };
            info!(trid = %entry.trid, state = ?entry.state, "re-driving in-doubt transaction");

            let mut branches = Vec::new();
            let mut unaddressable = 0usize;
            for record in &entry.branches {
                if record.resource == 0 {
                    warn!(branch = %record.trid, "domain branch cannot be re-addressed after restart");
                    unaddressable += 1;
                    continue;
                }
                let resource = ResourceId::new(record.resource);
                let Some(process) = self.live_instance(resource) else {
                    warn!(branch = %record.trid, %resource, "no live instance to re-drive branch");
                    unaddressable += 1;
                    continue;
                };
                branches.push(Branch {
                    trid: record.trid.clone(),
                    participant: Participant::Resource { resource, process },
                });
            }

            let now = Instant::now();
            self.transactions.insert(
                entry.trid.clone(),
                Transaction {
                    trid: entry.trid.clone(),
                    branches,
                    started: now,
                    deadline: now + self.timeout,
                    stage: match directive {
                        Directive::Commit => Stage::Committing,
                        _ => Stage::RollingBack,
                    },
                },
            );

            let (acks, unreachable) = self.broadcast(&entry.trid, directive).await?;
            let acceptable = match directive {
                Directive::Commit => acks.iter().all(|a| commit_acceptable(a.code)),
                _ => acks.iter().all(|a| rollback_acceptable(a.code)),
            };
            if unaddressable == 0 && unreachable.is_empty() && acceptable {
                if directive == Directive::Commit {
                    self.log.committed(&entry.trid)?;
                }
                self.log.remove(&entry.trid)?;
                info!(trid = %entry.trid, "in-doubt transaction resolved");
            } else {
                warn!(trid = %entry.trid, "in-doubt transaction not fully resolved, kept for next pass");
            }
            self.transactions.remove(&entry.trid);
        }
        Ok(count)
    }

    /// Sends a shutdown directive to every live proxy instance.
    pub async fn shutdown_proxies(&mut self) -> Result<()> {
        for (resource, process) in self.state.live_instances() {
            if let Err(error) = self
                .outbound
                .dispatch(process, Uuid::new_v4(), Message::Shutdown)
                .await
            {
                warn!(%resource, %process, %error, "shutdown directive not delivered");
            }
        }
        Ok(())
    }

    /// Serves inbound traffic until a shutdown directive arrives.
    ///
    /// Handles subordinate-domain directives, folds in bookkeeping
    /// messages, and runs the deadline sweep on its configured cadence.
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            while let Some((correlation, message)) = self.backlog.pop_front() {
                if self.handle(correlation, message).await? == Flow::Stop {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await?;
                }
                next = self.inbound.next() => {
                    let (correlation, message) = next?;
                    if self.handle(correlation, message).await? == Flow::Stop {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Serializable operator view: transactions in flight, the resource
    /// table, and the in-doubt count.
    pub fn snapshot(&self) -> AdminSnapshot {
        AdminSnapshot {
            transactions: self
                .transactions
                .values()
                .map(|t| TransactionSnapshot {
                    trid: t.trid.to_string(),
                    stage: format!("{:?}", t.stage),
                    branches: t.branches.len(),
                })
                .collect(),
            resources: self.state.snapshot(),
            in_doubt: self.log.in_doubt().len(),
        }
    }

    // -- internals ------------------------------------------------------

    fn expect_stage(&self, trid: &Xid, stage: Stage) -> Result<()> {
        let transaction = self
            .transactions
            .get(trid)
            .ok_or_else(|| XatmiError::Protocol(format!("unknown transaction {}", trid)))?;
        if transaction.stage != stage {
            return Err(XatmiError::Protocol(format!(
                "transaction {} is {:?}, expected {:?}",
                trid, transaction.stage, stage
            )));
        }
        Ok(())
    }

    fn set_stage(&mut self, trid: &Xid, stage: Stage) {
        if let Some(transaction) = self.transactions.get_mut(trid) {
            debug!(%trid, ?stage, "stage transition");
            transaction.stage = stage;
        }
    }

    fn retire(&mut self, trid: &Xid) {
        self.set_stage(trid, Stage::Completed);
        self.transactions.remove(trid);
    }

    fn branch_records(&self, trid: &Xid) -> Vec<BranchRecord> {
        self.transactions
            .get(trid)
            .map(|t| {
                t.branches
                    .iter()
                    .map(|b| BranchRecord {
                        trid: b.trid.clone(),
                        resource: b.participant.resource().value(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn live_instance(&self, resource: ResourceId) -> Option<ProcessHandle> {
        self.state
            .live_instances()
            .into_iter()
            .find_map(|(id, process)| (id == resource).then_some(process))
    }

    /// Logs the rollback decision, drives rollback to every branch and
    /// retires the transaction. Branches that do not acknowledge leave
    /// the log entry in place for recovery.
    async fn finish_rollback(&mut self, trid: &Xid) -> Result<()> {
        let records = self.branch_records(trid);
        // Durable before the first rollback directive.
        self.log.rolled_back(trid, records)?;
        self.set_stage(trid, Stage::RollingBack);

        let (acks, unreachable) = self.broadcast(trid, Directive::Rollback).await?;
        let complete = unreachable.is_empty() && acks.iter().all(|a| rollback_acceptable(a.code));
        if complete {
            self.log.remove(trid)?;
            info!(%trid, "transaction rolled back");
        } else {
            warn!(%trid, "rollback not fully acknowledged, branches left in doubt");
        }
        self.retire(trid);
        Ok(())
    }

    fn directive_message(directive: Directive, branch: &Branch) -> Message {
        let request = DirectiveRequest {
            trid: branch.trid.clone(),
            resource: branch.participant.resource(),
            flags: XA_TMNOFLAGS,
        };
        match (directive, &branch.participant) {
            (Directive::Prepare, Participant::Resource { .. }) => Message::PrepareRequest(request),
            (Directive::Commit, Participant::Resource { .. }) => Message::CommitRequest(request),
            (Directive::Rollback, Participant::Resource { .. }) => {
                Message::RollbackRequest(request)
            }
            (Directive::Prepare, Participant::Domain { .. }) => {
                Message::DomainPrepareRequest(request)
            }
            (Directive::Commit, Participant::Domain { .. }) => {
                Message::DomainCommitRequest(request)
            }
            (Directive::Rollback, Participant::Domain { .. }) => {
                Message::DomainRollbackRequest(request)
            }
        }
    }

    /// Sends one directive to every branch under a single correlation
    /// and waits for the fan-in to complete.
    ///
    /// Returns the replies received and the participants that failed
    /// before replying. Non-reply traffic arriving while waiting is
    /// folded in (bookkeeping) or backlogged (requests), never dropped.
    async fn broadcast(
        &mut self,
        trid: &Xid,
        directive: Directive,
    ) -> Result<(Vec<DirectiveReply>, Vec<ProcessHandle>)> {
        let transaction = self
            .transactions
            .get(trid)
            .ok_or_else(|| XatmiError::Protocol(format!("unknown transaction {}", trid)))?;
        let sends: Vec<(Participant, Message)> = transaction
            .branches
            .iter()
            .map(|branch| (branch.participant, Self::directive_message(directive, branch)))
            .collect();

        let correlation = Uuid::new_v4();
        let destinations = sends.iter().map(|(p, _)| p.process()).collect();
        let (sender, mut receiver) = oneshot::channel();
        self.coordinate.add(correlation, destinations, move |received, failed| {
            let _ = sender.send((received, failed));
        });

        let now = Instant::now();
        self.state.pending.add(correlation, now);
        debug!(%trid, ?directive, %correlation, fanout = sends.len(), "broadcast");

        for (participant, message) in sends {
            let process = participant.process();
            if let Participant::Resource { resource, process } = participant {
                match self
                    .state
                    .resource_mut(resource)
                    .and_then(|r| r.instance_mut(process))
                {
                    // A branch on an instance already known dead will
                    // never answer; fail the slot instead of dispatching.
                    Some(instance) if instance.state == InstanceState::Error => {
                        warn!(%process, "branch instance is down, not dispatching");
                        self.coordinate.failed_send(correlation, process);
                        continue;
                    }
                    Some(instance) => instance.reserve(now),
                    None => {}
                }
            }
            if let Err(error) = self.outbound.dispatch(process, correlation, message).await {
                warn!(%process, %error, "dispatch failed");
                self.state.process_down(process);
                self.coordinate.failed_send(correlation, process);
            }
        }

        let outcome = loop {
            match receiver.try_recv() {
                Ok(outcome) => break outcome,
                Err(oneshot::error::TryRecvError::Empty) => {
                    let (reply_correlation, message) = self.inbound.next().await?;
                    self.consume(reply_correlation, message);
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(XatmiError::Protocol(format!(
                        "broadcast bookkeeping lost for correlation {}",
                        correlation
                    )));
                }
            }
        };
        self.state.pending.resolve(correlation, Instant::now());
        Ok(outcome)
    }

    /// Folds one inbound message into the bookkeeping. Requests are
    /// backlogged for the serving loop.
    fn consume(&mut self, correlation: Uuid, message: Message) {
        match message {
            Message::PrepareReply(reply)
            | Message::CommitReply(reply)
            | Message::RollbackReply(reply)
            | Message::DomainPrepareReply(reply)
            | Message::DomainCommitReply(reply)
            | Message::DomainRollbackReply(reply) => {
                let now = Instant::now();
                if let Some(instance) = self
                    .state
                    .resource_mut(reply.resource)
                    .and_then(|r| r.instance_mut(reply.process))
                {
                    instance.unreserve(now, Duration::from_micros(reply.elapsed_us));
                }
                self.coordinate.accumulate(correlation, reply.process, reply);
            }
            Message::ResourceConnect(connected) => {
                self.state.connected(&connected);
            }
            Message::ProcessDown { process } => {
                self.state.process_down(process);
                self.coordinate.failed(process);
            }
            other => {
                self.backlog.push_back((correlation, other));
            }
        }
    }

    async fn handle(&mut self, correlation: Uuid, message: Message) -> Result<Flow> {
        match message {
            Message::Shutdown => {
                info!("shutdown directive received");
                self.shutdown_proxies().await?;
                Ok(Flow::Stop)
            }
            Message::DomainPrepareRequest(request) => {
                self.handle_domain_prepare(correlation, request).await?;
                Ok(Flow::Continue)
            }
            Message::DomainCommitRequest(request) => {
                self.handle_domain_commit(correlation, request).await?;
                Ok(Flow::Continue)
            }
            Message::DomainRollbackRequest(request) => {
                self.handle_domain_rollback(correlation, request).await?;
                Ok(Flow::Continue)
            }
            Message::PrepareRequest(_) | Message::CommitRequest(_) | Message::RollbackRequest(_) => {
                warn!("resource directive addressed to the manager ignored");
                Ok(Flow::Continue)
            }
            other => {
                self.consume(correlation, other);
                Ok(Flow::Continue)
            }
        }
    }

    /// Prepare directive from a superior domain: run the local prepare
    /// phase and answer with this domain's vote.
    async fn handle_domain_prepare(
        &mut self,
        correlation: Uuid,
        request: DirectiveRequest,
    ) -> Result<()> {
        let started = Instant::now();
        let code = match self.transactions.get(&request.trid).map(|t| t.stage) {
            None => XAER_NOTA,
            Some(Stage::Active) => {
                self.set_stage(&request.trid, Stage::Preparing);
                let (votes, unreachable) =
                    self.broadcast(&request.trid, Directive::Prepare).await?;
                if unreachable.is_empty() && votes.iter().all(|v| vote_is_ok(v.code)) {
                    let records = self.branch_records(&request.trid);
                    self.log.prepare(&request.trid, records)?;
                    self.set_stage(&request.trid, Stage::Prepared);
                    XA_OK
                } else {
                    self.set_stage(&request.trid, Stage::Aborting);
                    self.finish_rollback(&request.trid).await?;
                    XA_RBROLLBACK
                }
            }
            Some(_) => XAER_PROTO,
        };
        self.domain_reply(
            correlation,
            &request,
            code,
            started.elapsed(),
            Message::DomainPrepareReply,
        )
        .await
    }

    /// Commit directive from a superior domain for a locally prepared
    /// transaction.
    async fn handle_domain_commit(
        &mut self,
        correlation: Uuid,
        request: DirectiveRequest,
    ) -> Result<()> {
        let started = Instant::now();
        let code = match self.transactions.get(&request.trid).map(|t| t.stage) {
            None => XAER_NOTA,
            Some(Stage::Prepared) => {
                self.set_stage(&request.trid, Stage::Committing);
                let (acks, unreachable) =
                    self.broadcast(&request.trid, Directive::Commit).await?;
                let complete =
                    unreachable.is_empty() && acks.iter().all(|a| commit_acceptable(a.code));
                if complete {
                    self.log.committed(&request.trid)?;
                    self.log.remove(&request.trid)?;
                } else {
                    warn!(trid = %request.trid, "domain commit left branches in doubt");
                }
                self.retire(&request.trid);
                XA_OK
            }
            Some(_) => XAER_PROTO,
        };
        self.domain_reply(
            correlation,
            &request,
            code,
            started.elapsed(),
            Message::DomainCommitReply,
        )
        .await
    }

    /// Rollback directive from a superior domain.
    async fn handle_domain_rollback(
        &mut self,
        correlation: Uuid,
        request: DirectiveRequest,
    ) -> Result<()> {
        let started = Instant::now();
        let code = match self.transactions.get(&request.trid).map(|t| t.stage) {
            None => XAER_NOTA,
            Some(Stage::Active) | Some(Stage::Prepared) => {
                self.set_stage(&request.trid, Stage::Aborting);
                self.finish_rollback(&request.trid).await?;
                XA_OK
            }
            Some(_) => XAER_PROTO,
        };
        self.domain_reply(
            correlation,
            &request,
            code,
            started.elapsed(),
            Message::DomainRollbackReply,
        )
        .await
    }

    async fn domain_reply(
        &mut self,
        correlation: Uuid,
        request: &DirectiveRequest,
        code: i32,
        elapsed: Duration,
        wrap: fn(DirectiveReply) -> Message,
    ) -> Result<()> {
        let Some(upstream) = self.upstream else {
            warn!(trid = %request.trid, "domain directive but no upstream configured");
            return Ok(());
        };
        self.outbound
            .dispatch(
                upstream,
                correlation,
                wrap(DirectiveReply {
                    process: self.process,
                    resource: request.resource,
                    trid: request.trid.clone(),
                    code,
                    elapsed_us: elapsed.as_micros() as u64,
                }),
            )
            .await
    }
}

/// Operator snapshot of one in-flight transaction.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransactionSnapshot {
    /// Global trid.
    pub trid: String,
    /// Stage name.
    pub stage: String,
    /// Enlisted branch count.
    pub branches: usize,
}

/// Operator snapshot of the whole manager.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminSnapshot {
    /// Transactions in flight.
    pub transactions: Vec<TransactionSnapshot>,
    /// Resource table with per-instance metrics.
    pub resources: Vec<ResourceSnapshot>,
    /// Logged transactions whose outcome is not fully acknowledged.
    pub in_doubt: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use xatmi_core::protocol::Connected;
    use xatmi_core::xa::XA_RBDEADLOCK;

    use crate::config::ResourceConfig;
    use crate::log::{InMemoryStore, LogEntry};
    use crate::transport::Endpoints;

    /// Log store shared between the manager and the test, so dispatch
    /// observers can inspect log contents mid-protocol. Every write is
    /// also journalled so tests can assert on decision ordering.
    #[derive(Clone, Default)]
    struct SharedStore {
        inner: Arc<Mutex<InMemoryStore>>,
        writes: Arc<Mutex<Vec<Decision>>>,
    }

    impl SharedStore {
        fn writes(&self) -> Vec<Decision> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl LogStore for SharedStore {
        fn write(&mut self, entry: &LogEntry) -> Result<()> {
            self.writes.lock().unwrap().push(entry.state);
            self.inner.lock().unwrap().write(entry)
        }

        fn remove(&mut self, trid: &Xid) -> Result<()> {
            self.inner.lock().unwrap().remove(trid)
        }

        fn entries(&self) -> Vec<LogEntry> {
            self.inner.lock().unwrap().entries()
        }
    }

    /// Outbound that answers every directive immediately with scripted
    /// codes and records dispatch order plus the log states visible at
    /// each dispatch.
    #[derive(Clone)]
    struct AutoOutbound {
        manager: ProcessHandle,
        transport: Transport,
        store: SharedStore,
        prepare_codes: Arc<Mutex<HashMap<ProcessHandle, i32>>>,
        commit_codes: Arc<Mutex<HashMap<ProcessHandle, i32>>>,
        unreachable: Arc<Mutex<HashSet<ProcessHandle>>>,
        events: Arc<Mutex<Vec<(String, Vec<Decision>)>>>,
    }

    impl AutoOutbound {
        fn new(manager: ProcessHandle, transport: Transport, store: SharedStore) -> Self {
            Self {
                manager,
                transport,
                store,
                prepare_codes: Arc::default(),
                commit_codes: Arc::default(),
                unreachable: Arc::default(),
                events: Arc::default(),
            }
        }

        fn vote_no(&self, process: ProcessHandle, code: i32) {
            self.prepare_codes.lock().unwrap().insert(process, code);
        }

        fn fail_commit(&self, process: ProcessHandle, code: i32) {
            self.commit_codes.lock().unwrap().insert(process, code);
        }

        fn cut_off(&self, process: ProcessHandle) {
            self.unreachable.lock().unwrap().insert(process);
        }

        fn kinds(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
        }

        fn log_at(&self, kind: &str) -> Vec<Decision> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| k == kind)
                .map(|(_, states)| states.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Outbound for AutoOutbound {
        async fn dispatch(
            &self,
            destination: ProcessHandle,
            correlation: Uuid,
            message: Message,
        ) -> Result<()> {
            if self.unreachable.lock().unwrap().contains(&destination) {
                return Err(XatmiError::Transport("destination unreachable".to_string()));
            }
            let log_states = self.store.entries().iter().map(|e| e.state).collect();
            let (kind, reply) = match &message {
                Message::PrepareRequest(r) => (
                    "prepare",
                    Some((
                        self.prepare_codes
                            .lock()
                            .unwrap()
                            .get(&destination)
                            .copied()
                            .unwrap_or(XA_OK),
                        r.clone(),
                        Message::PrepareReply as fn(DirectiveReply) -> Message,
                    )),
                ),
                Message::CommitRequest(r) => (
                    "commit",
                    Some((
                        self.commit_codes
                            .lock()
                            .unwrap()
                            .get(&destination)
                            .copied()
                            .unwrap_or(XA_OK),
                        r.clone(),
                        Message::CommitReply as fn(DirectiveReply) -> Message,
                    )),
                ),
                Message::RollbackRequest(r) => (
                    "rollback",
                    Some((
                        XA_OK,
                        r.clone(),
                        Message::RollbackReply as fn(DirectiveReply) -> Message,
                    )),
                ),
                Message::Shutdown => ("shutdown", None),
                _ => ("other", None),
            };
            self.events
                .lock()
                .unwrap()
                .push((kind.to_string(), log_states));

            if let Some((code, request, wrap)) = reply {
                self.transport.send_correlated(
                    self.manager,
                    correlation,
                    &wrap(DirectiveReply {
                        process: destination,
                        resource: request.resource,
                        trid: request.trid,
                        code,
                        elapsed_us: 250,
                    }),
                )?;
            }
            Ok(())
        }
    }

    struct Fixture {
        manager: Manager<SharedStore, AutoOutbound>,
        outbound: AutoOutbound,
        store: SharedStore,
        accounts: ProcessHandle,
        orders: ProcessHandle,
    }

    fn fixture() -> Fixture {
        let config = ManagerConfig::builder()
            .resource(ResourceConfig::new("accounts").instances(1))
            .resource(ResourceConfig::new("orders").instances(1))
            .build()
            .unwrap();

        let mut builder = Endpoints::builder();
        let inbound = builder.register(ProcessHandle::random());
        let manager_handle = inbound.process();
        let transport = Transport::new(builder.build());

        let store = SharedStore::default();
        let outbound = AutoOutbound::new(manager_handle, transport.clone(), store.clone());
        let mut manager = Manager::new(&config, Log::new(store.clone()), outbound.clone(), inbound);

        let accounts = ProcessHandle::random();
        let orders = ProcessHandle::random();
        for (process, resource) in [(accounts, 1), (orders, 2)] {
            transport
                .send(
                    manager_handle,
                    &Message::ResourceConnect(Connected {
                        process,
                        resource: ResourceId::new(resource),
                        state: XA_OK,
                    }),
                )
                .unwrap();
        }
        manager.pump().unwrap();

        Fixture {
            manager,
            outbound,
            store,
            accounts,
            orders,
        }
    }

    #[tokio::test]
    async fn test_begin_and_involve_assigns_branch_trids() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();

        let first = fixture.manager.involve_resource(&trid, "accounts").unwrap();
        let second = fixture.manager.involve_resource(&trid, "orders").unwrap();
        assert!(first.same_global(&trid));
        assert!(second.same_global(&trid));
        assert_ne!(first, second);

        // Enlisting the same participant again is idempotent.
        let again = fixture.manager.involve_resource(&trid, "accounts").unwrap();
        assert_eq!(first, again);
        assert_eq!(fixture.manager.transaction(&trid).unwrap().branches().len(), 2);
    }

    #[tokio::test]
    async fn test_unanimous_commit() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();
        fixture.manager.involve_resource(&trid, "orders").unwrap();

        let decision = fixture.manager.commit(&trid).await.unwrap();
        assert_eq!(decision, Decision::Committed);

        assert_eq!(
            fixture.outbound.kinds(),
            vec!["prepare", "prepare", "commit", "commit"]
        );
        // The entry reaches its terminal state before it is released.
        assert_eq!(
            fixture.store.writes(),
            vec![Decision::Prepared, Decision::Committed]
        );
        assert!(fixture.store.entries().is_empty());
        assert!(fixture.manager.transaction(&trid).is_none());
    }

    #[tokio::test]
    async fn test_commit_is_write_ahead() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();

        fixture.manager.commit(&trid).await.unwrap();

        // No decision on the log while prepares are out; the prepared
        // decision durable before the first commit directive.
        assert_eq!(fixture.outbound.log_at("prepare"), Vec::<Decision>::new());
        assert_eq!(fixture.outbound.log_at("commit"), vec![Decision::Prepared]);
    }

    #[tokio::test]
    async fn test_one_no_vote_rolls_everyone_back() {
        let mut fixture = fixture();
        fixture.outbound.vote_no(fixture.orders, XA_RBDEADLOCK);

        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();
        fixture.manager.involve_resource(&trid, "orders").unwrap();

        let decision = fixture.manager.commit(&trid).await.unwrap();
        assert_eq!(decision, Decision::RolledBack);

        let kinds = fixture.outbound.kinds();
        assert!(!kinds.contains(&"commit".to_string()));
        assert_eq!(kinds.iter().filter(|k| *k == "rollback").count(), 2);
        // The rollback decision was durable before the directives.
        assert_eq!(
            fixture.outbound.log_at("rollback"),
            vec![Decision::RolledBack]
        );
        assert!(fixture.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_participant_forces_rollback() {
        let mut fixture = fixture();
        fixture.outbound.cut_off(fixture.orders);

        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();
        fixture.manager.involve_resource(&trid, "orders").unwrap();

        let decision = fixture.manager.commit(&trid).await.unwrap();
        assert_eq!(decision, Decision::RolledBack);
        assert!(!fixture.outbound.kinds().contains(&"commit".to_string()));
    }

    #[tokio::test]
    async fn test_commit_without_branches() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();

        let decision = fixture.manager.commit(&trid).await.unwrap();
        assert_eq!(decision, Decision::Committed);
        assert!(fixture.outbound.kinds().is_empty());
        assert!(fixture.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_commit_stays_in_doubt() {
        let mut fixture = fixture();
        fixture.outbound.fail_commit(fixture.accounts, XAER_PROTO);

        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();

        let decision = fixture.manager.commit(&trid).await.unwrap();
        // The decision stands; the branch is in doubt until recovery.
        assert_eq!(decision, Decision::Committed);

        let entries = fixture.store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, Decision::Prepared);
        assert_eq!(entries[0].branches.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_rollback() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();

        let decision = fixture.manager.rollback(&trid).await.unwrap();
        assert_eq!(decision, Decision::RolledBack);
        assert_eq!(fixture.outbound.kinds(), vec!["rollback"]);
        assert!(fixture.store.entries().is_empty());
        assert!(fixture.manager.transaction(&trid).is_none());
    }

    #[tokio::test]
    async fn test_commit_twice_fails() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.commit(&trid).await.unwrap();

        let err = fixture.manager.commit(&trid).await.unwrap_err();
        assert!(matches!(err, XatmiError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_involve_after_prepare_fails() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.commit(&trid).await.unwrap();

        assert!(fixture.manager.involve_resource(&trid, "accounts").is_err());
    }

    #[tokio::test]
    async fn test_deadline_sweep_rolls_back() {
        let config = ManagerConfig::builder()
            .resource(ResourceConfig::new("accounts"))
            .transaction_timeout(Duration::from_millis(1))
            .build()
            .unwrap();
        let mut builder = Endpoints::builder();
        let inbound = builder.register(ProcessHandle::random());
        let manager_handle = inbound.process();
        let transport = Transport::new(builder.build());
        let store = SharedStore::default();
        let outbound = AutoOutbound::new(manager_handle, transport.clone(), store.clone());
        let mut manager = Manager::new(&config, Log::new(store.clone()), outbound.clone(), inbound);

        let accounts = ProcessHandle::random();
        transport
            .send(
                manager_handle,
                &Message::ResourceConnect(Connected {
                    process: accounts,
                    resource: ResourceId::new(1),
                    state: XA_OK,
                }),
            )
            .unwrap();
        manager.pump().unwrap();

        let trid = manager.begin().unwrap();
        manager.involve_resource(&trid, "accounts").unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.expired(Instant::now()), vec![trid.clone()]);

        let swept = manager.sweep().await.unwrap();
        assert_eq!(swept, 1);
        assert!(manager.transaction(&trid).is_none());
        assert_eq!(outbound.kinds(), vec!["rollback"]);
        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_recover_redrives_prepared_entry() {
        let mut fixture = fixture();
        let trid = Xid::generate();
        fixture
            .store
            .write(&LogEntry {
                trid: trid.clone(),
                state: Decision::Prepared,
                branches: vec![BranchRecord {
                    trid: trid.branch(1),
                    resource: 1,
                }],
            })
            .unwrap();

        let redriven = fixture.manager.recover().await.unwrap();
        assert_eq!(redriven, 1);
        assert_eq!(fixture.outbound.kinds(), vec!["commit"]);
        assert!(fixture.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_recover_redrives_committed_entry() {
        // A crash between the committed write and the release leaves a
        // terminal entry; recovery re-drives commit and releases it.
        let mut fixture = fixture();
        let trid = Xid::generate();
        fixture
            .store
            .write(&LogEntry {
                trid: trid.clone(),
                state: Decision::Committed,
                branches: vec![BranchRecord {
                    trid: trid.branch(1),
                    resource: 1,
                }],
            })
            .unwrap();

        fixture.manager.recover().await.unwrap();
        assert_eq!(fixture.outbound.kinds(), vec!["commit"]);
        assert!(fixture.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_recover_redrives_rolled_back_entry() {
        let mut fixture = fixture();
        let trid = Xid::generate();
        fixture
            .store
            .write(&LogEntry {
                trid: trid.clone(),
                state: Decision::RolledBack,
                branches: vec![BranchRecord {
                    trid: trid.branch(1),
                    resource: 2,
                }],
            })
            .unwrap();

        fixture.manager.recover().await.unwrap();
        assert_eq!(fixture.outbound.kinds(), vec!["rollback"]);
        assert!(fixture.store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_recover_keeps_unaddressable_entry() {
        let mut fixture = fixture();
        let trid = Xid::generate();
        fixture
            .store
            .write(&LogEntry {
                trid: trid.clone(),
                state: Decision::Prepared,
                branches: vec![BranchRecord {
                    trid: trid.branch(1),
                    // No such resource is configured.
                    resource: 9,
                }],
            })
            .unwrap();

        fixture.manager.recover().await.unwrap();
        assert_eq!(fixture.store.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_track_roundtrips() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();
        fixture.manager.commit(&trid).await.unwrap();

        let resource = fixture.manager.state().resource(ResourceId::new(1)).unwrap();
        // One prepare and one commit round trip, each carrying the
        // proxy-measured XA call time.
        assert_eq!(resource.instances[0].roundtrip_time.count, 2);
        assert_eq!(resource.instances[0].resource_time.count, 2);
        assert_eq!(
            resource.instances[0].resource_time.total,
            Duration::from_micros(500)
        );
        assert_eq!(resource.instances[0].state, InstanceState::Idle);
        assert_eq!(fixture.manager.state().pending.count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let mut fixture = fixture();
        let trid = fixture.manager.begin().unwrap();
        fixture.manager.involve_resource(&trid, "accounts").unwrap();

        let snapshot = fixture.manager.snapshot();
        assert_eq!(snapshot.transactions.len(), 1);
        assert_eq!(snapshot.transactions[0].stage, "Active");
        assert_eq!(snapshot.resources.len(), 2);
        assert!(serde_json::to_string(&snapshot).unwrap().contains("accounts"));
    }
}
