//! Resource proxy: the process standing between the transaction manager
//! and one XA resource manager.
//!
//! The proxy opens the resource at startup, reports the outcome to the
//! manager, then serves prepare/commit/rollback directives one at a time.
//! XA switch calls are synchronous and blocking; each proxy instance is
//! single-threaded on purpose, concurrency comes from running several
//! instances per resource.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use xatmi_core::protocol::{Connected, DirectiveReply, Message, ProcessHandle, ResourceId};
use xatmi_core::xa::{Xid, XA_OK, XA_TMNOFLAGS};
use xatmi_core::{Result, XatmiError};

use crate::transport::{Inbound, Transport};

/// The XA switch entry points of one resource manager.
///
/// Mirrors the C `xa_switch_t` contract: every call returns a verbatim XA
/// return code, and the resource-manager id and flags are passed through
/// untouched.
pub trait XaSwitch: Send {
    /// `xa_open`: connects to the resource using the configured open string.
    fn open(&mut self, openinfo: &str, rm_id: i32, flags: i64) -> i32;

    /// `xa_close`: releases the connection.
    fn close(&mut self, closeinfo: &str, rm_id: i32, flags: i64) -> i32;

    /// `xa_prepare`: votes on one branch.
    fn prepare(&mut self, trid: &Xid, rm_id: i32, flags: i64) -> i32;

    /// `xa_commit`: commits one prepared branch.
    fn commit(&mut self, trid: &Xid, rm_id: i32, flags: i64) -> i32;

    /// `xa_rollback`: rolls back one branch.
    fn rollback(&mut self, trid: &Xid, rm_id: i32, flags: i64) -> i32;

    /// `xa_recover`: lists branches the resource holds in a prepared or
    /// heuristically completed state.
    fn recover(&mut self, rm_id: i32, flags: i64) -> Vec<Xid>;
}

/// Lifecycle of a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// The resource has not been opened yet, or has been closed.
    Closed,
    /// `xa_open` succeeded; the connect report is on its way.
    Open,
    /// Waiting for a directive.
    Idle,
    /// A switch call is in progress.
    Busy,
}

/// One proxy instance serving one resource manager.
pub struct ResourceProxy<S: XaSwitch> {
    switch: S,
    process: ProcessHandle,
    resource: ResourceId,
    manager: ProcessHandle,
    openinfo: String,
    closeinfo: String,
    transport: Transport,
    inbound: Inbound,
    state: ProxyState,
}

impl<S: XaSwitch> ResourceProxy<S> {
    /// Creates a proxy in the `Closed` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        switch: S,
        resource: ResourceId,
        manager: ProcessHandle,
        openinfo: impl Into<String>,
        closeinfo: impl Into<String>,
        transport: Transport,
        inbound: Inbound,
    ) -> Self {
        let process = inbound.process();
        Self {
            switch,
            process,
            resource,
            manager,
            openinfo: openinfo.into(),
            closeinfo: closeinfo.into(),
            transport,
            inbound,
            state: ProxyState::Closed,
        }
    }

    /// The proxy's process handle.
    pub fn process(&self) -> ProcessHandle {
        self.process
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Opens the resource and reports the outcome to the manager.
    ///
    /// A failed open is fatal configuration: the proxy reports nothing
    /// and must not serve directives.
    #[instrument(skip(self), fields(process = %self.process, resource = %self.resource))]
    pub fn start(&mut self) -> Result<()> {
        let code = self
            .switch
            .open(&self.openinfo, self.resource.value(), XA_TMNOFLAGS);
        if code != XA_OK {
            error!(code, "resource open failed");
            return Err(XatmiError::Configuration(format!(
                "open of {} returned {}",
                self.resource, code
            )));
        }
        self.state = ProxyState::Open;

        self.transport.send(
            self.manager,
            &Message::ResourceConnect(Connected {
                process: self.process,
                resource: self.resource,
                state: code,
            }),
        )?;
        info!("resource open, connect reported");
        self.state = ProxyState::Idle;
        Ok(())
    }

    /// Serves directives until a shutdown message arrives.
    ///
    /// The resource is closed on every exit path, including transport
    /// failure.
    #[instrument(skip(self), fields(process = %self.process, resource = %self.resource))]
    pub async fn run(&mut self) -> Result<()> {
        let outcome = self.serve().await;
        self.close_resource();
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let (correlation, message) = self.inbound.next().await?;
            match message {
                Message::PrepareRequest(request) => {
                    let (code, elapsed) = self.busy(|proxy| {
                        proxy
                            .switch
                            .prepare(&request.trid, request.resource.value(), request.flags)
                    });
                    debug!(trid = %request.trid, code, ?elapsed, "prepare");
                    self.reply(correlation, &request.trid, code, elapsed, Message::PrepareReply)?;
                }
                Message::CommitRequest(request) => {
                    let (code, elapsed) = self.busy(|proxy| {
                        proxy
                            .switch
                            .commit(&request.trid, request.resource.value(), request.flags)
                    });
                    if code != XA_OK {
                        self.scan_after_failed_commit(&request.trid, code);
                    }
                    debug!(trid = %request.trid, code, ?elapsed, "commit");
                    self.reply(correlation, &request.trid, code, elapsed, Message::CommitReply)?;
                }
                Message::RollbackRequest(request) => {
                    let (code, elapsed) = self.busy(|proxy| {
                        proxy
                            .switch
                            .rollback(&request.trid, request.resource.value(), request.flags)
                    });
                    debug!(trid = %request.trid, code, ?elapsed, "rollback");
                    self.reply(correlation, &request.trid, code, elapsed, Message::RollbackReply)?;
                }
                Message::Shutdown => {
                    info!("shutdown directive received");
                    return Ok(());
                }
                other => {
                    warn!(message_type = other.message_type(), "unexpected message ignored");
                }
            }
        }
    }

    /// Runs one switch call with the proxy marked busy, timing the call
    /// itself so the manager can tell resource time from transport time.
    fn busy(&mut self, call: impl FnOnce(&mut Self) -> i32) -> (i32, Duration) {
        self.state = ProxyState::Busy;
        let started = Instant::now();
        let code = call(self);
        let elapsed = started.elapsed();
        self.state = ProxyState::Idle;
        (code, elapsed)
    }

    fn reply(
        &self,
        correlation: uuid::Uuid,
        trid: &Xid,
        code: i32,
        elapsed: Duration,
        wrap: fn(DirectiveReply) -> Message,
    ) -> Result<()> {
        self.transport.send_correlated(
            self.manager,
            correlation,
            &wrap(DirectiveReply {
                process: self.process,
                resource: self.resource,
                trid: trid.clone(),
                code,
                elapsed_us: elapsed.as_micros() as u64,
            }),
        )
    }

    /// After a failed commit, ask the resource what it still holds so the
    /// operator can see whether the branch is in doubt on the RM side.
    fn scan_after_failed_commit(&mut self, trid: &Xid, code: i32) {
        let held = self.switch.recover(self.resource.value(), XA_TMNOFLAGS);
        let still_prepared = held.iter().any(|h| h.same_global(trid));
        warn!(
            %trid,
            code,
            held = held.len(),
            still_prepared,
            "commit failed, recover scan completed"
        );
    }

    /// Closes the resource. Never fails: a close error at shutdown is
    /// logged and swallowed.
    fn close_resource(&mut self) {
        if self.state == ProxyState::Closed {
            return;
        }
        let code = self
            .switch
            .close(&self.closeinfo, self.resource.value(), XA_TMNOFLAGS);
        if code != XA_OK {
            warn!(resource = %self.resource, code, "resource close returned an error");
        }
        self.state = ProxyState::Closed;
    }
}

impl<S: XaSwitch> Drop for ResourceProxy<S> {
    fn drop(&mut self) {
        self.close_resource();
    }
}
