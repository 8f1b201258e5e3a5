//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use xatmi_core::xa::{Xid, XA_OK};
use xatmi_tm::resource::XaSwitch;

/// XA switch that records every call and replays scripted return codes.
///
/// Clones share state, so a test can keep a handle while the proxy owns
/// another.
#[derive(Clone, Default)]
pub struct RecordingSwitch {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<String>,
    prepare_codes: VecDeque<i32>,
    commit_codes: VecDeque<i32>,
    recovered: Vec<Xid>,
}

impl RecordingSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the return code for the next prepare call.
    pub fn script_prepare(&self, code: i32) {
        self.inner.lock().unwrap().prepare_codes.push_back(code);
    }

    /// Queues the return code for the next commit call.
    pub fn script_commit(&self, code: i32) {
        self.inner.lock().unwrap().commit_codes.push_back(code);
    }

    /// Seeds the xids a recover scan reports.
    pub fn hold(&self, trid: Xid) {
        self.inner.lock().unwrap().recovered.push(trid);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls whose name starts with the given prefix.
    pub fn calls_named(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

impl XaSwitch for RecordingSwitch {
    fn open(&mut self, openinfo: &str, rm_id: i32, _flags: i64) -> i32 {
        self.record(format!("open({},{})", openinfo, rm_id));
        XA_OK
    }

    fn close(&mut self, closeinfo: &str, rm_id: i32, _flags: i64) -> i32 {
        self.record(format!("close({},{})", closeinfo, rm_id));
        XA_OK
    }

    fn prepare(&mut self, trid: &Xid, _rm_id: i32, _flags: i64) -> i32 {
        self.record(format!("prepare({})", trid));
        self.inner
            .lock()
            .unwrap()
            .prepare_codes
            .pop_front()
            .unwrap_or(XA_OK)
    }

    fn commit(&mut self, trid: &Xid, _rm_id: i32, _flags: i64) -> i32 {
        self.record(format!("commit({})", trid));
        self.inner
            .lock()
            .unwrap()
            .commit_codes
            .pop_front()
            .unwrap_or(XA_OK)
    }

    fn rollback(&mut self, trid: &Xid, _rm_id: i32, _flags: i64) -> i32 {
        self.record(format!("rollback({})", trid));
        XA_OK
    }

    fn recover(&mut self, _rm_id: i32, _flags: i64) -> Vec<Xid> {
        self.record("recover".to_string());
        self.inner.lock().unwrap().recovered.clone()
    }
}
