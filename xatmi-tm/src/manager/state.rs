//! Runtime state of the transaction manager: configured resources, their
//! proxy instances, and per-instance call metrics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use xatmi_core::protocol::{Connected, ProcessHandle, ResourceId};
use xatmi_core::xa::XA_OK;

use crate::config::ManagerConfig;

/// Lifecycle of one proxy instance as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Configured but no proxy has connected yet.
    Absent,
    /// Connected and free.
    Idle,
    /// Reserved for an in-flight directive.
    Busy,
    /// The proxy reported a failed open, or died.
    Error,
}

/// Running min/max/total over observed durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Number of observations.
    pub count: u64,
    /// Smallest observation.
    pub min: Duration,
    /// Largest observation.
    pub max: Duration,
    /// Sum of all observations.
    pub total: Duration,
}

impl Stat {
    /// Folds one observation in.
    pub fn record(&mut self, sample: Duration) {
        if self.count == 0 || sample < self.min {
            self.min = sample;
        }
        if sample > self.max {
            self.max = sample;
        }
        self.count += 1;
        self.total += sample;
    }

    /// Mean observation, zero before the first sample.
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Outstanding requests that have not been answered yet, by correlation.
#[derive(Debug, Default)]
pub struct PendingRequests {
    outstanding: HashMap<uuid::Uuid, Instant>,
}

impl PendingRequests {
    /// Notes a request going out.
    pub fn add(&mut self, correlation: uuid::Uuid, at: Instant) {
        self.outstanding.insert(correlation, at);
    }

    /// Notes the answer arriving; returns the round-trip time.
    pub fn resolve(&mut self, correlation: uuid::Uuid, at: Instant) -> Option<Duration> {
        self.outstanding
            .remove(&correlation)
            .map(|sent| at.saturating_duration_since(sent))
    }

    /// Number of unanswered requests.
    pub fn count(&self) -> usize {
        self.outstanding.len()
    }

    /// Age of the oldest unanswered request.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.outstanding
            .values()
            .map(|sent| now.saturating_duration_since(*sent))
            .max()
    }
}

/// One proxy instance slot of one resource.
#[derive(Debug)]
pub struct Instance {
    /// Process handle, filled in when the proxy connects.
    pub process: Option<ProcessHandle>,
    /// Current state.
    pub state: InstanceState,
    reserved_at: Option<Instant>,
    /// Round trip from reserve to unreserve, per directive. Includes
    /// transport time on top of the XA call itself.
    pub roundtrip_time: Stat,
    /// Time inside the XA call, as measured by the proxy and carried in
    /// the directive reply.
    pub resource_time: Stat,
}

impl Instance {
    fn absent() -> Self {
        Self {
            process: None,
            state: InstanceState::Absent,
            reserved_at: None,
            roundtrip_time: Stat::default(),
            resource_time: Stat::default(),
        }
    }

    /// Marks the instance busy for one directive.
    pub fn reserve(&mut self, now: Instant) {
        self.state = InstanceState::Busy;
        self.reserved_at = Some(now);
    }

    /// Folds one directive's round trip and switch-call time in, and
    /// returns the instance to idle unless it has failed in the
    /// meantime; a late reply must not resurrect a dead instance.
    ///
    /// An unreserve without a matching reserve is a bookkeeping bug and
    /// is dropped rather than corrupting the stats.
    pub fn unreserve(&mut self, now: Instant, call_time: Duration) {
        let Some(reserved_at) = self.reserved_at.take() else {
            warn!("unreserve without matching reserve ignored");
            return;
        };
        self.roundtrip_time
            .record(now.saturating_duration_since(reserved_at));
        self.resource_time.record(call_time);
        if self.state != InstanceState::Error {
            self.state = InstanceState::Idle;
        }
    }
}

/// One configured resource and its proxy instances.
#[derive(Debug)]
pub struct Resource {
    /// Id handed to proxies and carried in directives.
    pub id: ResourceId,
    /// Configured key.
    pub key: String,
    /// Open string for proxies serving this resource.
    pub openinfo: String,
    /// Close string for proxies serving this resource.
    pub closeinfo: String,
    /// Instance slots, `instances` many.
    pub instances: Vec<Instance>,
}

impl Resource {
    /// The instance slot owned by a process, if any.
    pub fn instance_mut(&mut self, process: ProcessHandle) -> Option<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.process == Some(process))
    }
}

/// The manager's mutable world: configured resources and broadcast
/// bookkeeping live here, transactions are owned by the manager itself.
#[derive(Debug, Default)]
pub struct State {
    /// Configured resources, ids allocated in configuration order.
    pub resources: Vec<Resource>,
    /// Unanswered directives by correlation.
    pub pending: PendingRequests,
}

impl State {
    /// Builds the resource table from validated configuration.
    ///
    /// Resource ids are allocated sequentially from 1 in configuration
    /// order and stay stable for the life of the domain.
    pub fn configure(config: &ManagerConfig) -> Self {
        let resources = config
            .resources
            .iter()
            .enumerate()
            .map(|(index, entry)| Resource {
                id: ResourceId::new(index as i32 + 1),
                key: entry.key.clone(),
                openinfo: entry.openinfo.clone(),
                closeinfo: entry.closeinfo.clone(),
                instances: (0..entry.instances).map(|_| Instance::absent()).collect(),
            })
            .collect();
        Self {
            resources,
            pending: PendingRequests::default(),
        }
    }

    /// Looks a resource up by id.
    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Looks a resource up by id, mutably.
    pub fn resource_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.id == id)
    }

    /// Looks a resource up by configured key.
    pub fn resource_by_key(&self, key: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.key == key)
    }

    /// Records a proxy connect report in the first absent slot.
    pub fn connected(&mut self, connected: &Connected) {
        let Some(resource) = self.resource_mut(connected.resource) else {
            warn!(resource = %connected.resource, process = %connected.process,
                "connect report for unknown resource ignored");
            return;
        };
        let Some(slot) = resource
            .instances
            .iter_mut()
            .find(|i| i.state == InstanceState::Absent)
        else {
            warn!(resource = %connected.resource, process = %connected.process,
                "connect report but every instance slot is taken");
            return;
        };
        slot.process = Some(connected.process);
        slot.state = if connected.state == XA_OK {
            InstanceState::Idle
        } else {
            InstanceState::Error
        };
        info!(resource = %connected.resource, process = %connected.process,
            state = connected.state, "resource instance connected");
    }

    /// Marks every instance owned by a dead process as failed.
    pub fn process_down(&mut self, process: ProcessHandle) {
        for resource in &mut self.resources {
            if let Some(instance) = resource.instance_mut(process) {
                instance.state = InstanceState::Error;
                warn!(resource = %resource.id, %process, "resource instance lost");
            }
        }
    }

    /// Every connected, non-failed instance process across all resources.
    pub fn live_instances(&self) -> Vec<(ResourceId, ProcessHandle)> {
        self.resources
            .iter()
            .flat_map(|resource| {
                resource.instances.iter().filter_map(move |instance| {
                    match (instance.process, instance.state) {
                        (Some(process), InstanceState::Idle | InstanceState::Busy) => {
                            Some((resource.id, process))
                        }
                        _ => None,
                    }
                })
            })
            .collect()
    }
}

/// Point-in-time snapshot of one instance, for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceSnapshot {
    /// Process handle, if connected.
    pub process: Option<String>,
    /// State name.
    pub state: String,
    /// Directive count.
    pub calls: u64,
    /// Mean round trip in microseconds.
    pub roundtrip_avg_us: u128,
    /// Mean XA call time in microseconds.
    pub resource_avg_us: u128,
}

/// Point-in-time snapshot of one resource.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceSnapshot {
    /// Configured key.
    pub key: String,
    /// Allocated id.
    pub id: i32,
    /// Instance details.
    pub instances: Vec<InstanceSnapshot>,
}

impl State {
    /// Serializable view of the resource table for operators.
    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        self.resources
            .iter()
            .map(|resource| ResourceSnapshot {
                key: resource.key.clone(),
                id: resource.id.value(),
                instances: resource
                    .instances
                    .iter()
                    .map(|instance| InstanceSnapshot {
                        process: instance.process.map(|p| p.to_string()),
                        state: format!("{:?}", instance.state),
                        calls: instance.roundtrip_time.count,
                        roundtrip_avg_us: instance.roundtrip_time.average().as_micros(),
                        resource_avg_us: instance.resource_time.average().as_micros(),
                    })
                    .collect(),
            })
            .collect()
    }
}
