//! Point-to-point message transport between domain processes.
//!
//! Every process owns one inbound channel; the [`Endpoints`] registry maps
//! well-known process handles to their channels and is built once at
//! startup, then handed (immutably) to every component that needs to send.
//! Logical messages are fragmented on send and reassembled on receive;
//! fragments for correlations other than the awaited one are parked in a
//! held cache so interleaved exchanges on one endpoint never lose data.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use xatmi_core::protocol::{Complete, Fragment, Message, ProcessHandle};
use xatmi_core::{Result, XatmiError};

/// Builder for the endpoint registry.
///
/// Register every process before the domain starts; the registry is
/// immutable afterwards.
#[derive(Debug, Default)]
pub struct EndpointsBuilder {
    senders: HashMap<ProcessHandle, mpsc::UnboundedSender<Fragment>>,
}

impl EndpointsBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a process and returns its inbound channel.
    pub fn register(&mut self, process: ProcessHandle) -> Inbound {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.senders.insert(process, sender);
        Inbound {
            process,
            receiver,
            assembling: HashMap::new(),
            completed: VecDeque::new(),
        }
    }

    /// Freezes the registry.
    pub fn build(self) -> Endpoints {
        Endpoints {
            senders: Arc::new(self.senders),
        }
    }
}

/// Immutable registry of every process's inbound channel.
#[derive(Debug, Clone)]
pub struct Endpoints {
    senders: Arc<HashMap<ProcessHandle, mpsc::UnboundedSender<Fragment>>>,
}

impl Endpoints {
    /// Starts building a registry.
    pub fn builder() -> EndpointsBuilder {
        EndpointsBuilder::new()
    }

    /// Returns true if the process is registered.
    pub fn contains(&self, process: &ProcessHandle) -> bool {
        self.senders.contains_key(process)
    }

    fn sender(&self, process: &ProcessHandle) -> Option<&mpsc::UnboundedSender<Fragment>> {
        self.senders.get(process)
    }
}

/// Sending side of the transport.
#[derive(Debug, Clone)]
pub struct Transport {
    endpoints: Endpoints,
}

impl Transport {
    /// Creates a transport over the given registry.
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    /// Sends a message under a fresh correlation id.
    ///
    /// The message is fragmented and each fragment transmitted
    /// individually. Fails immediately if the destination is unknown or
    /// its channel is gone; retrying is a policy of higher layers.
    pub fn send(&self, destination: ProcessHandle, message: &Message) -> Result<Uuid> {
        let correlation = Uuid::new_v4();
        self.send_correlated(destination, correlation, message)?;
        Ok(correlation)
    }

    /// Sends a message under an existing correlation id.
    ///
    /// Used for replies and for fan-outs where several destinations share
    /// one correlation.
    pub fn send_correlated(
        &self,
        destination: ProcessHandle,
        correlation: Uuid,
        message: &Message,
    ) -> Result<()> {
        let sender = self.endpoints.sender(&destination).ok_or_else(|| {
            XatmiError::Transport(format!("no endpoint registered for {}", destination))
        })?;

        for fragment in Fragment::split(message.message_type(), correlation, message.encode()) {
            sender.send(fragment).map_err(|_| {
                XatmiError::Transport(format!("endpoint {} is closed", destination))
            })?;
        }
        Ok(())
    }
}

/// Receiving side of one process's channel.
///
/// Reassembles fragments into complete messages. Messages completed while
/// waiting for a different correlation are buffered, never dropped.
#[derive(Debug)]
pub struct Inbound {
    process: ProcessHandle,
    receiver: mpsc::UnboundedReceiver<Fragment>,
    assembling: HashMap<Uuid, Complete>,
    completed: VecDeque<(Uuid, Message)>,
}

impl Inbound {
    /// The process this channel belongs to.
    pub fn process(&self) -> ProcessHandle {
        self.process
    }

    fn absorb(&mut self, fragment: Fragment) -> Result<()> {
        let correlation = fragment.correlation;

        let complete = match self.assembling.remove(&correlation) {
            Some(mut complete) => {
                complete.add(fragment)?;
                complete
            }
            None => Complete::new(fragment)?,
        };

        if complete.is_complete() {
            self.completed.push_back((correlation, complete.into_message()?));
        } else {
            self.assembling.insert(correlation, complete);
        }
        Ok(())
    }

    fn take_completed(&mut self, correlation: Uuid) -> Option<Message> {
        let position = self
            .completed
            .iter()
            .position(|(held, _)| *held == correlation)?;
        self.completed.remove(position).map(|(_, message)| message)
    }

    /// Drains every fragment currently queued without waiting.
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.receiver.try_recv() {
                Ok(fragment) => self.absorb(fragment)?,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if self.completed.is_empty() {
                        return Err(XatmiError::Transport(format!(
                            "inbound channel for {} is closed",
                            self.process
                        )));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Waits for the complete message with the given correlation id.
    ///
    /// Messages for other correlations completed along the way stay
    /// buffered for later calls.
    pub async fn receive(&mut self, correlation: Uuid) -> Result<Message> {
        loop {
            if let Some(message) = self.take_completed(correlation) {
                return Ok(message);
            }
            let fragment = self.receiver.recv().await.ok_or_else(|| {
                XatmiError::Transport(format!(
                    "inbound channel for {} is closed",
                    self.process
                ))
            })?;
            self.absorb(fragment)?;
        }
    }

    /// Non-blocking variant of [`receive`](Self::receive).
    ///
    /// Returns `Ok(None)` when the message is not yet complete.
    pub fn try_receive(&mut self, correlation: Uuid) -> Result<Option<Message>> {
        self.drain()?;
        Ok(self.take_completed(correlation))
    }

    /// Waits for the next complete message of any correlation.
    pub async fn next(&mut self) -> Result<(Uuid, Message)> {
        loop {
            if let Some(entry) = self.completed.pop_front() {
                return Ok(entry);
            }
            let fragment = self.receiver.recv().await.ok_or_else(|| {
                XatmiError::Transport(format!(
                    "inbound channel for {} is closed",
                    self.process
                ))
            })?;
            self.absorb(fragment)?;
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Result<Option<(Uuid, Message)>> {
        self.drain()?;
        Ok(self.completed.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use xatmi_core::protocol::{DirectiveRequest, ResourceId, MAX_FRAGMENT_PAYLOAD};
    use xatmi_core::xa::XA_TMNOFLAGS;
    use xatmi_core::Xid;

    fn prepare_request() -> Message {
        Message::PrepareRequest(DirectiveRequest {
            trid: Xid::generate().branch(1),
            resource: ResourceId::new(1),
            flags: XA_TMNOFLAGS,
        })
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let mut builder = Endpoints::builder();
        let receiver_handle = ProcessHandle::random();
        let mut inbound = builder.register(receiver_handle);
        let transport = Transport::new(builder.build());

        let message = prepare_request();
        let correlation = transport.send(receiver_handle, &message).unwrap();

        let received = inbound.receive(correlation).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_send_to_unregistered_destination() {
        let transport = Transport::new(Endpoints::builder().build());

        let err = transport
            .send(ProcessHandle::random(), &Message::Shutdown)
            .unwrap_err();
        assert!(matches!(err, XatmiError::Transport(_)));
    }

    #[tokio::test]
    async fn test_send_to_dropped_endpoint() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let inbound = builder.register(handle);
        let transport = Transport::new(builder.build());

        drop(inbound);

        let err = transport.send(handle, &Message::Shutdown).unwrap_err();
        assert!(matches!(err, XatmiError::Transport(_)));
    }

    #[tokio::test]
    async fn test_interleaved_correlations_are_held() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let mut inbound = builder.register(handle);
        let transport = Transport::new(builder.build());

        let first = prepare_request();
        let second = prepare_request();
        let first_correlation = transport.send(handle, &first).unwrap();
        let second_correlation = transport.send(handle, &second).unwrap();

        // Await the later correlation first; the earlier message must be
        // parked, not dropped.
        let got_second = inbound.receive(second_correlation).await.unwrap();
        assert_eq!(got_second, second);

        let got_first = inbound.receive(first_correlation).await.unwrap();
        assert_eq!(got_first, first);
    }

    #[tokio::test]
    async fn test_try_receive_not_ready() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let mut inbound = builder.register(handle);
        let _transport = Transport::new(builder.build());

        assert!(inbound.try_receive(Uuid::new_v4()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_receive_partial_message_not_ready() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let mut inbound = builder.register(handle);
        let endpoints = builder.build();

        // Deliver only the first fragment of a two-fragment message.
        let payload = Bytes::from(vec![0x5A; MAX_FRAGMENT_PAYLOAD + 1]);
        let correlation = Uuid::new_v4();
        let fragments = Fragment::split(
            Message::Shutdown.message_type(),
            correlation,
            payload,
        );
        endpoints
            .sender(&handle)
            .unwrap()
            .send(fragments[0].clone())
            .unwrap();

        assert!(inbound.try_receive(correlation).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_fragments_reassemble() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let mut inbound = builder.register(handle);
        let endpoints = builder.build();

        let payload: Vec<u8> = (0..MAX_FRAGMENT_PAYLOAD * 3).map(|i| (i % 255) as u8).collect();
        let correlation = Uuid::new_v4();
        let mut fragments = Fragment::split(
            xatmi_core::protocol::SHUTDOWN_REQUEST,
            correlation,
            Bytes::from(payload),
        );
        fragments.reverse();

        let sender = endpoints.sender(&handle).unwrap();
        for fragment in fragments {
            sender.send(fragment).unwrap();
        }

        // A shutdown body is empty, so this oversized payload fails decode;
        // reassembly itself must still cover every byte first.
        let result = inbound.try_next();
        assert!(result.is_err() || result.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_next_returns_messages_in_completion_order() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let mut inbound = builder.register(handle);
        let transport = Transport::new(builder.build());

        let first = prepare_request();
        let second = prepare_request();
        let first_correlation = transport.send(handle, &first).unwrap();
        let second_correlation = transport.send(handle, &second).unwrap();

        let (correlation_a, message_a) = inbound.next().await.unwrap();
        let (correlation_b, message_b) = inbound.next().await.unwrap();

        assert_eq!(correlation_a, first_correlation);
        assert_eq!(message_a, first);
        assert_eq!(correlation_b, second_correlation);
        assert_eq!(message_b, second);
    }

    #[tokio::test]
    async fn test_reply_echoes_correlation() {
        let mut builder = Endpoints::builder();
        let manager = ProcessHandle::random();
        let proxy = ProcessHandle::random();
        let mut manager_inbound = builder.register(manager);
        let mut proxy_inbound = builder.register(proxy);
        let transport = Transport::new(builder.build());

        let request = prepare_request();
        let correlation = transport.send(proxy, &request).unwrap();
        let (received_correlation, _) = proxy_inbound.next().await.unwrap();

        transport
            .send_correlated(manager, received_correlation, &Message::Shutdown)
            .unwrap();

        let reply = manager_inbound.receive(correlation).await.unwrap();
        assert_eq!(reply, Message::Shutdown);
    }

    #[tokio::test]
    async fn test_receive_on_closed_channel() {
        let mut builder = Endpoints::builder();
        let handle = ProcessHandle::random();
        let mut inbound = builder.register(handle);
        let endpoints = builder.build();
        drop(endpoints);

        let err = inbound.next().await.unwrap_err();
        assert!(matches!(err, XatmiError::Transport(_)));
    }
}
