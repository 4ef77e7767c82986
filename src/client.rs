//! # Client Façade
//!
//! Owns the framed channel and wires the engine together: the send queue
//! feeding the message writer behind a mutex, the receive pump driving the
//! chunked state machine on its own task, the control correlator registry
//! and the routing sinks.
//!
//! Lifecycle: [`SomeIpDaemonClient::connect`] establishes the IPC
//! connection, [`SomeIpDaemonClient::start`] arms the receive path and the
//! send pump. `connect` must complete before `start`; calling `start`
//! twice is a programming error that aborts. [`SomeIpDaemonClient::disconnect`]
//! is idempotent: the first call fails every outstanding control promise
//! with [`IpcError::Disconnected`] and wakes both pumps, later calls do
//! nothing.
//!
//! Threading: user-facing calls run on arbitrary application tasks and
//! only touch the send engine mutex and the per-controller mutexes; all
//! inbound dispatch happens sequentially on the receive pump.

use crate::config::IpcConfig;
use crate::control::{
    ClientId, CommandSender, ControllerRegistry, EventgroupSubscription,
    RequestLocalServerController, RequestServiceController, ServiceInstance,
};
use crate::error::{fatal, IpcError};
use crate::ipc::channel::{DisconnectHandle, FramedChannel, ReceiveChannel, SendChannel};
use crate::ipc::protocol::{
    CommonHeader, MessageType, SpecificHeader, COMMON_HEADER_SIZE, IPC_HEADER_SIZE,
};
use crate::ipc::receiver::MessageReceiver;
use crate::ipc::writer::{MessageWriter, StartAsyncStream, StreamWriteStatus};
use crate::queue::SendQueue;
use crate::routing::{Dispatcher, RoutingSink, RoutingSinks};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

enum PumpStatus {
    /// Queue empty, wait for new work.
    Idle,
    /// Ring full, wait for the writable doorbell.
    WaitWritable,
}

struct SendInner {
    queue: SendQueue,
    writer: MessageWriter,
    channel: SendChannel,
    /// A stream write for the queue front is in progress.
    streaming: bool,
}

/// Serializes enqueue and write-out of outgoing messages. API tasks
/// enqueue and kick the pump task, which drains the queue and resumes
/// suspended writes when the daemon frees ring space.
pub(crate) struct SendEngine {
    inner: Mutex<SendInner>,
    kick: Arc<Notify>,
    writable_bell: Arc<Notify>,
    disconnect: DisconnectHandle,
}

impl SendEngine {
    fn new(config: &IpcConfig, channel: SendChannel, disconnect: DisconnectHandle) -> Arc<Self> {
        let kick = Arc::new(Notify::new());
        disconnect.add_bell(kick.clone());
        let writable_bell = channel.writable_bell();
        Arc::new(Self {
            inner: Mutex::new(SendInner {
                queue: SendQueue::new(config.ipc_max_queue_size),
                writer: MessageWriter::new(config.max_message_size),
                channel,
                streaming: false,
            }),
            kick,
            writable_bell,
            disconnect,
        })
    }

    fn enqueue_data(&self, header: &[u8], payload: &[u8]) -> Result<(), IpcError> {
        if self.disconnect.is_disconnected() {
            return Err(IpcError::Disconnected);
        }
        self.inner.lock().queue.push_back_data(header, payload)
    }

    /// Drain as much of the queue as the ring accepts.
    fn pump(&self) -> PumpStatus {
        let mut inner = self.inner.lock();
        let SendInner {
            queue,
            writer,
            channel,
            streaming,
        } = &mut *inner;

        loop {
            if !*streaming {
                let front = match queue.front() {
                    Some(front) => front,
                    None => return PumpStatus::Idle,
                };
                let common = CommonHeader::decode(&front.header);
                let specific = SpecificHeader::decode(&front.header[COMMON_HEADER_SIZE..]);
                match writer.prepare_stream(channel, common, Some(specific), front.payload.len()) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        debug!("send path stopped: {e}");
                        return PumpStatus::Idle;
                    }
                    Err(e) => {
                        error!("dropping unsendable queued message: {e}");
                        queue.pop_front();
                        continue;
                    }
                }
                *streaming = true;
                match writer.start_async_stream(channel) {
                    Ok(StartAsyncStream::SpaceAvailable) => {}
                    Ok(StartAsyncStream::NoFreeSpace) => return PumpStatus::WaitWritable,
                    Err(e) => {
                        debug!("send path stopped: {e}");
                        return PumpStatus::Idle;
                    }
                }
            }

            let front = match queue.front() {
                Some(front) => front,
                None => return PumpStatus::Idle,
            };
            let payload: [&[u8]; 1] = [front.payload.as_slice()];
            match writer.stream_write_message(channel, &payload) {
                Ok(outcome) => {
                    if outcome.readable_notification_needed {
                        channel.notify_peer_readable();
                    }
                    match outcome.status {
                        StreamWriteStatus::Completed => {
                            *streaming = false;
                            queue.pop_front();
                        }
                        StreamWriteStatus::OngoingMoreSpace => {}
                        StreamWriteStatus::OngoingNoSpace => return PumpStatus::WaitWritable,
                    }
                }
                Err(e) => {
                    debug!("send path stopped: {e}");
                    return PumpStatus::Idle;
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.disconnect.is_disconnected() {
                break;
            }
            match self.pump() {
                PumpStatus::Idle => self.kick.notified().await,
                PumpStatus::WaitWritable => self.writable_bell.notified().await,
            }
        }
        debug!("send pump stopped");
    }
}

impl CommandSender for SendEngine {
    fn is_disconnected(&self) -> bool {
        self.disconnect.is_disconnected()
    }

    fn enqueue_command(&self, header: &[u8], payload: &[u8]) -> Result<(), IpcError> {
        if self.disconnect.is_disconnected() {
            return Err(IpcError::Disconnected);
        }
        self.inner.lock().queue.push_back_command(header, payload)
    }

    fn kick(&self) {
        self.kick.notify_one();
    }
}

/// Receive pump state moved onto its own task by `start`.
struct ReceiveEngine {
    channel: ReceiveChannel,
    receiver: MessageReceiver,
    dispatcher: Dispatcher,
    disconnect: DisconnectHandle,
    registry: Arc<ControllerRegistry>,
}

impl ReceiveEngine {
    async fn run(mut self) {
        let bell = self.channel.readable_bell();
        loop {
            if self.disconnect.is_disconnected() {
                break;
            }
            let available = match self.channel.available_read() {
                Ok(n) => n,
                Err(e) => {
                    if e.is_fatal() && !matches!(e, IpcError::Disconnected) {
                        error!("receive path poisoned: {e}");
                    }
                    break;
                }
            };
            if available == 0 {
                self.channel.request_readable();
                match self.channel.available_read() {
                    Ok(0) => {
                        bell.notified().await;
                        continue;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            if let Err(e) = self
                .receiver
                .drive(&mut self.channel, &self.dispatcher)
                .await
            {
                if e.is_fatal() && !matches!(e, IpcError::Disconnected) {
                    error!("receive state machine failed: {e}");
                }
                break;
            }
        }
        // whatever stopped the pump, the outstanding promises must resolve
        self.disconnect.trigger();
        self.registry.fail_all_disconnected();
        debug!("receive pump stopped");
    }
}

/// Typed asynchronous client for the co-located SOME/IP daemon.
pub struct SomeIpDaemonClient {
    send_engine: Arc<SendEngine>,
    registry: Arc<ControllerRegistry>,
    sinks: Arc<RoutingSinks>,
    request_service: Arc<RequestServiceController>,
    request_local_server: Arc<RequestLocalServerController>,
    disconnect: DisconnectHandle,
    receive: Mutex<Option<ReceiveEngine>>,
    started: AtomicBool,
}

impl SomeIpDaemonClient {
    /// Establish the IPC connection to the daemon addressed by `config`.
    pub async fn connect(config: &IpcConfig) -> Result<Self, IpcError> {
        let channel = FramedChannel::connect(config).await?;
        info!(
            domain = %config.someipd_ipc_domain,
            port = config.someipd_ipc_port,
            "connected to the SOME/IP daemon"
        );
        Ok(Self::from_channel(config, channel))
    }

    /// Build a client over an already-established channel. This is how a
    /// same-process peer (or a test harness) stands in for the daemon.
    pub fn from_channel(config: &IpcConfig, channel: FramedChannel) -> Self {
        let (send_channel, recv_channel, disconnect) = channel.split();
        let send_engine = SendEngine::new(config, send_channel, disconnect.clone());

        let registry = Arc::new(ControllerRegistry::new());
        let sinks = Arc::new(RoutingSinks::new());

        let sender: Arc<dyn CommandSender> = send_engine.clone();
        let request_service = RequestServiceController::new(sender.clone());
        let request_local_server = RequestLocalServerController::new(sender);
        registry.register(MessageType::RequestService, request_service.clone());
        registry.register(MessageType::RequestLocalServer, request_local_server.clone());

        let receive = ReceiveEngine {
            channel: recv_channel,
            receiver: MessageReceiver::new(config.max_message_size),
            dispatcher: Dispatcher::new(registry.clone(), sinks.clone()),
            disconnect: disconnect.clone(),
            registry: registry.clone(),
        };

        Self {
            send_engine,
            registry,
            sinks,
            request_service,
            request_local_server,
            disconnect,
            receive: Mutex::new(Some(receive)),
            started: AtomicBool::new(false),
        }
    }

    /// Arm the receive path and the send pump. Must be called exactly once
    /// after `connect`; a second call aborts.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            fatal("client started twice");
        }
        let receive = match self.receive.lock().take() {
            Some(receive) => receive,
            None => fatal("receive engine missing at start"),
        };
        tokio::spawn(receive.run());
        tokio::spawn(self.send_engine.clone().run());
        debug!("client pumps armed");
    }

    fn require_started(&self) -> Result<(), IpcError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(IpcError::NotConnected);
        }
        Ok(())
    }

    /// Request access to a service instance; resolves with the client
    /// identifier the daemon assigned.
    pub async fn request_service(&self, request: ServiceInstance) -> Result<ClientId, IpcError> {
        self.require_started()?;
        self.request_service.invoke(request).await
    }

    /// Request the local server role for this application.
    pub async fn request_local_server(&self) -> Result<(), IpcError> {
        self.require_started()?;
        self.request_local_server.invoke().await
    }

    fn send_command(&self, message_type: MessageType, body: &[u8]) -> Result<(), IpcError> {
        let mut header = [0u8; IPC_HEADER_SIZE];
        let common = CommonHeader::new(message_type.raw(), body.len());
        header[..12].copy_from_slice(&common.encode());
        header[12..].copy_from_slice(&SpecificHeader::default().encode());
        self.send_engine.enqueue_command(&header, body)?;
        self.send_engine.kick();
        Ok(())
    }

    pub fn offer_service(&self, service: ServiceInstance) -> Result<(), IpcError> {
        self.send_command(MessageType::OfferService, &service.to_bytes())
    }

    pub fn stop_offer_service(&self, service: ServiceInstance) -> Result<(), IpcError> {
        self.send_command(MessageType::StopOfferService, &service.to_bytes())
    }

    pub fn release_service(&self, service: ServiceInstance) -> Result<(), IpcError> {
        self.send_command(MessageType::ReleaseService, &service.to_bytes())
    }

    pub fn subscribe_event(&self, subscription: EventgroupSubscription) -> Result<(), IpcError> {
        self.send_command(MessageType::SubscribeEvent, &subscription.to_bytes())
    }

    pub fn unsubscribe_event(&self, subscription: EventgroupSubscription) -> Result<(), IpcError> {
        self.send_command(MessageType::UnsubscribeEvent, &subscription.to_bytes())
    }

    pub fn start_service_discovery(&self) -> Result<(), IpcError> {
        self.send_command(MessageType::StartServiceDiscovery, &[])
    }

    pub fn stop_service_discovery(&self) -> Result<(), IpcError> {
        self.send_command(MessageType::StopServiceDiscovery, &[])
    }

    /// Route a SOME/IP frame (header plus payload) toward the network.
    /// Fails with [`IpcError::ResourceExhausted`] when the data class of
    /// the send queue is at its configured capacity.
    pub fn send_someip(&self, instance_id: u16, frame: &[u8]) -> Result<(), IpcError> {
        self.send_data(MessageType::RoutingSomeIp, instance_id, frame)
    }

    /// Route a signal-based PDU toward the network.
    pub fn send_pdu(&self, instance_id: u16, pdu: &[u8]) -> Result<(), IpcError> {
        self.send_data(MessageType::RoutingPdu, instance_id, pdu)
    }

    fn send_data(
        &self,
        message_type: MessageType,
        instance_id: u16,
        payload: &[u8],
    ) -> Result<(), IpcError> {
        let mut header = [0u8; IPC_HEADER_SIZE];
        let common = CommonHeader::new(message_type.raw(), payload.len());
        header[..12].copy_from_slice(&common.encode());
        header[12..].copy_from_slice(&SpecificHeader::from_instance(instance_id).encode());
        self.send_engine.enqueue_data(&header, payload)?;
        self.send_engine.kick();
        Ok(())
    }

    /// Late-bind the proxy-side manager receiving inbound routed traffic.
    pub fn bind_client_manager(&self, manager: Arc<dyn RoutingSink>) {
        self.sinks.bind_client_manager(manager);
    }

    /// Late-bind the skeleton-side manager receiving inbound requests.
    pub fn bind_server_manager(&self, manager: Arc<dyn RoutingSink>) {
        self.sinks.bind_server_manager(manager);
    }

    /// Tear the connection down. Idempotent: the first call fails every
    /// pending control promise with `Disconnected` and wakes both pumps.
    pub fn disconnect(&self) {
        if self.disconnect.trigger() {
            self.registry.fail_all_disconnected();
            info!("disconnected from the SOME/IP daemon");
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_disconnected()
    }
}

impl Drop for SomeIpDaemonClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
