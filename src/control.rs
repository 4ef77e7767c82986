//! # Control Correlator
//!
//! Binds outgoing control request messages to their asynchronous positive
//! or negative responses. Each controller owns a single-shot promise slot:
//! at most one call may be in flight per controller instance, and a second
//! call before the first resolves is a programming error that aborts the
//! process.
//!
//! Controllers register with the [`ControllerRegistry`] against the raw
//! type value of their request; the receive path looks the controller up
//! by the base type of an incoming response and invokes its `fulfil` hook
//! with the return code and the response body. On disconnect every
//! registered controller fails its outstanding promise with
//! [`IpcError::Disconnected`], after which the slot is empty again and the
//! controller may be invoked anew.

use crate::error::{fatal, IpcError};
use crate::ipc::protocol::{
    return_code, CommonHeader, MessageType, SpecificHeader, COMMON_HEADER_SIZE, IPC_HEADER_SIZE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Client identifier handed out by the daemon.
pub type ClientId = u16;

/// Identification of one service instance as used by the control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
}

impl ServiceInstance {
    pub fn to_bytes(&self) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[0..2].copy_from_slice(&self.service_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.instance_id.to_le_bytes());
        out[4] = self.major_version;
        out[5..9].copy_from_slice(&self.minor_version.to_le_bytes());
        out
    }
}

/// Identification of one eventgroup for subscribe/unsubscribe commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventgroupSubscription {
    pub service_id: u16,
    pub instance_id: u16,
    pub eventgroup_id: u16,
    pub major_version: u8,
}

impl EventgroupSubscription {
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0..2].copy_from_slice(&self.service_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.instance_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.eventgroup_id.to_le_bytes());
        out[6] = self.major_version;
        out
    }
}

/// Enqueue surface the controllers use to hand serialized requests to the
/// send path.
pub(crate) trait CommandSender: Send + Sync {
    fn is_disconnected(&self) -> bool;
    fn enqueue_command(&self, header: &[u8], payload: &[u8]) -> Result<(), IpcError>;
    /// Wake the send pump after an enqueue.
    fn kick(&self);
}

/// Single-shot value-or-error carrier for one pending control call.
///
/// Observable states: empty, awaiting a response, fulfilled (transient,
/// the receiver side consumes the value). The slot returns to empty after
/// fulfilment or failure.
struct PromiseSlot<T> {
    pending: Option<oneshot::Sender<Result<T, IpcError>>>,
}

impl<T> PromiseSlot<T> {
    fn new() -> Self {
        Self { pending: None }
    }

    fn is_awaiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Occupy the slot. Aborts when a call is already in flight.
    fn begin(&mut self) -> oneshot::Receiver<Result<T, IpcError>> {
        if self.pending.is_some() {
            fatal("control call issued while the promise slot is in use");
        }
        let (tx, rx) = oneshot::channel();
        self.pending = Some(tx);
        rx
    }

    /// Roll back an occupation whose request could not be enqueued.
    fn abandon(&mut self) {
        self.pending = None;
    }

    /// Resolve the pending call. Returns `false` when no call was pending.
    fn fulfil(&mut self, value: Result<T, IpcError>) -> bool {
        match self.pending.take() {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    fn fail_disconnected(&mut self) {
        self.fulfil(Err(IpcError::Disconnected));
    }
}

/// Hook invoked by the receive path for correlated responses.
pub(crate) trait ResponseController: Send + Sync {
    fn fulfil(&self, return_code: u32, payload: &[u8]);
    fn fail_disconnected(&self);
}

/// Registry of per-request-type response controllers.
pub struct ControllerRegistry {
    entries: Mutex<HashMap<u32, Arc<dyn ResponseController>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a controller for a request type. Only request types that
    /// expect a response are valid; anything else, and re-registration,
    /// aborts.
    pub(crate) fn register(&self, request: MessageType, controller: Arc<dyn ResponseController>) {
        if !request.expects_response() {
            fatal("controller registered for a fire-and-forget command");
        }
        if self
            .entries
            .lock()
            .insert(request.raw(), controller)
            .is_some()
        {
            fatal("controller registered twice for the same request type");
        }
    }

    /// Route a control response to its controller. Responses for request
    /// types without a registered controller are dropped.
    pub(crate) fn fulfil(&self, request: MessageType, return_code: u32, payload: &[u8]) {
        let controller = self.entries.lock().get(&request.raw()).cloned();
        match controller {
            Some(controller) => controller.fulfil(return_code, payload),
            None => warn!(
                request_type = request.raw(),
                "control response for an unregistered request type dropped"
            ),
        }
    }

    /// Fail every outstanding promise with `Disconnected`. Controllers
    /// whose slot is empty are unaffected.
    pub(crate) fn fail_all_disconnected(&self) {
        let controllers: Vec<_> = self.entries.lock().values().cloned().collect();
        for controller in controllers {
            controller.fail_disconnected();
        }
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ControllerState<T> {
    slot: PromiseSlot<T>,
    /// Serializer scratch for the common + specific header block.
    header_scratch: [u8; IPC_HEADER_SIZE],
}

impl<T> ControllerState<T> {
    fn new() -> Self {
        Self {
            slot: PromiseSlot::new(),
            header_scratch: [0; IPC_HEADER_SIZE],
        }
    }

    fn serialize_header(&mut self, message_type: MessageType, payload_len: usize) {
        let common = CommonHeader::new(message_type.raw(), payload_len);
        self.header_scratch[..COMMON_HEADER_SIZE].copy_from_slice(&common.encode());
        self.header_scratch[COMMON_HEADER_SIZE..]
            .copy_from_slice(&SpecificHeader::default().encode());
    }
}

/// Controller for the `RequestService` command: resolves to the client
/// identifier the daemon assigned for the requested service instance.
pub struct RequestServiceController {
    state: Mutex<ControllerState<ClientId>>,
    sender: Arc<dyn CommandSender>,
}

impl RequestServiceController {
    pub(crate) fn new(sender: Arc<dyn CommandSender>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControllerState::new()),
            sender,
        })
    }

    pub async fn invoke(&self, request: ServiceInstance) -> Result<ClientId, IpcError> {
        if self.sender.is_disconnected() {
            return Err(IpcError::Disconnected);
        }
        let receiver = {
            let mut state = self.state.lock();
            let receiver = state.slot.begin();
            let body = request.to_bytes();
            state.serialize_header(MessageType::RequestService, body.len());
            if let Err(e) = self.sender.enqueue_command(&state.header_scratch, &body) {
                state.slot.abandon();
                return Err(e);
            }
            receiver
        };
        self.sender.kick();
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Disconnected),
        }
    }
}

impl ResponseController for RequestServiceController {
    fn fulfil(&self, code: u32, payload: &[u8]) {
        let mut state = self.state.lock();
        let result = match code {
            return_code::OK => {
                if payload.len() != std::mem::size_of::<ClientId>() {
                    state.slot.fulfil(Err(IpcError::IncorrectResponseLength));
                    fatal("request-service response body has the wrong size");
                }
                Ok(ClientId::from_le_bytes([payload[0], payload[1]]))
            }
            return_code::REQUEST_SERVICE_ACCESS_DENIED => Err(IpcError::AccessDenied),
            return_code::REQUEST_SERVICE_CLIENT_IDS_OVERFLOW => Err(IpcError::ClientIdsOverflow),
            return_code::REMOTE_SERVER_NOT_FOUND
            | return_code::REQUIRED_SERVICE_INSTANCE_NOT_FOUND => Err(IpcError::ConfigurationError),
            other => {
                // unmapped codes are error-class responses and carry no body
                if !payload.is_empty() {
                    state.slot.fulfil(Err(IpcError::IncorrectResponseLength));
                    fatal("request-service response with an unmapped return code carries a body");
                }
                warn!(return_code = other, "unmapped request-service return code");
                Err(IpcError::NotConnected)
            }
        };
        if !state.slot.fulfil(result) {
            warn!("request-service response without a pending call dropped");
        } else {
            debug!("request-service promise resolved");
        }
    }

    fn fail_disconnected(&self) {
        self.state.lock().slot.fail_disconnected();
    }
}

/// Controller for the `RequestLocalServer` command. The positive response
/// carries no body.
pub struct RequestLocalServerController {
    state: Mutex<ControllerState<()>>,
    sender: Arc<dyn CommandSender>,
}

impl RequestLocalServerController {
    pub(crate) fn new(sender: Arc<dyn CommandSender>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControllerState::new()),
            sender,
        })
    }

    pub async fn invoke(&self) -> Result<(), IpcError> {
        if self.sender.is_disconnected() {
            return Err(IpcError::Disconnected);
        }
        let receiver = {
            let mut state = self.state.lock();
            let receiver = state.slot.begin();
            state.serialize_header(MessageType::RequestLocalServer, 0);
            if let Err(e) = self.sender.enqueue_command(&state.header_scratch, &[]) {
                state.slot.abandon();
                return Err(e);
            }
            receiver
        };
        self.sender.kick();
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Disconnected),
        }
    }
}

impl ResponseController for RequestLocalServerController {
    fn fulfil(&self, code: u32, payload: &[u8]) {
        let mut state = self.state.lock();
        let result = match code {
            return_code::OK => {
                if !payload.is_empty() {
                    state.slot.fulfil(Err(IpcError::IncorrectResponseLength));
                    fatal("request-local-server response carries an unexpected body");
                }
                Ok(())
            }
            return_code::REMOTE_SERVER_NOT_FOUND
            | return_code::REQUIRED_SERVICE_INSTANCE_NOT_FOUND => Err(IpcError::ConfigurationError),
            other => {
                // unmapped codes are error-class responses and carry no body
                if !payload.is_empty() {
                    state.slot.fulfil(Err(IpcError::IncorrectResponseLength));
                    fatal("request-local-server response with an unmapped return code carries a body");
                }
                warn!(return_code = other, "unmapped request-local-server return code");
                Err(IpcError::NotConnected)
            }
        };
        if !state.slot.fulfil(result) {
            warn!("request-local-server response without a pending call dropped");
        }
    }

    fn fail_disconnected(&self) {
        self.state.lock().slot.fail_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockSender {
        disconnected: AtomicBool,
        sent: StdMutex<Vec<(Vec<u8>, Vec<u8>)>>,
    }

    impl MockSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                disconnected: AtomicBool::new(false),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    impl CommandSender for MockSender {
        fn is_disconnected(&self) -> bool {
            self.disconnected.load(Ordering::SeqCst)
        }
        fn enqueue_command(&self, header: &[u8], payload: &[u8]) -> Result<(), IpcError> {
            if self.is_disconnected() {
                return Err(IpcError::Disconnected);
            }
            self.sent
                .lock()
                .unwrap()
                .push((header.to_vec(), payload.to_vec()));
            Ok(())
        }
        fn kick(&self) {}
    }

    fn request() -> ServiceInstance {
        ServiceInstance {
            service_id: 0x1234,
            instance_id: 0x0005,
            major_version: 0x01,
            minor_version: 0x0000_0000,
        }
    }

    #[tokio::test]
    async fn test_invoke_resolves_with_client_id() {
        let sender = MockSender::new();
        let controller = RequestServiceController::new(sender.clone());

        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        // wait for the request to hit the queue, then answer it
        while sender.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        controller.fulfil(return_code::OK, &0x00ABu16.to_le_bytes());

        assert_eq!(invoked.await.unwrap().unwrap(), 0x00AB);

        // the serialized request carries the expected header and body
        let (header, body) = sender.sent.lock().unwrap()[0].clone();
        let common = CommonHeader::decode(&header);
        assert_eq!(common.message_type, MessageType::RequestService.raw());
        assert_eq!(common.length, 4 + 9);
        assert_eq!(body, request().to_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_negative_response_maps_to_error() {
        let sender = MockSender::new();
        let controller = RequestServiceController::new(sender.clone());

        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        while sender.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        controller.fulfil(return_code::REQUEST_SERVICE_ACCESS_DENIED, &[]);
        assert!(matches!(
            invoked.await.unwrap(),
            Err(IpcError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_resets_slot() {
        let sender = MockSender::new();
        let controller = RequestServiceController::new(sender.clone());

        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        while sender.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        controller.fail_disconnected();
        assert!(matches!(
            invoked.await.unwrap(),
            Err(IpcError::Disconnected)
        ));

        // the slot is empty again: a second invocation is permitted
        assert!(!controller.state.lock().slot.is_awaiting());
        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        while sender.sent.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        controller.fulfil(return_code::OK, &7u16.to_le_bytes());
        assert_eq!(invoked.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unmapped_return_code_fails_with_not_connected() {
        let sender = MockSender::new();
        let controller = RequestServiceController::new(sender.clone());

        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        while sender.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        // an error-class code outside the mapped set, with the empty body
        // the protocol defines for it
        controller.fulfil(0x0000_0001, &[]);
        assert!(matches!(
            invoked.await.unwrap(),
            Err(IpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invoke_fails_fast_when_disconnected() {
        let sender = MockSender::new();
        sender.disconnected.store(true, Ordering::SeqCst);
        let controller = RequestServiceController::new(sender);
        assert!(matches!(
            controller.invoke(request()).await,
            Err(IpcError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_registry_routes_and_survives_unknown() {
        let sender = MockSender::new();
        let registry = ControllerRegistry::new();
        let controller = RequestServiceController::new(sender.clone());
        registry.register(MessageType::RequestService, controller.clone());

        // a response for a type nobody registered is dropped quietly
        registry.fulfil(MessageType::RequestLocalServer, return_code::OK, &[]);

        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        while sender.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        registry.fulfil(
            MessageType::RequestService,
            return_code::OK,
            &0x0042u16.to_le_bytes(),
        );
        assert_eq!(invoked.await.unwrap().unwrap(), 0x0042);
    }

    #[tokio::test]
    async fn test_fail_all_is_idempotent() {
        let sender = MockSender::new();
        let registry = ControllerRegistry::new();
        let controller = RequestServiceController::new(sender.clone());
        registry.register(MessageType::RequestService, controller.clone());

        let invoked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.invoke(request()).await })
        };
        while sender.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        registry.fail_all_disconnected();
        registry.fail_all_disconnected();
        assert!(matches!(
            invoked.await.unwrap(),
            Err(IpcError::Disconnected)
        ));
    }

    #[test]
    fn test_local_server_response_mapping() {
        let sender = MockSender::new();
        let controller = RequestLocalServerController::new(sender);
        // with no pending call the response is dropped without effect
        controller.fulfil(return_code::REMOTE_SERVER_NOT_FOUND, &[]);
    }
}
