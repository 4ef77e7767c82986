//! # Routing Sinks and Inbound Dispatch
//!
//! Routed payload traffic (SOME/IP frames, signal-based PDUs, field
//! notifications) is delivered to two application-registered back-
//! references: the *client manager* (proxy side) and the *server manager*
//! (skeleton side). Both may be absent during startup and are late-bound
//! through the façade's `bind_*_manager` operations; traffic arriving
//! before a manager is bound is dropped with a warning.
//!
//! SOME/IP frames are routed by the message-type byte of their SOME/IP
//! header: requests go to the server manager, responses and notifications
//! to the client manager. PDUs and field notifications go to the client
//! manager. Service-discovery style updates (subscription state, instance
//! up/down) are fanned out to every bound manager.

use crate::control::ControllerRegistry;
use crate::ipc::protocol::{someip_is_request, MessageClass, MessageType, SpecificHeader};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// Receiver of inbound routed messages.
///
/// Implementations take exclusive ownership of each delivered body buffer.
#[async_trait]
pub trait RoutingSink: Send + Sync {
    /// A SOME/IP frame (header plus payload), optionally with the receive
    /// timestamp the daemon recorded.
    async fn deliver_someip(&self, instance_id: u16, timestamp: Option<u64>, body: Vec<u8>);

    /// A signal-based PDU (header plus payload).
    async fn deliver_pdu(&self, instance_id: u16, timestamp: Option<u64>, body: Vec<u8>);

    /// The initial value of a subscribed field, addressed to one client.
    async fn deliver_initial_field(&self, instance_id: u16, client_id: u16, body: Vec<u8>);

    /// Routing metadata without a payload body: subscription state changes
    /// and service-instance availability updates.
    async fn deliver_non_someip(&self, message_type: MessageType, header: SpecificHeader);
}

/// The two late-bound manager back-references.
pub struct RoutingSinks {
    client_manager: RwLock<Option<Arc<dyn RoutingSink>>>,
    server_manager: RwLock<Option<Arc<dyn RoutingSink>>>,
}

impl RoutingSinks {
    pub fn new() -> Self {
        Self {
            client_manager: RwLock::new(None),
            server_manager: RwLock::new(None),
        }
    }

    pub fn bind_client_manager(&self, manager: Arc<dyn RoutingSink>) {
        *self.client_manager.write() = Some(manager);
    }

    pub fn bind_server_manager(&self, manager: Arc<dyn RoutingSink>) {
        *self.server_manager.write() = Some(manager);
    }

    pub fn client_manager(&self) -> Option<Arc<dyn RoutingSink>> {
        self.client_manager.read().clone()
    }

    pub fn server_manager(&self) -> Option<Arc<dyn RoutingSink>> {
        self.server_manager.read().clone()
    }
}

impl Default for RoutingSinks {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes completed inbound messages to the control correlator or the
/// routing sinks. Runs strictly sequentially on the receive pump, so
/// dispatch order equals wire order.
pub struct Dispatcher {
    registry: Arc<ControllerRegistry>,
    sinks: Arc<RoutingSinks>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ControllerRegistry>, sinks: Arc<RoutingSinks>) -> Self {
        Self { registry, sinks }
    }

    pub async fn dispatch(
        &self,
        class: MessageClass,
        specific: SpecificHeader,
        timestamp: Option<u64>,
        body: Vec<u8>,
    ) {
        match class {
            MessageClass::ControlResponse { request, .. } => {
                self.registry.fulfil(request, specific.return_code(), &body);
            }
            MessageClass::Routing(message_type) => {
                self.dispatch_routing(message_type, specific, timestamp, body)
                    .await;
            }
            MessageClass::ControlRequest(message_type) => {
                // the daemon never sends control requests toward an
                // application; the receiver drops them before dispatch
                warn!(?message_type, "control request ignored on the client side");
            }
        }
    }

    async fn dispatch_routing(
        &self,
        message_type: MessageType,
        specific: SpecificHeader,
        timestamp: Option<u64>,
        body: Vec<u8>,
    ) {
        let instance_id = specific.instance_id();
        match message_type {
            MessageType::RoutingSomeIp | MessageType::RoutingSomeIpWithMeta => {
                let sink = if someip_is_request(&body) {
                    self.sinks.server_manager()
                } else {
                    self.sinks.client_manager()
                };
                match sink {
                    Some(sink) => sink.deliver_someip(instance_id, timestamp, body).await,
                    None => warn!(instance_id, "SOME/IP frame dropped: no manager bound"),
                }
            }
            MessageType::RoutingPdu | MessageType::RoutingPduWithMeta => {
                match self.sinks.client_manager() {
                    Some(sink) => sink.deliver_pdu(instance_id, timestamp, body).await,
                    None => warn!(instance_id, "PDU dropped: no client manager bound"),
                }
            }
            MessageType::InitialFieldNotification => {
                let client_id = specific.client_id();
                match self.sinks.client_manager() {
                    Some(sink) => {
                        sink.deliver_initial_field(instance_id, client_id, body)
                            .await
                    }
                    None => warn!(
                        instance_id,
                        client_id, "initial field notification dropped: no client manager bound"
                    ),
                }
            }
            MessageType::SubscriptionState
            | MessageType::ServiceInstanceUp
            | MessageType::ServiceInstanceDown => {
                let mut delivered = false;
                if let Some(sink) = self.sinks.client_manager() {
                    sink.deliver_non_someip(message_type, specific).await;
                    delivered = true;
                }
                if let Some(sink) = self.sinks.server_manager() {
                    sink.deliver_non_someip(message_type, specific).await;
                    delivered = true;
                }
                if !delivered {
                    warn!(?message_type, "routing update dropped: no manager bound");
                }
            }
            _ => warn!(?message_type, "routing message with no dispatch rule"),
        }
    }
}
