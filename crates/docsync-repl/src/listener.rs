//! The receiving side: one state machine run per inbound message.

use docsync_transport::{
    Connection, Message, MessageBody, MessageListener, SubscribeOptions, Subscription, Transport,
};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

use crate::apply::{ApplyOutcome, Applier};
use crate::config::TransportConfig;
use crate::dispatch::DispatchTable;
use crate::envelope::{keys, Envelope};
use crate::error::{ReplError, Result};
use crate::identity::Identity;
use crate::report::Report;

/// How one inbound message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The message came from this instance and was skipped.
    Filtered,
    /// The envelope was dispatched and applied.
    Applied(ApplyOutcome),
}

/// Decodes inbound messages and applies them to the local store.
#[derive(Debug)]
pub struct ReplicationListener {
    applier: Applier,
    table: DispatchTable,
    identity: Identity,
    report: Arc<Report>,
}

impl ReplicationListener {
    /// A listener using the standard dispatch table and a fresh report.
    pub fn new(applier: Applier, identity: Identity) -> Self {
        Self {
            applier,
            table: DispatchTable::standard(),
            identity,
            report: Arc::new(Report::new()),
        }
    }

    /// Replace the dispatch table.
    pub fn with_table(mut self, table: DispatchTable) -> Self {
        self.table = table;
        self
    }

    /// Share an existing report.
    pub fn with_report(mut self, report: Arc<Report>) -> Self {
        self.report = report;
        self
    }

    /// This receiver's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Receiver statistics.
    pub fn report(&self) -> &Arc<Report> {
        &self.report
    }

    /// Run the receive state machine for one message.
    ///
    /// Counters and timing are updated on every exit path.
    pub fn handle(&self, message: &Message) -> Result<Disposition> {
        let span = info_span!("replicate", message_id = message.id.as_deref().unwrap_or("-"));
        let _enter = span.enter();

        let timer = self.report.start();
        let result = self.process(message);
        match &result {
            Ok(Disposition::Filtered) => self.report.inc_filtered(),
            Ok(Disposition::Applied(outcome)) => {
                self.report.inc_success();
                if matches!(outcome, ApplyOutcome::Converged(_)) {
                    self.report.inc_converged();
                }
            }
            Err(e) => {
                error!(error = %e, "replication message failed");
                self.report.add_error(e.to_string());
            }
        }
        self.report.stop(timer);
        self.report.inc_total();
        result
    }

    fn process(&self, message: &Message) -> Result<Disposition> {
        let origin = message.properties.get_str(keys::INSTANCE_ID);
        if self.identity.is_self(origin) {
            info!(identity = %self.identity, "message originated here, skipping");
            return Ok(Disposition::Filtered);
        }
        if origin.is_none() {
            warn!("message carries no instance id");
        }

        if !matches!(message.body, MessageBody::Bytes(_)) {
            return Err(ReplError::UnsupportedMessage {
                kind: message.body.kind().to_string(),
            });
        }
        let envelope = Envelope::from_message(message)?;
        let handler = self
            .table
            .lookup(envelope.resource_type, envelope.operation)?;
        let outcome = self.applier.apply(handler, &envelope)?;
        info!(handler = %handler, envelope = %envelope.summary(), ?outcome, "replicated");
        Ok(Disposition::Applied(outcome))
    }

    /// Connect with `config` and subscribe to its destination.
    pub async fn listen(
        self: Arc<Self>,
        transport: &dyn Transport,
        config: &TransportConfig,
        options: SubscribeOptions,
    ) -> Result<Receiver> {
        config.validate()?;
        let connection = transport.connect(&config.to_endpoint()).await?;
        let subscription = match connection
            .subscribe(&config.destination, self.clone(), options)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "closing connection after failed subscribe");
                }
                return Err(e.into());
            }
        };
        info!(
            identity = %self.identity,
            destination = %config.destination,
            subscriber = subscription.name(),
            "receiver subscribed"
        );
        Ok(Receiver {
            listener: self,
            connection,
            subscription,
        })
    }
}

impl MessageListener for ReplicationListener {
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self.handle(message)?;
        Ok(())
    }
}

/// A subscribed [`ReplicationListener`] and the connection it holds.
pub struct Receiver {
    listener: Arc<ReplicationListener>,
    connection: Box<dyn Connection>,
    subscription: Subscription,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("connection", &self.connection.id())
            .field("subscription", &self.subscription.name())
            .finish()
    }
}

impl Receiver {
    /// The listener handling deliveries.
    pub fn listener(&self) -> &Arc<ReplicationListener> {
        &self.listener
    }

    /// Receiver statistics.
    pub fn report(&self) -> &Arc<Report> {
        self.listener.report()
    }

    /// Stop delivery and close the connection.
    pub async fn close(self) -> Result<()> {
        self.subscription.close().await;
        self.connection.close().await?;
        info!(summary = %self.listener.report().snapshot().summary(), "receiver closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Operation, ResourceType};
    use docsync_store::{DocPath, MemorySecurity, MemoryStore, MimeTable, Store};
    use docsync_transport::{MessageBody, ObjectValue};

    fn p(s: &str) -> DocPath {
        DocPath::parse(s).unwrap()
    }

    fn node(identity: &str) -> (Arc<MemoryStore>, ReplicationListener) {
        let store = Arc::new(MemoryStore::new());
        let applier = Applier::new(store.clone(), Arc::new(MemorySecurity::new()), MimeTable::default());
        (store, ReplicationListener::new(applier, Identity::new(identity)))
    }

    fn mkcol_from(origin: &str, path: &str) -> Message {
        let mut message = Envelope::new(ResourceType::Collection, Operation::Create, p(path)).to_message();
        message.properties.set(keys::INSTANCE_ID, origin);
        message
    }

    #[test]
    fn test_self_echo_is_filtered() {
        let (store, listener) = node("node-a");
        let disposition = listener.handle(&mkcol_from("node-a", "/db/echo")).unwrap();
        assert_eq!(disposition, Disposition::Filtered);
        assert!(store.collection(&p("/db/echo")).is_none());

        let snap = listener.report().snapshot();
        assert_eq!((snap.total, snap.success, snap.filtered), (1, 0, 1));
    }

    #[test]
    fn test_remote_message_is_applied() {
        let (store, listener) = node("node-a");
        let disposition = listener.handle(&mkcol_from("node-b", "/db/remote")).unwrap();
        assert_eq!(disposition, Disposition::Applied(ApplyOutcome::Applied));
        assert!(store.collection(&p("/db/remote")).is_some());
    }

    #[test]
    fn test_empty_identity_never_filters() {
        let (store, listener) = node("");
        listener.handle(&mkcol_from("", "/db/x")).unwrap();
        assert!(store.collection(&p("/db/x")).is_some());
    }

    #[test]
    fn test_converged_counts_as_success() {
        let (_store, listener) = node("node-a");
        listener.handle(&mkcol_from("node-b", "/db/c")).unwrap();
        let disposition = listener.handle(&mkcol_from("node-b", "/db/c")).unwrap();
        assert!(matches!(disposition, Disposition::Applied(ApplyOutcome::Converged(_))));
        let snap = listener.report().snapshot();
        assert_eq!((snap.total, snap.success, snap.converged), (2, 2, 1));
    }

    #[test]
    fn test_text_message_is_unsupported() {
        let (_store, listener) = node("node-a");
        let err = listener.handle(&Message::text("hello")).unwrap_err();
        assert!(matches!(err, ReplError::UnsupportedMessage { .. }));
        let object = Message::object(ObjectValue::Integer(1));
        assert!(listener.handle(&object).is_err());
        let snap = listener.report().snapshot();
        assert_eq!((snap.total, snap.success, snap.failed), (2, 0, 2));
        assert_eq!(snap.recent_errors.len(), 2);
    }

    #[test]
    fn test_missing_keys_fail_decode() {
        let (_store, listener) = node("node-a");
        let message = Message::bytes(bytes::Bytes::from_static(b"x"));
        assert!(matches!(listener.handle(&message), Err(ReplError::EnvelopeDecode { .. })));
    }

    #[test]
    fn test_unregistered_pair_is_fatal() {
        let (_store, listener) = node("node-a");
        let listener = listener.with_table(DispatchTable::empty());
        let err = listener.handle(&mkcol_from("node-b", "/db/x")).unwrap_err();
        assert!(matches!(err, ReplError::UnknownResourceType { .. }));

        let (_store, listener) = node("node-a");
        let mut message = Envelope::new(ResourceType::Collection, Operation::Metadata, p("/db/x")).to_message();
        message.properties.set(keys::INSTANCE_ID, "node-b");
        assert!(matches!(listener.handle(&message), Err(ReplError::UnknownOperation { .. })));
    }

    #[test]
    fn test_on_message_surfaces_error() {
        let (_store, listener) = node("node-a");
        let message = Message {
            body: MessageBody::Text("nope".to_string()),
            ..Message::empty()
        };
        let err = listener.on_message(&message).unwrap_err();
        assert!(err.downcast_ref::<ReplError>().is_some());
    }
}
