//! The dispatch loop: one bus delivery in, exactly one settle out.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;

use courier_common::events::EventSink;
use courier_delivery::{SendError, Sender};
use courier_mail::{
    render_parts, EmailRequest, FromProfile, MailMessage, MessageSigner, SenderProfile,
};

use crate::bus::BusDelivery;
use crate::store::TemplateStore;

/// How much of an undecodable payload makes it into the log line.
const PAYLOAD_PREVIEW_BYTES: usize = 128;

/// Delivery backend the dispatcher hands built messages to.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn deliver(&self, message: &MailMessage) -> Result<(), SendError>;
}

#[async_trait]
impl MailTransport for Sender {
    async fn deliver(&self, message: &MailMessage) -> Result<(), SendError> {
        self.send(message).await
    }
}

/// Resolution of one delivery. Exactly one of these per delivery, exactly
/// one settle call behind each.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// Delivered; ack and report.
    Ack { note: String },
    /// Deterministic failure; drop without redelivery. `noisy` outcomes
    /// are pushed to the operator queue, quiet ones only logged locally.
    Drop { cause: String, noisy: bool },
    /// Transient failure; give the message back to the bus.
    Requeue { cause: String },
}

/// Consumes deliveries and coordinates resolve → render → send.
pub struct Dispatcher<T> {
    store: Arc<dyn TemplateStore>,
    transport: Arc<T>,
    events: Arc<EventSink>,
    profile: Arc<SenderProfile>,
    signer: Option<Arc<MessageSigner>>,
}

impl<T: MailTransport> Dispatcher<T> {
    pub fn new(
        store: Arc<dyn TemplateStore>,
        transport: Arc<T>,
        events: Arc<EventSink>,
        profile: Arc<SenderProfile>,
        signer: Option<Arc<MessageSigner>>,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            profile,
            signer,
        }
    }

    /// Consume deliveries until the stream ends or shutdown fires. Each
    /// delivery is handled in its own task; the bus prefetch bounds how
    /// many run at once.
    pub async fn run(
        self: Arc<Self>,
        mut consumer: lapin::Consumer,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown signal received, stopping consumer");
                    break;
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let dispatcher = Arc::clone(&self);
                        tokio::spawn(async move { dispatcher.handle(delivery).await });
                    }
                    Some(Err(err)) => {
                        // Outside any delivery; the local log line is enough
                        // if the publish fails too.
                        let _ = self
                            .events
                            .error(&format!("bus consumer failed: {err}"))
                            .await;
                        break;
                    }
                    None => {
                        tracing::info!("consumer stream ended");
                        break;
                    }
                },
            }
        }
    }

    /// Process one delivery and settle it exactly once. A panic anywhere in
    /// the pipeline is trapped, logged fatal, and turned into a requeue so
    /// a single bad message cannot take the worker down. Losing the outcome
    /// event is treated the same way: when the sink cannot publish it, the
    /// delivery is requeued instead of being resolved on a blind spot.
    pub async fn handle<D: BusDelivery>(self: &Arc<Self>, delivery: D) {
        let payload = delivery.payload().to_vec();
        let dispatcher = Arc::clone(self);
        let outcome = match tokio::spawn(async move { dispatcher.process(&payload).await }).await
        {
            Ok(outcome) => outcome,
            Err(join_error) => {
                // Already requeueing; the fatal line survives locally even
                // if its own publish fails.
                let _ = self
                    .events
                    .fatal(&format!("email processing panicked: {join_error}"))
                    .await;
                let _ = delivery.nack(true).await;
                return;
            }
        };

        let settled = match &outcome {
            Outcome::Ack { note } => match self.events.info(note).await {
                Ok(()) => delivery.ack().await,
                Err(err) => {
                    tracing::error!(
                        fatal = true,
                        "failed to publish outcome event, requeueing delivery: {err}"
                    );
                    delivery.nack(true).await
                }
            },
            Outcome::Drop { cause, noisy: true } => match self.events.error(cause).await {
                Ok(()) => delivery.nack(false).await,
                Err(err) => {
                    tracing::error!(
                        fatal = true,
                        "failed to publish outcome event, requeueing delivery: {err}"
                    );
                    delivery.nack(true).await
                }
            },
            Outcome::Drop {
                cause,
                noisy: false,
            } => {
                tracing::warn!("{cause}");
                delivery.nack(false).await
            }
            Outcome::Requeue { cause } => {
                if let Err(err) = self.events.error(cause).await {
                    tracing::error!(fatal = true, "failed to publish outcome event: {err}");
                }
                delivery.nack(true).await
            }
        };

        if let Err(err) = settled {
            let _ = self
                .events
                .fatal(&format!("failed to proceed queue delivery, {err}"))
                .await;
        }
    }

    /// The per-delivery pipeline: decode, resolve, validate, render, send.
    async fn process(&self, payload: &[u8]) -> Outcome {
        let mut request: EmailRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                return Outcome::Drop {
                    cause: format!(
                        "failed to decode message {} due {err}",
                        payload_preview(payload)
                    ),
                    noisy: false,
                };
            }
        };

        // The decoder already normalized the locale; every unknown value
        // reads back as "en".
        match self
            .store
            .resolve(&request.settings.name, request.settings.locale)
            .await
        {
            Ok(Some(template)) => template.merge_into(&mut request),
            Ok(None) => {}
            Err(err) => {
                return Outcome::Requeue {
                    cause: format!("template lookup failed: {err}"),
                };
            }
        }

        if !request.has_content() {
            return Outcome::Drop {
                cause: "email body doesn't have any part, file or subject".to_string(),
                noisy: false,
            };
        }

        if let FromProfile::Other(profile) = &request.settings.from {
            return Outcome::Drop {
                cause: format!("from ({profile}) is not valid"),
                noisy: false,
            };
        }

        if let Err(err) = render_parts(&mut request) {
            return Outcome::Drop {
                cause: format!("failed to render email: {err}"),
                noisy: true,
            };
        }

        let recipients = request.recipients(", ");
        let mut message = request.into_message(self.profile.message());
        if let Some(signer) = &self.signer {
            message.set_dkim(Arc::clone(signer));
        }

        match self.transport.deliver(&message).await {
            Ok(()) => Outcome::Ack {
                note: format!("email was sent to {recipients}"),
            },
            Err(SendError::Rejected(err)) => Outcome::Drop {
                cause: format!("email to {recipients} is undeliverable: {err}"),
                noisy: false,
            },
            Err(err) => Outcome::Requeue {
                cause: format!("failed to send email to {recipients} due {err}"),
            },
        }
    }
}

fn payload_preview(payload: &[u8]) -> String {
    let cut = payload.len().min(PAYLOAD_PREVIEW_BYTES);
    let mut preview = String::from_utf8_lossy(&payload[..cut]).into_owned();
    if cut < payload.len() {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use courier_common::events::{EventPublisher, PublishError};
    use courier_mail::{Locale, MailError, StoredTemplate};

    use crate::bus::BusError;
    use crate::store::StoreError;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Settle {
        Ack,
        NackDrop,
        NackRequeue,
    }

    #[derive(Default)]
    struct FakeDelivery {
        payload: Vec<u8>,
        settles: Arc<Mutex<Vec<Settle>>>,
    }

    impl FakeDelivery {
        fn new(payload: &str) -> (Self, Arc<Mutex<Vec<Settle>>>) {
            let settles = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    payload: payload.as_bytes().to_vec(),
                    settles: settles.clone(),
                },
                settles,
            )
        }
    }

    #[async_trait]
    impl BusDelivery for FakeDelivery {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        async fn ack(&self) -> Result<(), BusError> {
            self.settles.lock().unwrap().push(Settle::Ack);
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), BusError> {
            self.settles.lock().unwrap().push(if requeue {
                Settle::NackRequeue
            } else {
                Settle::NackDrop
            });
            Ok(())
        }
    }

    enum StoreBehavior {
        NotFound,
        Found(StoredTemplate),
        Fail,
    }

    struct FakeStore {
        behavior: StoreBehavior,
        lookups: Mutex<Vec<(String, Locale)>>,
    }

    impl FakeStore {
        fn new(behavior: StoreBehavior) -> Self {
            Self {
                behavior,
                lookups: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TemplateStore for FakeStore {
        async fn resolve(
            &self,
            name: &str,
            locale: Locale,
        ) -> Result<Option<StoredTemplate>, StoreError> {
            self.lookups
                .lock()
                .unwrap()
                .push((name.to_string(), locale));
            match &self.behavior {
                StoreBehavior::NotFound => Ok(None),
                StoreBehavior::Found(template) => Ok(Some(template.clone())),
                StoreBehavior::Fail => Err(StoreError("connection reset".to_string())),
            }
        }
    }

    #[derive(Default)]
    enum TransportBehavior {
        #[default]
        Succeed,
        Reject,
        FailTransiently,
        Panic,
    }

    struct SentMail {
        subject: String,
        recipients: Vec<String>,
        wire: Vec<u8>,
    }

    #[derive(Default)]
    struct FakeTransport {
        behavior: TransportBehavior,
        sent: Mutex<Vec<SentMail>>,
    }

    #[async_trait]
    impl MailTransport for FakeTransport {
        async fn deliver(&self, message: &MailMessage) -> Result<(), SendError> {
            if matches!(self.behavior, TransportBehavior::Panic) {
                panic!("boom");
            }
            if let Some(error) = message.error() {
                return Err(SendError::Rejected(MailError::Invalid(error.to_string())));
            }
            let wire = message
                .wire_message()
                .map_err(SendError::Rejected)?;
            self.sent.lock().unwrap().push(SentMail {
                subject: message.subject().to_string(),
                recipients: message.recipients(),
                wire,
            });
            match self.behavior {
                TransportBehavior::Succeed => Ok(()),
                TransportBehavior::Reject => Err(SendError::Rejected(MailError::NoRecipients)),
                TransportBehavior::FailTransiently => Err(SendError::Exhausted {
                    attempts: 10,
                    source: MailError::Client(courier_smtp::ClientError::ConnectionClosed),
                }),
                TransportBehavior::Panic => unreachable!(),
            }
        }
    }

    #[derive(Default)]
    struct CapturedEvents(Mutex<Vec<serde_json::Value>>);

    #[async_trait]
    impl EventPublisher for CapturedEvents {
        async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError> {
            self.0
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&payload).unwrap());
            Ok(())
        }
    }

    struct DeadSink;

    #[async_trait]
    impl EventPublisher for DeadSink {
        async fn publish(&self, _payload: Vec<u8>) -> Result<(), PublishError> {
            Err(PublishError("log queue unreachable".to_string()))
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher<FakeTransport>>,
        store: Arc<FakeStore>,
        transport: Arc<FakeTransport>,
        events: Arc<CapturedEvents>,
    }

    fn harness(store_behavior: StoreBehavior, transport_behavior: TransportBehavior) -> Harness {
        let store = Arc::new(FakeStore::new(store_behavior));
        let transport = Arc::new(FakeTransport {
            behavior: transport_behavior,
            sent: Mutex::new(Vec::new()),
        });
        let events = Arc::new(CapturedEvents::default());
        let sink = Arc::new(EventSink::new(events.clone(), "courier-test"));
        let profile = Arc::new(SenderProfile::new(
            "Courier",
            "noreply@example.com",
            "errors@example.com",
            "bounce@example.com",
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            transport.clone(),
            sink,
            profile,
            None,
        ));
        Harness {
            dispatcher,
            store,
            transport,
            events,
        }
    }

    fn dead_sink_harness(
        transport_behavior: TransportBehavior,
    ) -> (Arc<Dispatcher<FakeTransport>>, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport {
            behavior: transport_behavior,
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(FakeStore::new(StoreBehavior::NotFound)),
            transport.clone(),
            Arc::new(EventSink::new(Arc::new(DeadSink), "courier-test")),
            Arc::new(SenderProfile::new(
                "Courier",
                "noreply@example.com",
                "errors@example.com",
                "bounce@example.com",
            )),
            None,
        ));
        (dispatcher, transport)
    }

    fn event_levels(events: &CapturedEvents) -> Vec<String> {
        events
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|event| event["message_type"].as_str().unwrap().to_string())
            .collect()
    }

    const VALID: &str = r#"{
        "To": ["a@x.com"],
        "Subject": "hi",
        "Parts": [{"ContentType": "text/plain", "Body": "hello {{.name}}"}],
        "PartValues": {"name": "Bob"}
    }"#;

    #[tokio::test]
    async fn valid_request_is_sent_and_acked() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(VALID);

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::Ack]);
        let sent = h.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "hi");
        assert_eq!(sent[0].recipients, vec!["a@x.com"]);
        assert_eq!(event_levels(&h.events), vec!["info"]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped_without_requeue() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new("{not json");

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
        assert!(h.transport.sent.lock().unwrap().is_empty());
        assert!(h.store.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_subject_is_dropped_before_any_send() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"","Parts":[{"ContentType":"text/plain","Body":"x"}]}"#,
        );

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_locale_looks_up_english() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"hi",
                "Parts":[{"ContentType":"text/plain","Body":"hello {{.name}}"}],
                "PartValues":{"name":"Bob"},
                "Settings":{"Locale":"fr"}}"#,
        );

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::Ack]);
        assert_eq!(
            *h.store.lookups.lock().unwrap(),
            vec![(String::new(), Locale::En)]
        );
    }

    #[tokio::test]
    async fn unknown_from_profile_is_dropped() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"hi",
                "Parts":[{"ContentType":"text/plain","Body":"x"}],
                "Settings":{"From":"mailing"}}"#,
        );

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_requeues_without_touching_smtp() {
        let h = harness(StoreBehavior::Fail, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(VALID);

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackRequeue]);
        assert!(h.transport.sent.lock().unwrap().is_empty());
        assert_eq!(event_levels(&h.events), vec!["error"]);
    }

    #[tokio::test]
    async fn stored_template_fills_absent_subject_and_parts() {
        let template = StoredTemplate {
            name: "hello".to_string(),
            locale: Locale::En,
            subject: "Welcome!".to_string(),
            parts: vec![courier_mail::BodyPart {
                content_type: courier_mail::ContentType::TextPlain,
                body: "hello {{name}}".to_string(),
            }],
            files: vec![],
        };
        let h = harness(StoreBehavior::Found(template), TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"PartValues":{"name":"Bob"},"Settings":{"Name":"hello"}}"#,
        );

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::Ack]);
        let sent = h.transport.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Welcome!");
    }

    #[tokio::test]
    async fn render_failure_is_a_noisy_drop() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"hi",
                "Parts":[{"ContentType":"text/plain","Body":"hello {{.name"}]}"#,
        );

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
        assert!(h.transport.sent.lock().unwrap().is_empty());
        assert_eq!(event_levels(&h.events), vec!["error"]);
    }

    #[tokio::test]
    async fn unknown_content_type_is_dropped_at_render() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"hi",
                "Parts":[{"ContentType":"application/json","Body":"{}"}]}"#,
        );

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_send_failure_requeues() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::FailTransiently);
        let (delivery, settles) = FakeDelivery::new(VALID);

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackRequeue]);
        assert_eq!(event_levels(&h.events), vec!["error"]);
    }

    #[tokio::test]
    async fn rejected_message_is_dropped_quietly() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Reject);
        let (delivery, settles) = FakeDelivery::new(VALID);

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
        assert!(event_levels(&h.events).is_empty());
    }

    #[tokio::test]
    async fn sink_publish_failure_on_the_success_path_requeues() {
        let (dispatcher, transport) = dead_sink_harness(TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(VALID);

        dispatcher.handle(delivery).await;

        // The message went out, but without its outcome event the delivery
        // must go back to the bus rather than resolve on a blind spot.
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackRequeue]);
    }

    #[tokio::test]
    async fn sink_publish_failure_on_a_noisy_drop_requeues() {
        let (dispatcher, transport) = dead_sink_harness(TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"hi",
                "Parts":[{"ContentType":"text/plain","Body":"hello {{.name"}]}"#,
        );

        dispatcher.handle(delivery).await;

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackRequeue]);
    }

    #[tokio::test]
    async fn quiet_drops_do_not_depend_on_the_sink() {
        let (dispatcher, transport) = dead_sink_harness(TransportBehavior::Succeed);
        let (delivery, settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"","Parts":[{"ContentType":"text/plain","Body":"x"}]}"#,
        );

        dispatcher.handle(delivery).await;

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackDrop]);
    }

    #[tokio::test]
    async fn panic_in_the_pipeline_is_trapped_as_fatal_requeue() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Panic);
        let (delivery, settles) = FakeDelivery::new(VALID);

        h.dispatcher.handle(delivery).await;

        assert_eq!(*settles.lock().unwrap(), vec![Settle::NackRequeue]);
        assert_eq!(event_levels(&h.events), vec!["fatal"]);
    }

    #[tokio::test]
    async fn every_delivery_settles_exactly_once() {
        for payload in [
            VALID,
            "{garbage",
            r#"{"To":["a@x.com"],"Subject":""}"#,
            r#"{"To":["bad address <"],"Subject":"s","Parts":[{"ContentType":"text/plain","Body":"x"}]}"#,
        ] {
            let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
            let (delivery, settles) = FakeDelivery::new(payload);
            h.dispatcher.handle(delivery).await;
            assert_eq!(settles.lock().unwrap().len(), 1, "payload: {payload}");
        }
    }

    #[tokio::test]
    async fn html_values_are_escaped_end_to_end() {
        let h = harness(StoreBehavior::NotFound, TransportBehavior::Succeed);
        let (delivery, _settles) = FakeDelivery::new(
            r#"{"To":["a@x.com"],"Subject":"s",
                "Parts":[{"ContentType":"text/html","Body":"<p>{{.x}}</p>"}],
                "PartValues":{"x":"<script>"}}"#,
        );

        h.dispatcher.handle(delivery).await;

        let sent = h.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let wire = String::from_utf8_lossy(&sent[0].wire);
        assert!(wire.contains("&lt;script&gt;"), "wire: {wire}");
        assert!(!wire.contains("<script>"));
    }
}
