#![allow(dead_code)]

use async_trait::async_trait;
use cafe_payments::application::dispatcher::WebhookDispatcher;
use cafe_payments::application::orchestrator::{OrderPayment, PaymentOrchestrator};
use cafe_payments::application::registry::GatewayRegistry;
use cafe_payments::domain::gateway::{
    CancelReceipt, CreatePayment, GatewayKind, GatewayStatus, ParsedWebhook, PaymentCreated,
    PaymentGateway, PaymentVerification, ProviderRefundStatus, RefundReceipt, RefundRequest,
};
use cafe_payments::domain::money::Currency;
use cafe_payments::domain::ports::{
    CustomerNotice, NotificationSink, OrderPaymentUpdate, OrderStatusSink,
};
use cafe_payments::error::{PaymentError, Result};
use cafe_payments::infrastructure::in_memory::{
    InMemoryTransactionStore, InMemoryWebhookEventStore,
};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FAKE_SECRET: &str = "whsec_fake";
pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";

/// Hex HMAC-SHA256 of `payload` under [`FAKE_SECRET`].
pub fn sign(payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(FAKE_SECRET.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Webhook body understood by [`FakeGateway::parse_webhook`].
pub fn webhook_body(event_type: &str, transaction_id: &str, extra: serde_json::Value) -> Vec<u8> {
    let mut body = serde_json::json!({
        "event_type": event_type,
        "transaction_id": transaction_id,
    });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            body.insert(k.clone(), v.clone());
        }
    }
    serde_json::to_vec(&body).unwrap()
}

#[derive(Deserialize)]
struct FakeEvent {
    event_type: String,
    transaction_id: String,
    amount: Option<Decimal>,
    currency: Option<String>,
    refunded_total: Option<Decimal>,
}

#[derive(Default)]
struct Script {
    create_errors: VecDeque<PaymentError>,
    verifications: VecDeque<Result<PaymentVerification>>,
    refund_errors: VecDeque<PaymentError>,
    refund_status: Option<ProviderRefundStatus>,
    settle_on_create: Option<GatewayStatus>,
    redirect: bool,
    cancel_status: Option<GatewayStatus>,
}

/// Scripted in-process gateway. Posing as GCash by default: PHP and USD,
/// minimum 20, redirect checkout.
pub struct FakeGateway {
    kind: GatewayKind,
    script: Mutex<Script>,
    created: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub refund_requests: Mutex<Vec<RefundRequest>>,
    pub create_requests: Mutex<Vec<CreatePayment>>,
}

impl FakeGateway {
    pub fn new(kind: GatewayKind) -> Self {
        Self {
            kind,
            script: Mutex::new(Script {
                redirect: true,
                ..Script::default()
            }),
            created: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            refund_requests: Mutex::new(Vec::new()),
            create_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn gcash() -> Self {
        Self::new(GatewayKind::GCash)
    }

    /// Client-secret checkout instead of a redirect, like Stripe.
    pub fn without_redirect(self) -> Self {
        self.script.lock().unwrap().redirect = false;
        self
    }

    pub fn fail_next_create(&self, error: PaymentError) {
        self.script.lock().unwrap().create_errors.push_back(error);
    }

    pub fn settle_on_create(&self, status: GatewayStatus) {
        self.script.lock().unwrap().settle_on_create = Some(status);
    }

    pub fn push_verification(&self, result: Result<PaymentVerification>) {
        self.script.lock().unwrap().verifications.push_back(result);
    }

    pub fn fail_next_refund(&self, error: PaymentError) {
        self.script.lock().unwrap().refund_errors.push_back(error);
    }

    pub fn refund_status(&self, status: ProviderRefundStatus) {
        self.script.lock().unwrap().refund_status = Some(status);
    }

    pub fn cancel_status(&self, status: GatewayStatus) {
        self.script.lock().unwrap().cancel_status = Some(status);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn verification(reference: &str, status: GatewayStatus, amount: Decimal) -> PaymentVerification {
    PaymentVerification {
        gateway_transaction_id: reference.to_string(),
        status,
        amount,
        currency: Currency::PHP,
        paid_at: None,
        refunded_total: None,
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn kind(&self) -> GatewayKind {
        self.kind
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        &[Currency::PHP, Currency::USD]
    }

    fn minimum_amount(&self, currency: Currency) -> Option<Decimal> {
        match currency {
            Currency::PHP => Some(dec!(20)),
            Currency::USD => Some(dec!(0.50)),
            _ => None,
        }
    }

    fn signature_header(&self) -> &'static str {
        FAKE_SIGNATURE_HEADER
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<PaymentCreated> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.create_requests.lock().unwrap().push(request.clone());
        let (error, settled, redirect) = {
            let mut script = self.script.lock().unwrap();
            (
                script.create_errors.pop_front(),
                script.settle_on_create,
                script.redirect,
            )
        };
        if let Some(error) = error {
            return Err(error);
        }
        // Slow enough for concurrent callers to overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake_{n}");
        Ok(PaymentCreated {
            payment_url: redirect.then(|| format!("https://pay.example.test/{id}")),
            client_secret: (!redirect).then(|| format!("{id}_secret")),
            gateway_transaction_id: id,
            status: settled.unwrap_or(GatewayStatus::Pending),
            message: "Payment created".to_string(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentVerification> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().verifications.pop_front();
        next.unwrap_or_else(|| {
            Ok(verification(
                gateway_transaction_id,
                GatewayStatus::Pending,
                dec!(0),
            ))
        })
    }

    async fn refund_payment(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        let n = self.refund_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.refund_requests.lock().unwrap().push(request.clone());
        let (error, status) = {
            let mut script = self.script.lock().unwrap();
            (script.refund_errors.pop_front(), script.refund_status)
        };
        if let Some(error) = error {
            return Err(error);
        }
        Ok(RefundReceipt {
            refund_id: format!("rf_{n}"),
            status: status.unwrap_or(ProviderRefundStatus::Completed),
            amount: request.amount.map(Decimal::from).unwrap_or_default(),
            message: "Refund accepted".to_string(),
        })
    }

    async fn cancel_payment(&self, _gateway_transaction_id: &str) -> Result<CancelReceipt> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .script
            .lock()
            .unwrap()
            .cancel_status
            .unwrap_or(GatewayStatus::Cancelled);
        Ok(CancelReceipt {
            status,
            message: format!("payment is {status:?}"),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> bool {
        sign(payload) == signature_header
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: FakeEvent = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::MalformedWebhook(e.to_string()))?;
        let status = match event.event_type.as_str() {
            "payment.completed" => Some(GatewayStatus::Succeeded),
            "payment.failed" => Some(GatewayStatus::Failed),
            "payment.cancelled" => Some(GatewayStatus::Cancelled),
            "payment.refunded" => Some(GatewayStatus::Refunded),
            "payment.pending" => Some(GatewayStatus::Pending),
            _ => None,
        };
        Ok(ParsedWebhook {
            event_type: event.event_type,
            transaction_id: event.transaction_id,
            status,
            amount: event.amount,
            currency: event.currency.map(|c| c.parse()).transpose()?,
            refunded_total: event.refunded_total,
            metadata: BTreeMap::new(),
        })
    }
}

/// Records every collaborator call.
#[derive(Default)]
pub struct RecordingSink {
    pub updates: Mutex<Vec<OrderPaymentUpdate>>,
    pub notices: Mutex<Vec<CustomerNotice>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<OrderPaymentUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<CustomerNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderStatusSink for RecordingSink {
    async fn payment_status_changed(&self, update: OrderPaymentUpdate) -> Result<()> {
        self.updates.lock().unwrap().push(update);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaymentError::Storage("order service down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn enqueue(&self, notice: CustomerNotice) -> Result<()> {
        self.notices.lock().unwrap().push(notice);
        Ok(())
    }
}

/// Everything a test needs, wired around one fake gateway.
pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub transactions: InMemoryTransactionStore,
    pub events: InMemoryWebhookEventStore,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub dispatcher: Arc<WebhookDispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(FakeGateway::gcash())
    }

    pub fn with_gateway(gateway: FakeGateway) -> Self {
        let gateway = Arc::new(gateway);
        let transactions = InMemoryTransactionStore::new();
        let events = InMemoryWebhookEventStore::new();
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Arc::new(
            PaymentOrchestrator::new(
                GatewayRegistry::new().with(gateway.clone()),
                Arc::new(transactions.clone()),
                sink.clone(),
                sink.clone(),
            )
            .with_verify_retries(2, Duration::from_millis(1)),
        );
        let dispatcher = Arc::new(WebhookDispatcher::new(
            orchestrator.clone(),
            Arc::new(events.clone()),
        ));
        Self {
            gateway,
            transactions,
            events,
            sink,
            orchestrator,
            dispatcher,
        }
    }

    pub fn kind(&self) -> GatewayKind {
        self.gateway.kind()
    }

    /// Delivers a correctly signed webhook.
    pub async fn deliver(
        &self,
        body: &[u8],
    ) -> cafe_payments::application::dispatcher::WebhookOutcome {
        self.dispatcher
            .dispatch(self.kind().as_str(), Some(&sign(body)), body)
            .await
    }
}

pub fn order(order_id: &str, amount: Decimal) -> OrderPayment {
    OrderPayment {
        order_id: order_id.to_string(),
        amount,
        currency: Currency::PHP,
        customer_email: "ana@example.com".to_string(),
        description: format!("Cafe order #{order_id}"),
        metadata: BTreeMap::new(),
        idempotency_key: None,
    }
}
