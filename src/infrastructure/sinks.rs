use crate::domain::ports::{CustomerNotice, NotificationSink, OrderPaymentUpdate, OrderStatusSink};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Logs order updates and customer notices without forwarding them.
///
/// Used when no callback endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl OrderStatusSink for TracingSink {
    async fn payment_status_changed(&self, update: OrderPaymentUpdate) -> Result<()> {
        tracing::info!(
            order_id = %update.order_id,
            transaction_id = %update.transaction_id,
            gateway = %update.gateway,
            status = %update.status,
            refunded_amount = %update.refunded_amount,
            "order payment status changed"
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TracingSink {
    async fn enqueue(&self, notice: CustomerNotice) -> Result<()> {
        tracing::info!(
            kind = ?notice.kind,
            order_id = %notice.order_id,
            transaction_id = %notice.transaction_id,
            "customer notice queued"
        );
        Ok(())
    }
}

/// POSTs order updates and customer notices as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpCallbackSink {
    client: reqwest::Client,
    url: String,
}

impl HttpCallbackSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Configuration(format!("callback client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, body: &T) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::Storage(format!("callback to {} failed: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::Storage(format!(
                "callback to {} answered {status}",
                self.url
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStatusSink for HttpCallbackSink {
    async fn payment_status_changed(&self, update: OrderPaymentUpdate) -> Result<()> {
        self.post(&update).await
    }
}

#[async_trait]
impl NotificationSink for HttpCallbackSink {
    async fn enqueue(&self, notice: CustomerNotice) -> Result<()> {
        self.post(&notice).await
    }
}
