//! Payment operations used by the API layer and the settlement worker.
//!
//! Lifecycle events come from the commit hooks on the stores. This service
//! adds the order-coordination events the order service listens to.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use domain_events::persistence::MemoryTable;
use domain_events::{OrderFlowPublisher, Payment, PaymentMethod, PaymentStatus, PaymentTransaction};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

/// Payment storage the service writes through.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Payment>>;
    async fn create(&self, payment: &Payment) -> ServiceResult<Payment>;
    async fn update_status(&self, id: Uuid, status: PaymentStatus) -> ServiceResult<Payment>;
    async fn delete(&self, id: Uuid) -> ServiceResult<Payment>;
}

#[async_trait]
impl PaymentStore for MemoryTable<Payment> {
    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Payment>> {
        Ok(self.get(id))
    }

    async fn create(&self, payment: &Payment) -> ServiceResult<Payment> {
        Ok(self.insert(payment.clone()).await?)
    }

    async fn update_status(&self, id: Uuid, status: PaymentStatus) -> ServiceResult<Payment> {
        let updated = self
            .modify(id, |payment| {
                payment.status = status;
                payment.updated_at = Utc::now();
            })
            .await?;
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> ServiceResult<Payment> {
        Ok(MemoryTable::delete(self, id).await?)
    }
}

/// Gateway interaction storage.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn create(&self, transaction: &PaymentTransaction) -> ServiceResult<PaymentTransaction>;
    async fn update_status(
        &self,
        id: Uuid,
        status: &str,
        response_payload: Option<Value>,
    ) -> ServiceResult<PaymentTransaction>;
}

#[async_trait]
impl TransactionStore for MemoryTable<PaymentTransaction> {
    async fn create(&self, transaction: &PaymentTransaction) -> ServiceResult<PaymentTransaction> {
        Ok(self.insert(transaction.clone()).await?)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: &str,
        response_payload: Option<Value>,
    ) -> ServiceResult<PaymentTransaction> {
        let status = status.to_string();
        let updated = self
            .modify(id, move |transaction| {
                transaction.status = status;
                if let Some(payload) = response_payload {
                    transaction.response_payload = Some(payload);
                }
                transaction.timestamp = Utc::now();
            })
            .await?;
        Ok(updated)
    }
}

/// Order-flow event owed for a payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFlow {
    Confirmed,
    Failed,
    Update,
}

impl OrderFlow {
    pub fn for_status(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Completed => OrderFlow::Confirmed,
            PaymentStatus::Failed => OrderFlow::Failed,
            _ => OrderFlow::Update,
        }
    }
}

const DEFAULT_FAILURE_REASON: &str = "payment failed";

#[derive(Clone)]
pub struct PaymentService {
    payments: Arc<dyn PaymentStore>,
    transactions: Arc<dyn TransactionStore>,
    order_flow: OrderFlowPublisher,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        transactions: Arc<dyn TransactionStore>,
        order_flow: OrderFlowPublisher,
    ) -> Self {
        Self {
            payments,
            transactions,
            order_flow,
        }
    }

    pub async fn create_payment(
        &self,
        order_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
    ) -> ServiceResult<Payment> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidInput(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }
        let payment = self
            .payments
            .create(&Payment::new(order_id, amount, method))
            .await?;
        info!(payment_id = %payment.id, order_id = %order_id, "Payment created");
        Ok(payment)
    }

    /// Move a payment to `status` and tell the order service.
    pub async fn set_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        reason: Option<&str>,
    ) -> ServiceResult<Payment> {
        let payment = self.payments.update_status(payment_id, status).await?;

        let published = match OrderFlow::for_status(status) {
            OrderFlow::Confirmed => self.order_flow.publish_confirmed(&payment).await,
            OrderFlow::Failed => {
                self.order_flow
                    .publish_failed(&payment, reason.unwrap_or(DEFAULT_FAILURE_REASON))
                    .await
            }
            OrderFlow::Update => self.order_flow.publish_order_update(&payment).await,
        };
        // The status change is committed; a publish error must not undo it.
        if let Err(e) = published {
            warn!(payment_id = %payment_id, error = %e, "Failed to publish order-flow event");
        }
        Ok(payment)
    }

    /// Move a payment to `status` unless it is already there. Redelivered
    /// gateway outcomes are no-ops.
    pub async fn settle(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        reason: Option<&str>,
    ) -> ServiceResult<Option<Payment>> {
        let current = self
            .payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {}", payment_id)))?;
        if current.status == status {
            debug!(payment_id = %payment_id, status = %status, "Payment already settled");
            return Ok(None);
        }
        self.set_status(payment_id, status, reason).await.map(Some)
    }

    /// Record one gateway interaction for a payment.
    pub async fn record_transaction(
        &self,
        payment_id: Uuid,
        gateway_name: &str,
        status: &str,
        external_transaction_id: Option<String>,
        response_payload: Option<Value>,
    ) -> ServiceResult<PaymentTransaction> {
        if self.payments.find_by_id(payment_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("payment {}", payment_id)));
        }
        let mut transaction = PaymentTransaction::new(payment_id, gateway_name, status);
        transaction.external_transaction_id = external_transaction_id;
        transaction.response_payload = response_payload;
        self.transactions.create(&transaction).await
    }

    pub async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        status: &str,
        response_payload: Option<Value>,
    ) -> ServiceResult<PaymentTransaction> {
        self.transactions
            .update_status(transaction_id, status, response_payload)
            .await
    }

    pub async fn delete_payment(&self, payment_id: Uuid) -> ServiceResult<Payment> {
        self.payments.delete(payment_id).await
    }
}
