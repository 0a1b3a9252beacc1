//! Retry with exponential backoff around any broker
//!
//! Only transient failures are retried. Authentication, validation and
//! rejection errors surface on the first attempt.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::traits::{Broker, BrokerKind, BrokerResult};
use crate::config::ExecutionConfig;
use crate::domain::{BrokerPosition, OrderFill, OrderRequest, Quote};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.base_delay_ms))
    }

    /// Delay before attempt `attempt + 1`: base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempts >= self.max_attempts {
                        error!("{} failed after {} attempts: {}", label, attempts, e);
                        return Err(e);
                    }

                    let delay = self.delay_for(attempts);
                    warn!(
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        label, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Broker decorator applying a `RetryPolicy` to every call
pub struct RetryingBroker {
    inner: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl RetryingBroker {
    pub fn new(inner: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Broker for RetryingBroker {
    fn kind(&self) -> BrokerKind {
        self.inner.kind()
    }

    async fn account_equity(&self) -> BrokerResult<Decimal> {
        self.policy
            .run("account_equity", || self.inner.account_equity())
            .await
    }

    async fn current_price(&self, instrument: &str) -> BrokerResult<Quote> {
        self.policy
            .run("current_price", || self.inner.current_price(instrument))
            .await
    }

    // Resubmitting is safe: brokers de-duplicate on client_reference
    async fn submit_order(&self, order: &OrderRequest) -> BrokerResult<OrderFill> {
        self.policy
            .run("submit_order", || self.inner.submit_order(order))
            .await
    }

    async fn open_positions(&self, instrument: &str) -> BrokerResult<Vec<BrokerPosition>> {
        self.policy
            .run("open_positions", || self.inner.open_positions(instrument))
            .await
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<OrderFill> {
        self.policy
            .run("close_position", || self.inner.close_position(position_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::traits::MockBroker;
    use crate::domain::Side;
    use crate::error::BrokerError;
    use chrono::Utc;
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    fn fill_for(order: &OrderRequest) -> OrderFill {
        OrderFill {
            order_id: "42".into(),
            client_reference: order.client_reference.clone(),
            instrument: order.instrument.clone(),
            units: order.units,
            price: dec!(1.1),
            time: Utc::now(),
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_fill() {
        let mut mock = MockBroker::new();
        let mut seq = Sequence::new();
        mock.expect_submit_order()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(BrokerError::Transient("503".into())));
        mock.expect_submit_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|order| Ok(fill_for(order)));

        let broker = RetryingBroker::new(Arc::new(mock), fast_policy());
        let order = OrderRequest::market("EUR_USD", Side::Long, 1000, "run-1".into());
        let fill = broker.submit_order(&order).await.unwrap();
        assert_eq!(fill.client_reference, "run-1");
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let mut mock = MockBroker::new();
        mock.expect_account_equity()
            .times(1)
            .returning(|| Err(BrokerError::Auth("401".into())));

        let broker = RetryingBroker::new(Arc::new(mock), fast_policy());
        let err = broker.account_equity().await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut mock = MockBroker::new();
        mock.expect_open_positions()
            .times(3)
            .returning(|_| Err(BrokerError::Transient("timeout".into())));

        let broker = RetryingBroker::new(Arc::new(mock), fast_policy());
        assert!(broker.open_positions("EUR_USD").await.unwrap_err().is_transient());
    }
}
