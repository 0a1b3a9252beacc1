use std::sync::Arc;

use crate::adapters::OandaClient;
use crate::config::AppConfig;
use crate::error::{FxError, Result};

use super::paper::{PaperBroker, PaperFeed, RandomWalkConfig};
use super::retry::{RetryPolicy, RetryingBroker};
use super::{Broker, BrokerKind, PriceSource};

/// Order side and bar side of one broker connection
#[derive(Clone)]
pub struct BrokerHandles {
    pub broker: Arc<dyn Broker>,
    pub prices: Arc<dyn PriceSource>,
}

/// Create the runtime broker from `AppConfig`.
///
/// `feed` only applies to the paper broker; `None` means an endless random walk.
pub fn build_broker(app_config: &AppConfig, feed: Option<PaperFeed>) -> Result<BrokerHandles> {
    build_broker_for(app_config.broker.kind, app_config, feed)
}

/// Create a broker for an explicit kind. Order calls are wrapped in the configured retry policy.
pub fn build_broker_for(
    kind: BrokerKind,
    app_config: &AppConfig,
    feed: Option<PaperFeed>,
) -> Result<BrokerHandles> {
    let policy = RetryPolicy::from_config(&app_config.execution);

    match kind {
        BrokerKind::Paper => {
            let feed = feed.unwrap_or_else(|| PaperFeed::RandomWalk(RandomWalkConfig::default()));
            let paper = Arc::new(PaperBroker::new(
                app_config.broker.paper_balance,
                app_config.risk.spread_pips,
                feed,
            ));
            Ok(BrokerHandles {
                broker: Arc::new(RetryingBroker::new(paper.clone(), policy)),
                prices: paper,
            })
        }
        BrokerKind::Oanda => {
            let client = Arc::new(OandaClient::from_config(&app_config.broker)?);
            Ok(BrokerHandles {
                broker: Arc::new(RetryingBroker::new(client.clone(), policy)),
                prices: client,
            })
        }
        BrokerKind::Simulated => Err(FxError::Validation(
            "the simulated broker has no price feed; use it through the backtest engine".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds_paper_broker() {
        let handles = build_broker(&AppConfig::default_config(), None).unwrap();
        assert_eq!(handles.broker.kind(), BrokerKind::Paper);
    }

    #[test]
    fn test_simulated_kind_is_rejected() {
        let result = build_broker_for(BrokerKind::Simulated, &AppConfig::default_config(), None);
        assert!(matches!(result, Err(FxError::Validation(_))));
    }
}
