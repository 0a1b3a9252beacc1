pub mod factory;
pub mod paper;
pub mod retry;
pub mod sim;
mod traits;

pub use factory::{build_broker, build_broker_for, BrokerHandles};
pub use paper::{PaperBroker, PaperFeed, RandomWalkConfig};
pub use retry::{RetryPolicy, RetryingBroker};
pub use sim::SimulatedBroker;
pub use traits::{BarStream, Broker, BrokerKind, BrokerResult, PriceSource};

#[cfg(test)]
pub use traits::MockBroker;
