pub mod coordinator;
pub mod events;

pub use coordinator::ExecutionCoordinator;
pub use events::{DomainEvent, EventPublisher, LogLevel, LogLine};
