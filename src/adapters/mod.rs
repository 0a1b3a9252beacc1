pub mod oanda;
pub mod postgres;

pub use oanda::OandaClient;
pub use postgres::PostgresStore;
