pub mod postgres;
pub mod replay;

pub use postgres::PostgresStore;
pub use replay::ReplayBroker;
