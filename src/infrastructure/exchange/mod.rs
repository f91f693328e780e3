pub mod mock;

pub use mock::MockExchangeProvider;
