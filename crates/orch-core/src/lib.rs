pub mod config;
pub mod error;
pub mod event_bus;
pub mod repository;
pub mod store;

pub use config::Config;
pub use error::StoreError;
pub use event_bus::EventBus;
pub use repository::Repository;
pub use store::Store;
