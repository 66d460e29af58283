pub mod connections;
pub mod migrations;
pub mod models;
pub mod store;

pub use connections::ConnectionRegistry;
pub use models::*;
pub use store::Store;
