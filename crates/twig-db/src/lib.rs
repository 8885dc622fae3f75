pub mod conversations;
mod database;
pub mod error;
pub mod gateway;
mod migration;
pub mod store;

pub use conversations::{Conversations, ListConversations};
pub use error::{Error, Result};
pub use gateway::SqliteGateway;
pub use store::Store;
