pub mod memory;
pub mod postgres;
pub mod session_store;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;
pub use session_store::{SessionStore, StoreError};
