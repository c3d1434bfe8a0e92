pub mod checkpoint;
pub mod record;
pub mod retry;
pub mod retry_store;
pub mod signing;
