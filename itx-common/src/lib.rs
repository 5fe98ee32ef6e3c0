pub mod models;
pub mod storage;
pub mod traits;
