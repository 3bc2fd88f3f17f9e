pub mod execution;
pub mod query;
pub mod response;
pub mod summary;
