pub mod data_uri;
pub mod json;
pub mod retry;
