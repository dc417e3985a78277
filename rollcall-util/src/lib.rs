pub mod dirs;
pub mod fs;
pub mod http;
pub mod random;
pub mod store;
pub mod types;
