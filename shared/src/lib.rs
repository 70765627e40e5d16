pub mod client;
pub mod codec;
pub mod protocol;
pub mod types;
