pub mod config;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod http;
pub mod logger;
pub mod notifications;
pub mod price_stream;
pub mod store;
pub mod strategy;
pub mod supervisor;
