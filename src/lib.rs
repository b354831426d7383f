pub mod cli;
pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;
pub mod relay;
pub mod storage;
