pub mod config;
pub mod db;
pub mod diff;
pub mod email;
pub mod fetch;
pub mod lock;
pub mod model;
pub mod notify;
pub mod parse;
pub mod server;
pub mod sms;
pub mod subscription;
