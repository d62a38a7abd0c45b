pub mod api;
pub mod config;
pub mod decode;
pub mod event;
pub mod input;
pub mod params;
pub mod parser;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
pub mod timestamp;
