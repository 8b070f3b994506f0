pub mod control;
pub mod server;
