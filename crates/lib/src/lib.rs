//! Threadline core library: WhatsApp webhook relay to an assistant, with one persistent
//! conversation thread per user. Used by the `threadline` CLI.

pub mod assistant;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod format;
pub mod gateway;
pub mod init;
pub mod poller;
pub mod session;
pub mod store;
