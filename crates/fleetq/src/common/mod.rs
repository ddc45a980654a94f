pub mod cli;
pub mod command;
pub mod error;
pub mod rpc;
pub mod setup;
pub mod timeutils;
pub mod wrapped;
