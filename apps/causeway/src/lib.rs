pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod negotiate;
pub mod protocol;
pub mod registry;
pub mod upstream;
pub mod websocket;
