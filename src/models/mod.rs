pub mod chat;
pub mod report;
pub mod user;
pub mod websocket;
