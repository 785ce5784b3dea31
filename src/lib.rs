pub mod auth;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod presence;
pub mod replay;
pub mod repository;
pub mod state;
pub mod websocket;
pub mod worker;
