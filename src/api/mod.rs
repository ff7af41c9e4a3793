pub mod rest;
pub mod websocket;

pub use rest::{router, AppState, RestApi};
