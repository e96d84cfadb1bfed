pub mod client;
pub mod connection;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the handlers the binary mounts on the router.
pub use middleware::identify_user;
pub use rest::list_messages_handler;
pub use ws_handler::ws_handler;
