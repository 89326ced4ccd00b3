pub mod connection_manager;
pub mod receive_state;
