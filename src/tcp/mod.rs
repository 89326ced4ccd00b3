pub mod frame;
pub mod pool;
pub mod tcp_channel;
pub mod tcp_connection;
