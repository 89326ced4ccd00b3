pub mod chunk;
pub mod inbound;
pub mod outbound;
pub mod resolver;
pub mod send_socket;
pub mod udp_channel;
