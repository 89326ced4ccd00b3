pub mod address;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod manager;
pub mod stats;
pub mod tcp;
pub mod udp;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
