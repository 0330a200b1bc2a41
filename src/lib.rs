pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod error;
pub mod explain;
pub mod manager;
pub mod preprocess;
pub mod server;
pub mod torch;
pub mod uploads;
pub mod worker;

pub use error::{Error, Result};

/// Small helpers shared by the binaries
pub mod util {
    use rand::RngCore;
    use tracing_subscriber::EnvFilter;

    /// `n_bytes` random bytes as lowercase hex
    pub fn random_hex(n_bytes: usize) -> String {
        let mut bytes = vec![0u8; n_bytes];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Install the global `tracing` subscriber. `RUST_LOG` wins over `filter`
    pub fn init_tracing(filter: &str) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

}
