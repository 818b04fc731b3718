pub mod caller;
pub mod config;
pub mod llm;
pub mod models;
pub mod server;
pub mod telemetry;

/**
 * \brief Commonly used modules for downstream crates.
 */
pub mod prelude {
    pub use crate::caller;
    pub use crate::config;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::server;
    pub use crate::telemetry;
}
