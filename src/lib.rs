pub mod cache;
pub mod cli;
pub mod codegen;
pub mod config;
pub mod runtime;
pub mod utils;

pub use transcache_abi as abi;

pub mod version {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
