pub mod certs;
pub mod client_args;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fs_util;
pub mod materials;
pub mod report;
pub mod seeder;
pub mod services;
pub mod trust;
pub mod unseal;
pub mod utils;
pub mod vault;
pub mod wrapper;

pub use client_args::Args;
