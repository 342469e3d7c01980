pub mod config;
pub mod generate;
pub mod providers;
pub mod spend;
