pub mod api;
pub mod config;
pub mod device;
pub mod models;
pub mod outputs;
pub mod providers;
pub mod services;
pub mod sync;
