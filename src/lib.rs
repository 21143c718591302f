pub mod config;
pub mod handler;
pub mod reconcile;
pub mod server;

pub use server::{LiveVertex, Worker, worker_main};
