pub mod agent;
pub mod journal;
pub mod listeners;
pub mod scheduler;
pub mod server;
pub mod transport;
