pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod lockfile;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
