pub mod api;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod queue;
pub mod sandbox;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod worker;
