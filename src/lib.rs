//! Fila de jobs em segundo plano cujos workers são execuções curtas
//! disparadas por HTTP, que se relançam por um pedido de loopback antes de
//! o orçamento de tempo acabar.

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod liveness;
pub mod logging;
pub mod loopback;
pub mod secret;
pub mod store;
pub mod worker;

pub use error::{RelaunchError, Result};
