pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod translate;

pub use backend::{HttpBackend, Native, NativeHandler, NativeReply, NativeStream};
pub use config::ShimConfig;
pub use error::{NativeFailure, Result, ShimError};
pub use logging::ExchangeLog;
pub use proxy::{Engine, Reply, SseFrame};
pub use server::{build_router, AppState};
