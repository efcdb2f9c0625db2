use std::{io, net::SocketAddr};

use thiserror::Error;
use tracing_subscriber::util::TryInitError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to bind http listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("http server stopped with an error: {0}")]
    Serve(#[source] io::Error),
    #[error("failed to install tracing subscriber: {0}")]
    Telemetry(#[from] TryInitError),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn bind(addr: SocketAddr) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Bind { addr, source }
    }
}
