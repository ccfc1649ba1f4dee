//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::rate_limit_service_server::RateLimitServiceServer;
use super::service::RateLimitServiceImpl;
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitBackend;

/// gRPC server for the rate limit service.
pub struct GrpcServer<R: RateLimitBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiting backend
    backend: Arc<R>,
}

impl<R: RateLimitBackend + 'static> GrpcServer<R> {
    pub fn new(addr: SocketAddr, backend: Arc<R>) -> Self {
        Self { addr, backend }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateLimitServiceImpl::new(self.backend);

        info!(
            addr = %self.addr,
            "Starting gRPC server for RateLimitService"
        );

        Server::builder()
            .add_service(RateLimitServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}
