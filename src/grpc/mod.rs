//! gRPC surface of the rate limiting service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateLimitServiceImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("tollgate.v1");
}

// Re-export commonly used types
pub use proto::{
    rate_limit_service_client::RateLimitServiceClient, rate_limit_service_server::RateLimitServiceServer,
    DecideRequest, DecideResponse,
};
