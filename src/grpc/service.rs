//! Rate limit service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::{
    self, decide_response::Code, rate_limit_service_server::RateLimitService, DecideRequest, DecideResponse,
    GetAlgorithmRequest, GetUsageHistoryRequest, GetUsageRequest, HeaderValue, ListUsageRequest,
    SetAlgorithmRequest, UsageReportList,
};

use crate::error::TollgateError;
use crate::ratelimit::{AlgorithmSetting, LimitDecision, RateLimitBackend};
use crate::usage::{UsageReport, DEFAULT_HISTORY_MONTHS};

/// Actor recorded when a SetAlgorithm call names none.
const ANONYMOUS_ACTOR: &str = "anonymous";

/// Implementation of the `tollgate.v1.RateLimitService` gRPC interface.
pub struct RateLimitServiceImpl<R: RateLimitBackend> {
    backend: Arc<R>,
}

impl<R: RateLimitBackend> RateLimitServiceImpl<R> {
    pub fn new(backend: Arc<R>) -> Self {
        Self { backend }
    }
}

/// Map a domain error onto a gRPC status.
fn to_status(err: TollgateError) -> Status {
    match err {
        TollgateError::UnknownClientOrTier(what) => Status::not_found(what),
        TollgateError::InactiveClient(id) => Status::permission_denied(format!("client {} is inactive", id)),
        TollgateError::InvalidConfiguration(reason) => Status::invalid_argument(reason),
        TollgateError::StoreUnavailable(reason) => Status::unavailable(reason),
        TollgateError::TierInUse(tier) => Status::failed_precondition(format!("tier {} is in use", tier)),
        err @ TollgateError::LimitExceeded { .. } => Status::resource_exhausted(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

fn to_response(decision: LimitDecision) -> DecideResponse {
    let code = if decision.allowed { Code::Ok } else { Code::OverLimit };
    let response_headers_to_add = decision
        .response_headers()
        .into_iter()
        .map(|(key, value)| HeaderValue {
            key: key.to_string(),
            value,
        })
        .collect();

    DecideResponse {
        code: code.into(),
        allowed: decision.allowed,
        limit_type: decision.limit_type.to_string(),
        current_usage: decision.current_usage,
        limit: decision.limit,
        remaining: decision.remaining,
        retry_after: Some(prost_types::Duration {
            seconds: decision.retry_after_seconds as i64,
            nanos: 0,
        }),
        throttling_level: decision.throttling_level.to_string(),
        algorithm_used: decision.algorithm_used.to_string(),
        http_status: decision.http_status() as u32,
        message: decision.message,
        response_headers_to_add,
    }
}

fn to_algorithm_setting(setting: AlgorithmSetting) -> proto::AlgorithmSetting {
    proto::AlgorithmSetting {
        algorithm: setting.algorithm.to_string(),
        updated_by: setting.updated_by.unwrap_or_default(),
        updated_at: setting.updated_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
    }
}

fn to_usage_report(report: UsageReport) -> proto::UsageReport {
    proto::UsageReport {
        client_id: report.client_id,
        client_name: report.client_name,
        tier_name: report.tier_name,
        current_month: report.current_month,
        total_requests: report.total_requests,
        rate_limit_hits: report.rate_limit_hits,
        requests_per_month: report.requests_per_month,
        requests_per_minute: report.requests_per_minute,
        remaining_requests: report.remaining_requests,
        percentage_used: report.percentage_used,
    }
}

#[tonic::async_trait]
impl<R: RateLimitBackend + 'static> RateLimitService for RateLimitServiceImpl<R> {
    /// Decide whether the request carrying an API key is admitted.
    ///
    /// Rejections are a normal response with `allowed == false`; only lookup
    /// and store failures become error statuses.
    #[instrument(skip(self, request))]
    async fn decide(&self, request: Request<DecideRequest>) -> Result<Response<DecideResponse>, Status> {
        let req = request.into_inner();

        if req.api_key.is_empty() {
            warn!("Received decide request without an API key");
            return Err(Status::invalid_argument("api_key is required"));
        }

        let decision = self.backend.decide(&req.api_key).await.map_err(to_status)?;

        debug!(
            allowed = decision.allowed,
            limit_type = %decision.limit_type,
            throttling = %decision.throttling_level,
            "Rate limit decision made"
        );

        Ok(Response::new(to_response(decision)))
    }

    async fn get_algorithm(
        &self,
        _request: Request<GetAlgorithmRequest>,
    ) -> Result<Response<proto::AlgorithmSetting>, Status> {
        let setting = self.backend.algorithm_setting().await.map_err(to_status)?;
        Ok(Response::new(to_algorithm_setting(setting)))
    }

    #[instrument(skip(self, request), fields(algorithm = %request.get_ref().algorithm))]
    async fn set_algorithm(
        &self,
        request: Request<SetAlgorithmRequest>,
    ) -> Result<Response<proto::AlgorithmSetting>, Status> {
        let req = request.into_inner();
        let actor = if req.actor.is_empty() {
            ANONYMOUS_ACTOR
        } else {
            req.actor.as_str()
        };

        let setting = self
            .backend
            .set_algorithm(&req.algorithm, actor)
            .await
            .map_err(to_status)?;

        info!(algorithm = %setting.algorithm, actor = %actor, "Algorithm updated via gRPC");
        Ok(Response::new(to_algorithm_setting(setting)))
    }

    #[instrument(skip(self, request), fields(client_id = %request.get_ref().client_id))]
    async fn get_usage(&self, request: Request<GetUsageRequest>) -> Result<Response<proto::UsageReport>, Status> {
        let req = request.into_inner();

        if req.client_id.is_empty() {
            return Err(Status::invalid_argument("client_id is required"));
        }

        let report = self.backend.usage_report(&req.client_id).await.map_err(to_status)?;
        Ok(Response::new(to_usage_report(report)))
    }

    #[instrument(skip(self, request), fields(client_id = %request.get_ref().client_id))]
    async fn get_usage_history(
        &self,
        request: Request<GetUsageHistoryRequest>,
    ) -> Result<Response<UsageReportList>, Status> {
        let req = request.into_inner();

        if req.client_id.is_empty() {
            return Err(Status::invalid_argument("client_id is required"));
        }
        let months = match req.months {
            0 => DEFAULT_HISTORY_MONTHS,
            n => n as usize,
        };

        let reports = self
            .backend
            .usage_history(&req.client_id, months)
            .await
            .map_err(to_status)?;
        Ok(Response::new(UsageReportList {
            reports: reports.into_iter().map(to_usage_report).collect(),
        }))
    }

    async fn list_usage(&self, _request: Request<ListUsageRequest>) -> Result<Response<UsageReportList>, Status> {
        let reports = self.backend.list_usage().await.map_err(to_status)?;
        debug!(clients = reports.len(), "Listed current-month usage");
        Ok(Response::new(UsageReportList {
            reports: reports.into_iter().map(to_usage_report).collect(),
        }))
    }
}
