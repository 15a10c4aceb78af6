//! Routes IPC methods onto [`RepoUpdaterService`] operations.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{RepoId, RepoRecord};
use crate::error::Result;
use crate::ipc::messages::{DaemonError, DaemonRequest, DaemonResponse, Methods};
use crate::ipc::server::RequestHandler;
use crate::service::{
    EnqueueChangesetSyncRequest, EnqueueRepoUpdateRequest, RecloneRepositoryRequest, RepoUpdaterService,
    SchedulerInfoRequest,
};

#[derive(Debug, serde::Deserialize)]
struct UntrackParams {
    repo_id: RepoId,
}

/// [`RequestHandler`] backed by the service.
pub struct ServiceRouter {
    service: Arc<RepoUpdaterService>,
}

impl ServiceRouter {
    pub fn new(service: Arc<RepoUpdaterService>) -> Self {
        Self { service }
    }

    /// Handle one request synchronously. Service calls never wait on fetches.
    pub fn dispatch(&self, request: DaemonRequest) -> DaemonResponse {
        let id = request.id;
        let service = &self.service;

        let result = match request.method.as_str() {
            Methods::PING => Ok(serde_json::json!({ "pong": true })),
            Methods::SCHEDULER_INFO => call(request.params, |req: SchedulerInfoRequest| {
                service.repo_update_scheduler_info(&req)
            }),
            Methods::ENQUEUE_UPDATE => call(request.params, |req: EnqueueRepoUpdateRequest| {
                service.enqueue_repo_update(&req)
            }),
            Methods::RECLONE => call(request.params, |req: RecloneRepositoryRequest| {
                service.reclone_repository(&req)
            }),
            Methods::ENQUEUE_CHANGESET_SYNC => call(request.params, |req: EnqueueChangesetSyncRequest| {
                service.enqueue_changeset_sync(&req)
            }),
            Methods::TRACK => call(request.params, |record: RepoRecord| {
                service
                    .track(record)
                    .map(|outcome| serde_json::json!({ "scheduled": outcome.needs_wake() }))
            }),
            Methods::UNTRACK => call(request.params, |params: UntrackParams| {
                service
                    .untrack(params.repo_id)
                    .map(|removed| serde_json::json!({ "removed": removed }))
            }),
            Methods::LIST => call_no_params(|| service.list()),
            Methods::STATS => call_no_params(|| Ok(service.stats())),
            other => Err(DaemonError::method_not_found(other)),
        };

        match result {
            Ok(value) => DaemonResponse::success(id, value),
            Err(error) => {
                tracing::debug!(method = %request.method, code = error.code, message = %error.message, "Request failed");
                DaemonResponse::error(id, error)
            }
        }
    }
}

impl RequestHandler for ServiceRouter {
    fn handle(&self, request: DaemonRequest) -> impl Future<Output = DaemonResponse> + Send {
        let response = self.dispatch(request);
        async move { response }
    }
}

fn call<P, R>(params: Value, op: impl FnOnce(P) -> Result<R>) -> std::result::Result<Value, DaemonError>
where
    P: DeserializeOwned,
    R: Serialize,
{
    let params: P = serde_json::from_value(params).map_err(|e| DaemonError::invalid_params(e.to_string()))?;
    let result = op(params).map_err(|e| DaemonError::from(&e))?;
    serde_json::to_value(result).map_err(|e| DaemonError::internal_error(e.to_string()))
}

fn call_no_params<R: Serialize>(op: impl FnOnce() -> Result<R>) -> std::result::Result<Value, DaemonError> {
    let result = op().map_err(|e| DaemonError::from(&e))?;
    serde_json::to_value(result).map_err(|e| DaemonError::internal_error(e.to_string()))
}
