use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};

use crate::{
    AppState,
    api::models::{
        jobs::{JobResponse, PackResponse, SubmitJobRequest, SubmitJobResponse, SubmitPackRequest},
        pagination::Pagination,
        users::CurrentUser,
    },
    errors::{Error, Result},
    jobs::{
        orchestrator::{SubmitJob, SubmitPack},
        types::JobKind,
    },
    types::JobId,
};

/// Submit a job
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    tag = "jobs",
    summary = "Submit a job",
    description = "Debit the job's cost and hand it to the provider. A job the provider refuses is failed and refunded.",
    request_body = SubmitJobRequest,
    responses(
        (status = 201, description = "Job accepted", body = SubmitJobResponse),
        (status = 400, description = "Invalid kind or payload, or a cost that does not match the price"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Insufficient credits"),
        (status = 502, description = "Provider unavailable; the job failed and was refunded"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn submit_job(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>)> {
    let kind: JobKind = request.kind.parse().map_err(|e: String| Error::BadRequest { message: e })?;

    let job = state
        .jobs
        .submit(
            &current_user.id,
            SubmitJob {
                kind,
                payload: request.payload,
                cost: request.cost,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}

/// Submit a pack of GENERATE prompts
#[utoipa::path(
    post,
    path = "/api/v1/packs",
    tag = "jobs",
    summary = "Submit a prompt pack",
    description = "Create one GENERATE job per prompt, each debited separately. The pack is refused up front if the balance \
                   cannot cover every job not yet created. Resubmitting with the same packId returns the existing jobs.",
    request_body = SubmitPackRequest,
    responses(
        (status = 201, description = "Pack accepted; jobs the provider refused are failed and refunded", body = PackResponse),
        (status = 400, description = "Empty or oversized pack, a blank prompt, or a model that is not a TRAIN job"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Insufficient credits for the whole pack"),
        (status = 404, description = "No such model job for this user"),
        (status = 409, description = "The model job has not succeeded"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn submit_pack(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<SubmitPackRequest>,
) -> Result<(StatusCode, Json<PackResponse>)> {
    let pack_id = request.pack_id.unwrap_or_else(uuid::Uuid::new_v4);
    let jobs = state
        .jobs
        .submit_pack(
            &current_user.id,
            SubmitPack {
                pack_id,
                prompts: request.prompts,
                model_job_id: request.model_job_id,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PackResponse {
            pack_id,
            jobs: jobs.into_iter().map(JobResponse::from).collect(),
        }),
    ))
}

/// List the caller's jobs, newest first
#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    tag = "jobs",
    summary = "List jobs",
    params(Pagination),
    responses(
        (status = 200, description = "The caller's jobs", body = [JobResponse]),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    current_user: CurrentUser,
) -> Result<Json<Vec<JobResponse>>> {
    let jobs = state
        .jobs
        .list(&current_user.id, pagination.skip(), pagination.limit())
        .await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

/// Get a job
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    tag = "jobs",
    summary = "Get job status",
    params(("id" = uuid::Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job", body = JobResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No such job for this user"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>, current_user: CurrentUser) -> Result<Json<JobResponse>> {
    let job = state.jobs.get(&current_user.id, id).await?;
    Ok(Json(job.into()))
}

/// Cancel a job
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/cancel",
    tag = "jobs",
    summary = "Cancel a job",
    description = "Fail a job that has not finished yet and refund its cost.",
    params(("id" = uuid::Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job canceled", body = JobResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No such job for this user"),
        (status = 409, description = "The job already finished"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<JobId>, current_user: CurrentUser) -> Result<Json<JobResponse>> {
    let job = state.jobs.cancel(&current_user.id, id).await?;
    Ok(Json(job.into()))
}

/// Retry a failed job
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/retry",
    tag = "jobs",
    summary = "Retry a failed job",
    description = "Submit a new job with the same kind and payload. The new job is charged again. \
                   A job is retried at most once; retrying it again returns the first retry.",
    params(("id" = uuid::Uuid, Path, description = "ID of the failed job")),
    responses(
        (status = 201, description = "Retry accepted", body = SubmitJobResponse),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "No such job for this user"),
        (status = 409, description = "Only failed jobs can be retried"),
        (status = 502, description = "Provider unavailable; the retry failed and was refunded"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    current_user: CurrentUser,
) -> Result<(StatusCode, Json<SubmitJobResponse>)> {
    let job = state.jobs.retry(&current_user.id, id).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}
