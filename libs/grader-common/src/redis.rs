use crate::types::JobOutcome;
use redis::{AsyncCommands, RedisResult};
use serde::Serialize;

/// Redis key semantics for committed grading outputs.
/// Keys are deterministic so the platform and the worker never drift.

pub const RESULT_PREFIX: &str = "grader:result";
pub const STATUS_PREFIX: &str = "grader:status";
pub const STATEMENTS_PREFIX: &str = "grader:statements";

/// Committed outputs and statements expire after 24 hours
pub const RESULT_TTL_SECONDS: u64 = 86400;

/// Generate result key for a job
pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// Generate status key for a job
pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

/// Generate the activity statement list key for a job
pub fn statements_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATEMENTS_PREFIX, job_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Store the committed outcome of a job, plus its verdict for quick lookup
pub async fn store_outcome(
    conn: &mut redis::aio::ConnectionManager,
    outcome: &JobOutcome,
) -> RedisResult<()> {
    let key = result_key(&outcome.job_id);
    let payload = serde_json::to_string(outcome).map_err(serialization_error)?;
    let _: () = conn.set_ex(&key, payload, RESULT_TTL_SECONDS).await?;

    let status = serde_json::to_string(&outcome.verdict).map_err(serialization_error)?;
    let _: () = conn
        .set_ex(status_key(&outcome.job_id), status, RESULT_TTL_SECONDS)
        .await?;

    Ok(())
}

/// Retrieve a committed outcome
pub async fn get_outcome(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobOutcome>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let outcome: JobOutcome = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(outcome))
        }
        None => Ok(None),
    }
}

/// Append activity statements for downstream analytics (RPUSH keeps arrival order)
pub async fn store_statements<T: Serialize>(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
    statements: &[T],
) -> RedisResult<()> {
    if statements.is_empty() {
        return Ok(());
    }

    let payloads = statements
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(serialization_error)?;

    let key = statements_key(job_id);
    let _: () = conn.rpush(&key, payloads).await?;
    let _: () = conn.expire(&key, RESULT_TTL_SECONDS as i64).await?;
    Ok(())
}
