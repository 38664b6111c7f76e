//! Shared AWS client setup and SDK error classification.

use crate::config::AwsConfig;
use crate::error::PipelineError;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// Error codes meaning "the thing you addressed does not exist"
const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchKey",
    "NotFound",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "ResourceNotFoundException",
];

/// Throttling and server-side codes worth another attempt
const RETRYABLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "SlowDown",
    "PriorRequestNotComplete",
    "RequestTimeout",
    "RequestTimeoutException",
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "ServiceUnavailable",
    "KMSThrottlingException",
    "AWS.SimpleQueueService.ServiceUnavailable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    NotFound,
    Retry,
    Reject,
}

/// Service errors by code. Responses without a code (unmodeled 5xx bodies)
/// are retried.
fn disposition(code: Option<&str>) -> Disposition {
    match code {
        Some(code) if NOT_FOUND_CODES.contains(&code) => Disposition::NotFound,
        Some(code) if RETRYABLE_CODES.contains(&code) => Disposition::Retry,
        Some(_) => Disposition::Reject,
        None => Disposition::Retry,
    }
}

/// Load the shared SDK configuration for the configured region/endpoint
pub async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));

    // LocalStack / MinIO
    if let Some(ref endpoint_url) = config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    loader.load().await
}

/// Map an SDK failure into the pipeline taxonomy.
///
/// Dispatch failures, timeouts and unparseable responses are transient. A
/// request the SDK could not even build is rejected. Service errors are
/// sorted by their error code.
pub(crate) fn classify<E, R>(operation: &str, target: &str, err: SdkError<E, R>) -> PipelineError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let operation = format!("{operation} {target}");

    let disposition = match &err {
        SdkError::ServiceError(_) => disposition(err.code()),
        SdkError::ConstructionFailure(_) => Disposition::Reject,
        _ => Disposition::Retry,
    };

    match disposition {
        Disposition::NotFound => PipelineError::NotFound(target.to_string()),
        Disposition::Retry => PipelineError::transient(operation, DisplayErrorContext(&err)),
        Disposition::Reject => PipelineError::Rejected {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}
