//! Metric, span and attribute names.
//!
//! Names follow the `llm.*` / `session.*` namespaces used by dashboards built
//! on top of this telemetry; changing one is a breaking change for them.

/// Span opened around a non-streamed turn.
pub const SPAN_CHAT_REQUEST: &str = "llm_chat_request";
/// Span opened around a streamed turn.
pub const SPAN_CHAT_STREAM: &str = "llm_chat_stream";

/// Instrumentation scope reported in OTLP documents.
pub const INSTRUMENTATION_SCOPE: &str = "llm-observe";

// Metrics
pub const METRIC_REQUESTS: &str = "llm.requests.total";
pub const METRIC_TOKENS: &str = "llm.tokens.total";
pub const METRIC_DURATION: &str = "llm.request.duration";
pub const METRIC_ERRORS: &str = "llm.errors.total";

/// Unit of [`METRIC_DURATION`].
pub const DURATION_UNIT: &str = "ms";

// Metric labels
pub const LABEL_MODEL: &str = "model";
pub const LABEL_STATUS: &str = "status";
pub const LABEL_TOKEN_TYPE: &str = "type";
pub const LABEL_ERROR_TYPE: &str = "error_type";

// Request status values
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_CANCELLED: &str = "cancelled";

// Token type values
pub const TOKEN_PROMPT: &str = "prompt";
pub const TOKEN_COMPLETION: &str = "completion";
pub const TOKEN_TOTAL: &str = "total";

// Span attributes
pub const ATTR_MODEL: &str = "llm.model";
pub const ATTR_PROVIDER: &str = "llm.provider";
pub const ATTR_STREAMING: &str = "llm.streaming";
pub const ATTR_USER_MESSAGE_LENGTH: &str = "llm.user_message_length";
pub const ATTR_RESPONSE_LENGTH: &str = "llm.response_length";
pub const ATTR_PROMPT_TOKENS: &str = "llm.prompt_tokens";
pub const ATTR_COMPLETION_TOKENS: &str = "llm.completion_tokens";
pub const ATTR_TOTAL_TOKENS: &str = "llm.total_tokens";
pub const ATTR_DURATION_MS: &str = "llm.duration_ms";
pub const ATTR_CHUNK_COUNT: &str = "llm.chunk_count";
pub const ATTR_STATUS: &str = "llm.status";
pub const ATTR_ERROR_TYPE: &str = "error.type";
pub const ATTR_ERROR_MESSAGE: &str = "error.message";
pub const ATTR_SESSION_ID: &str = "session.id";
pub const ATTR_SESSION_TURN: &str = "session.turn";

// Resource attributes
pub const RESOURCE_SERVICE_NAME: &str = "service.name";
pub const RESOURCE_SERVICE_VERSION: &str = "service.version";
pub const RESOURCE_ENVIRONMENT: &str = "deployment.environment";
pub const RESOURCE_PROJECT: &str = "telemetry.project";
pub const RESOURCE_WORKSPACE: &str = "telemetry.workspace";

// Exception event
pub const EVENT_EXCEPTION: &str = "exception";
pub const ATTR_EXCEPTION_TYPE: &str = "exception.type";
pub const ATTR_EXCEPTION_MESSAGE: &str = "exception.message";
