//! Tracing and logging setup shared by every process that runs sync jobs.

/// Initialize process-wide observability (tracing/logging).
///
/// Output format comes from `LOG_FORMAT` (`json` by default, or `pretty`).
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("LOG_FORMAT").ok();
    tracing::init(tracing::LogFormat::from_env_value(format.as_deref()));
}

/// Tracing configuration (filters, formats).
pub mod tracing;
