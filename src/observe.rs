use crate::error::ErrorCode;

pub(crate) fn session_submitted() {
    #[cfg(feature = "metrics")]
    metrics::counter!("ipmiconsole_sessions_submitted_total").increment(1);
}

pub(crate) fn session_established() {
    #[cfg(feature = "metrics")]
    metrics::counter!("ipmiconsole_sessions_established_total").increment(1);
}

pub(crate) fn session_closed(code: ErrorCode) {
    let outcome = code.as_str();

    #[cfg(feature = "metrics")]
    metrics::counter!("ipmiconsole_sessions_closed_total", "outcome" => outcome).increment(1);

    if !code.is_success() {
        tracing::info!(outcome, "console session closed with error");
    }
}

pub(crate) fn worker_exited() {
    #[cfg(feature = "metrics")]
    metrics::counter!("ipmiconsole_worker_exits_total").increment(1);

    tracing::debug!("worker thread exited");
}
