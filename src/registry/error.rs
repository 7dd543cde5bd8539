use crate::id::MonitorRef;

/// Fatal worker-side failures.
///
/// The worker never propagates a failure to a caller: transient conditions
/// are logged and repaired by the exchange protocol, and anything here
/// terminates the service loop. Supervision is expected to respawn the
/// registry, whose state is then rebuilt via exchange.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WorkerError {
	#[error("death notification for unknown monitor {0}")]
	UnknownMonitor(MonitorRef),
}
