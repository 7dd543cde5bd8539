use crate::id::GroupName;

/// The public error surface of the registry.
///
/// Transient coordination failures (lock aborts, fan-out stragglers,
/// unreachable peers) are never surfaced here; they are logged and repaired
/// asynchronously by the exchange protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	#[error("no such group: {0}")]
	NoSuchGroup(GroupName),

	#[error("no process in group: {0}")]
	NoProcess(GroupName),

	#[error("registry service is terminated")]
	Terminated,
}
