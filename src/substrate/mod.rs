//! The seam between the registry and the clustering layer.
//!
//! The registry is deliberately transport-agnostic: everything it needs from
//! a cluster (node identity, connectivity, node-up/node-down events,
//! addressed messaging, synchronous RPC, a cluster-wide named lock, and
//! endpoint liveness monitors) is expressed by the [`Substrate`] trait.
//! The crate ships one built-in implementation, the in-process [`mesh`],
//! used by tests, examples, and single-process embeddings.

use {
	crate::{
		id::{EndpointId, GroupName, MonitorRef, NodeId},
		registry::protocol::{Reply, Request, Subscribed, Update, Wire},
	},
	core::time::Duration,
	tokio::sync::{mpsc, oneshot},
};

pub mod mesh;

/// Service identifier under which the registry binds itself on every node.
/// Scopes the cluster-wide lock keys so unrelated services sharing the same
/// lock primitive cannot collide.
pub const SERVICE: &str = "roster";

/// The event stream feeding a registry service.
///
/// Every input to the service (local API calls, inbound peer calls, peer
/// wire messages, link events, and observer subscriptions) arrives through
/// one channel of these, which is what serializes all state mutations.
#[derive(Debug)]
pub enum Intake {
	/// A synchronous request; the reply is delivered through the enclosed
	/// channel. Both local callers and remote fan-outs land here.
	Call(Request, oneshot::Sender<Reply>),

	/// A peer wire message.
	Wire(Wire),

	/// A connectivity change reported by the substrate.
	Link(LinkEvent),

	/// A local observer subscription (never crosses the wire; the sink is a
	/// process-local channel).
	Observe(EndpointId, mpsc::UnboundedSender<Update>, oneshot::Sender<Subscribed>),
}

/// Node connectivity events emitted by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
	/// A node became connected.
	Up(NodeId),

	/// A node became disconnected.
	Down(NodeId),
}

/// A one-shot endpoint death notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Down(pub MonitorRef);

/// Where a monitor delivers its death notification.
pub type DeathSink = mpsc::UnboundedSender<Down>;

/// Key of the cluster-wide named lock taken around every mutation fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
	service: &'static str,
	group: GroupName,
}

impl LockKey {
	/// The lock scope for mutations of one group.
	pub fn group(name: &GroupName) -> Self {
		Self {
			service: SERVICE,
			group: name.clone(),
		}
	}
}

/// Failure modes of a synchronous cross-node call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
	#[error("node is not reachable")]
	Unreachable,

	#[error("call timed out")]
	Timeout,
}

/// The contract the clustering layer must fulfil.
///
/// Notes:
///
/// - Implementations are cheap-to-clone handles; all clones refer to the same
///   node.
///
/// - `send` is best-effort: messages to unreachable nodes are silently
///   dropped. Reliability is recovered by the exchange protocol, never by the
///   transport.
///
/// - `monitor`/`demonitor` follow one-shot semantics: a monitor fires at most
///   once, fires immediately when armed against an already-dead endpoint, and
///   `demonitor` reports whether the notification may still be in flight so
///   the consumer can flush it.
pub trait Substrate: Clone + Send + Sync + 'static {
	/// Guard type of the cluster-wide lock; the lock is released on drop.
	type Lock: Send + 'static;

	/// The identity of the local node.
	fn node(&self) -> NodeId;

	/// The currently connected peer nodes. Never contains the local node.
	fn nodes(&self) -> Vec<NodeId>;

	/// Whether the given node is currently connected.
	fn is_connected(&self, node: &NodeId) -> bool;

	/// Binds the local registry service: all inbound calls, wire messages and
	/// link events for this node are delivered through `intake`. Binding again
	/// replaces the previous service (supervised restart).
	fn attach(&self, intake: mpsc::UnboundedSender<Intake>);

	/// Best-effort addressed message to the registry service on `node`.
	fn send(&self, node: &NodeId, wire: Wire);

	/// Synchronous RPC to the registry service on `node`. A `timeout` of
	/// `None` waits for as long as the substrate itself allows.
	fn call(
		&self,
		node: &NodeId,
		request: Request,
		timeout: Option<Duration>,
	) -> impl Future<Output = Result<Reply, CallError>> + Send;

	/// Acquires the cluster-wide named lock, retrying acquisition at most
	/// `retries` times. Returns `None` when every attempt was aborted
	/// (deadlock avoidance or acquisition timeout); the caller decides whether
	/// to retry the whole sequence.
	fn lock(
		&self,
		key: &LockKey,
		retries: usize,
	) -> impl Future<Output = Option<Self::Lock>> + Send;

	/// Arms a one-shot death monitor on `endpoint`, delivering to `deaths`.
	fn monitor(&self, endpoint: &EndpointId, deaths: DeathSink) -> MonitorRef;

	/// Cancels a monitor. Returns `true` when the monitor was still armed and
	/// no notification will ever be delivered; `false` when it had already
	/// fired, meaning a [`Down`] may be in flight and must be flushed by the
	/// consumer.
	fn demonitor(&self, monitor: MonitorRef) -> bool;
}
