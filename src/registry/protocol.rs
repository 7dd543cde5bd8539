//! Messages crossing the registry service boundary.
//!
//! Everything in this module is part of the external surface of the service:
//! [`Wire`] messages travel node-to-node over the substrate's addressed
//! messaging, [`Request`]/[`Reply`] form the synchronous RPC surface used by
//! the mutation fan-out and the verifier scrape, and [`Update`] is what
//! subscribed local observers receive. All of it derives `serde` so a real
//! transport can frame it; the built-in mesh passes values as-is.

use {
	crate::id::{EndpointId, GroupName, NodeId},
	serde::{Deserialize, Serialize},
};

/// A single group mutation, applied identically on every node it reaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
	/// Ensure the group exists. Idempotent.
	Create(GroupName),

	/// Remove the group and every membership it holds.
	Delete(GroupName),

	/// Record one join of the endpoint into the group.
	Join(GroupName, EndpointId),

	/// Undo one join of the endpoint from the group.
	Leave(GroupName, EndpointId),
}

impl Mutation {
	/// The group this mutation operates on; also the cluster lock scope.
	pub fn group(&self) -> &GroupName {
		match self {
			Self::Create(name)
			| Self::Delete(name)
			| Self::Join(name, _)
			| Self::Leave(name, _) => name,
		}
	}
}

/// A synchronous request addressed to the registry service on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
	/// Apply a mutation to the receiving node's state table.
	Apply(Mutation),

	/// Fetch the receiving node's materialised lists, either for one group or
	/// for all of them. Read-only; used by the verifier.
	Snapshot { group: Option<GroupName> },

	/// Mailbox barrier: replies once every event enqueued before it has been
	/// processed.
	Sync,
}

/// The reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
	Applied,
	Snapshot(Vec<SnapshotRow>),
	Synced,
}

/// One group's materialised lists as reported by a single node.
///
/// `members` repeats an endpoint once per unit of its join-counter, matching
/// what `get_members` returns on that node; `local` is the deduplicated
/// local-only list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
	pub group: GroupName,
	pub members: Vec<EndpointId>,
	pub local: Vec<EndpointId>,
}

/// Peer wire messages, delivered best-effort via the substrate's addressed
/// messaging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wire {
	/// Sent to every known peer when a registry service starts, and to
	/// stragglers after a partial fan-out. The receiver answers with an
	/// [`Wire::Exchange`] carrying its own state.
	Hello { from: NodeId },

	/// Pairwise state exchange: every group the sender knows, with the subset
	/// of its members homed on either end of the exchange. The receiver merges
	/// by union and never removes members on the basis of absence.
	Exchange {
		from: NodeId,
		groups: Vec<(GroupName, Vec<EndpointId>)>,
	},

	/// Instructs the receiver to re-send its state to all of its peers.
	Resync,
}

/// The per-mutation delta delivered to subscribed local observers: the names
/// of the groups whose membership changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update(pub Vec<GroupName>);

/// Outcome of an observer subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscribed {
	/// The observer was added to the subscriber set.
	New,

	/// The observer was already subscribed; the call had no effect.
	AlreadyPresent,
}
