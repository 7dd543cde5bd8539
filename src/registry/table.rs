//! The in-memory state table owned by the registry worker.
//!
//! The table holds the groups known on this node, the per-(group, endpoint)
//! join-counters, and the local-member subsets. Every mutation refreshes the
//! affected group's materialised view, published through a `watch` channel as
//! a persistent map: readers clone a consistent snapshot without ever
//! touching the worker, and the worker never waits for readers.

use {
	crate::{
		id::{EndpointId, GroupName, NodeId},
		registry::protocol::SnapshotRow,
	},
	im::{OrdMap, Vector},
	std::collections::{BTreeMap, BTreeSet},
	tokio::sync::watch,
};

/// The materialised lists of every group on this node, keyed by group name.
/// A group is present here iff it exists, so the key set doubles as the
/// `which_groups` answer.
pub(crate) type Views = OrdMap<GroupName, GroupView>;

/// One group's materialised lists.
///
/// `members` repeats each endpoint once per unit of its join-counter;
/// `local` is the deduplicated subset homed on this node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct GroupView {
	pub members: Vector<EndpointId>,
	pub local: Vector<EndpointId>,
}

/// Outcome of a single leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Left {
	/// The endpoint was not a member; nothing changed.
	NotMember,

	/// One join was undone; the endpoint remains a member.
	Remaining,

	/// The last join was undone; the member tuple is gone.
	Removed,
}

pub(crate) struct Table {
	node: NodeId,
	groups: BTreeMap<GroupName, Group>,
	views: watch::Sender<Views>,
}

#[derive(Default)]
struct Group {
	/// Join-counter per member endpoint, always >= 1.
	members: BTreeMap<EndpointId, u32>,

	/// Members homed on this node.
	local: BTreeSet<EndpointId>,
}

impl Table {
	pub(crate) fn new(node: NodeId) -> (Self, watch::Receiver<Views>) {
		let (views, reader) = watch::channel(Views::default());
		let table = Self {
			node,
			groups: BTreeMap::new(),
			views,
		};

		(table, reader)
	}

	pub(crate) fn has_group(&self, name: &GroupName) -> bool {
		self.groups.contains_key(name)
	}

	pub(crate) fn contains(
		&self,
		name: &GroupName,
		endpoint: &EndpointId,
	) -> bool {
		self
			.groups
			.get(name)
			.is_some_and(|group| group.members.contains_key(endpoint))
	}

	/// Idempotent group upsert. Returns whether the group was created.
	pub(crate) fn assure(&mut self, name: &GroupName) -> bool {
		if self.groups.contains_key(name) {
			return false;
		}

		self.groups.insert(name.clone(), Group::default());
		self.refresh(name);
		true
	}

	/// Records one join of `endpoint` into `name`, creating the group if it
	/// does not exist yet.
	pub(crate) fn join(&mut self, name: &GroupName, endpoint: &EndpointId) {
		let group = self.groups.entry(name.clone()).or_default();

		*group.members.entry(endpoint.clone()).or_insert(0) += 1;
		if *endpoint.node() == self.node {
			group.local.insert(endpoint.clone());
		}

		self.refresh(name);
	}

	/// Undoes one join of `endpoint` from `name`.
	pub(crate) fn leave(
		&mut self,
		name: &GroupName,
		endpoint: &EndpointId,
	) -> Left {
		let Some(group) = self.groups.get_mut(name) else {
			return Left::NotMember;
		};
		let Some(counter) = group.members.get_mut(endpoint) else {
			return Left::NotMember;
		};

		*counter -= 1;
		let outcome = if *counter == 0 {
			group.members.remove(endpoint);
			group.local.remove(endpoint);
			Left::Removed
		} else {
			Left::Remaining
		};

		self.refresh(name);
		outcome
	}

	/// Removes the group, draining every member with its join-counter so the
	/// caller can release the matching monitor references.
	pub(crate) fn delete(
		&mut self,
		name: &GroupName,
	) -> Vec<(EndpointId, u32)> {
		let drained = self
			.groups
			.remove(name)
			.map(|group| group.members.into_iter().collect())
			.unwrap_or_default();

		self.views.send_modify(|views| {
			views.remove(name);
		});

		drained
	}

	/// Every group the endpoint is a member of, with its join-counter there.
	pub(crate) fn groups_of(
		&self,
		endpoint: &EndpointId,
	) -> Vec<(GroupName, u32)> {
		self
			.groups
			.iter()
			.filter_map(|(name, group)| {
				group
					.members
					.get(endpoint)
					.map(|counter| (name.clone(), *counter))
			})
			.collect()
	}

	/// The materialised lists for one group or for all groups, as served to
	/// the verifier scrape.
	pub(crate) fn snapshot(
		&self,
		group: Option<&GroupName>,
	) -> Vec<SnapshotRow> {
		let row = |name: &GroupName, group: &Group| SnapshotRow {
			group: name.clone(),
			members: projected(group),
			local: group.local.iter().cloned().collect(),
		};

		match group {
			Some(name) => self
				.groups
				.get(name)
				.map(|group| vec![row(name, group)])
				.unwrap_or_default(),
			None => self
				.groups
				.iter()
				.map(|(name, group)| row(name, group))
				.collect(),
		}
	}

	/// The pairwise exchange payload for `peer`: every locally-known group
	/// with the subset of its members homed on this node or on the peer.
	/// Duplicate-free; join-counters are a node-local artifact and never
	/// cross the wire.
	pub(crate) fn exchange_payload(
		&self,
		peer: &NodeId,
	) -> Vec<(GroupName, Vec<EndpointId>)> {
		self
			.groups
			.iter()
			.map(|(name, group)| {
				let members = group
					.members
					.keys()
					.filter(|endpoint| {
						*endpoint.node() == self.node || endpoint.node() == peer
					})
					.cloned()
					.collect();
				(name.clone(), members)
			})
			.collect()
	}

	#[cfg(test)]
	pub(crate) fn count(&self, name: &GroupName, endpoint: &EndpointId) -> u32 {
		self
			.groups
			.get(name)
			.and_then(|group| group.members.get(endpoint).copied())
			.unwrap_or(0)
	}

	/// Rebuilds and publishes the materialised view of one group.
	fn refresh(&mut self, name: &GroupName) {
		let Some(group) = self.groups.get(name) else {
			return;
		};

		let view = GroupView {
			members: projected(group).into_iter().collect(),
			local: group.local.iter().cloned().collect(),
		};

		self.views.send_modify(|views| {
			views.insert(name.clone(), view);
		});
	}
}

/// The full members projection with one repetition per join-counter unit.
fn projected(group: &Group) -> Vec<EndpointId> {
	group
		.members
		.iter()
		.flat_map(|(endpoint, counter)| {
			core::iter::repeat_n(endpoint.clone(), *counter as usize)
		})
		.collect()
}
