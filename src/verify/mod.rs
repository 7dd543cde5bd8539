//! Offline cluster-state verification.
//!
//! The verifier scrapes every known node's materialised lists over the
//! substrate's read-only RPC and diffs each node's claims against the
//! authoritative membership. Authority follows endpoint homes: a node's
//! report of its *local* members is taken as the truth for every endpoint
//! homed there, so the authoritative set of a group is the union of local
//! members across all responding nodes. The verifier never mutates registry
//! state; nodes that fail the scrape are reported, not raised.

use {
	crate::{
		id::{EndpointId, GroupName, NodeId},
		registry::protocol::{Reply, Request, SnapshotRow},
		substrate::Substrate,
	},
	futures::future::join_all,
	serde::Serialize,
	std::collections::{BTreeMap, BTreeSet},
	tracing::warn,
};

/// The outcome of one cluster-state verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
	/// Nodes that answered the scrape.
	pub nodes: usize,

	/// Distinct group names seen on any node.
	pub groups: usize,

	/// Distinct authoritative (group, member) pairs.
	pub members: usize,

	/// Per-node, per-group asymmetries; empty when the cluster agrees.
	pub diffs: Vec<Diff>,

	/// Nodes whose scrape failed; their data is missing from the diffs.
	pub unreachable: Vec<NodeId>,
}

impl Report {
	/// Whether every responding node agrees on every group.
	pub fn converged(&self) -> bool {
		self.diffs.is_empty()
	}
}

/// One node's asymmetry in one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
	pub node: NodeId,
	pub group: GroupName,

	/// Authoritative members this node does not claim.
	pub missing: Vec<EndpointId>,

	/// Members this node claims beyond the authoritative set.
	pub extra: Vec<EndpointId>,
}

pub(crate) async fn verify_cluster_state<S: Substrate>(
	substrate: &S,
	group: Option<GroupName>,
) -> Report {
	let targets: Vec<_> = core::iter::once(substrate.node())
		.chain(substrate.nodes())
		.collect();

	let scrape = join_all(targets.iter().map(|node| {
		let group = group.clone();
		async move {
			let result = substrate
				.call(node, Request::Snapshot { group }, None)
				.await;
			(node.clone(), result)
		}
	}))
	.await;

	let mut responded: Vec<(NodeId, Vec<SnapshotRow>)> = Vec::new();
	let mut unreachable = Vec::new();
	for (node, result) in scrape {
		match result {
			Ok(Reply::Snapshot(rows)) => responded.push((node, rows)),
			Ok(_) | Err(_) => {
				warn!(node = %node, "state scrape failed, excluding node");
				unreachable.push(node);
			}
		}
	}

	let mut authoritative: BTreeMap<GroupName, BTreeSet<EndpointId>> =
		BTreeMap::new();
	let mut claimed: BTreeMap<(GroupName, NodeId), BTreeSet<EndpointId>> =
		BTreeMap::new();

	for (node, rows) in &responded {
		for row in rows {
			authoritative
				.entry(row.group.clone())
				.or_default()
				.extend(row.local.iter().cloned());
			claimed.insert(
				(row.group.clone(), node.clone()),
				row.members.iter().cloned().collect(),
			);
		}
	}

	let mut diffs = Vec::new();
	for (name, truth) in &authoritative {
		for (node, _) in &responded {
			let claim = claimed
				.get(&(name.clone(), node.clone()))
				.cloned()
				.unwrap_or_default();

			let missing: Vec<_> = truth.difference(&claim).cloned().collect();
			let extra: Vec<_> = claim.difference(truth).cloned().collect();

			if !missing.is_empty() || !extra.is_empty() {
				diffs.push(Diff {
					node: node.clone(),
					group: name.clone(),
					missing,
					extra,
				});
			}
		}
	}

	diffs.sort_by(|a, b| (&a.group, &a.node).cmp(&(&b.group, &b.node)));

	Report {
		nodes: responded.len(),
		groups: authoritative.len(),
		members: authoritative.values().map(BTreeSet::len).sum(),
		diffs,
		unreachable,
	}
}
