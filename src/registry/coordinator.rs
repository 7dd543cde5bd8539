//! The mutation fan-out pipeline.
//!
//! Every mutation runs on the caller's task, never on the worker: snapshot
//! the currently-known nodes, take the cluster-wide lock scoped to the group
//! name, call the registry service on every node, and heal stragglers with a
//! node-up-equivalent event that forces a full exchange. The pipeline always
//! reports success: delivery is best-effort and final consistency is the
//! exchange protocol's job, so partial failures are repaired, not surfaced.

use {
	crate::{
		registry::protocol::{Mutation, Request, Wire},
		substrate::{Intake, LinkEvent, LockKey, Substrate},
	},
	core::time::Duration,
	futures::future::join_all,
	itertools::Itertools,
	std::collections::BTreeSet,
	tokio::sync::mpsc,
	tracing::{debug, warn},
};

/// Per-node timeout of the mutation fan-out call. A node that misses the
/// deadline is treated as a straggler; the mutation still succeeds.
pub(crate) const FANOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock acquisition attempts per pipeline round. An aborted acquisition
/// restarts the whole round: starvation is preferred over failure.
pub(crate) const LOCK_RETRIES: usize = 5;

pub(crate) async fn coordinate<S: Substrate>(
	substrate: &S,
	intake: &mpsc::UnboundedSender<Intake>,
	mutation: Mutation,
) {
	let key = LockKey::group(mutation.group());

	loop {
		// snapshot of the cluster this fan-out will reach
		let targets: Vec<_> = core::iter::once(substrate.node())
			.chain(substrate.nodes())
			.collect();

		let Some(guard) = substrate.lock(&key, LOCK_RETRIES).await else {
			warn!(
				group = %mutation.group(),
				"cluster lock aborted, retrying mutation"
			);
			continue;
		};

		debug!(
			group = %mutation.group(),
			nodes = targets.len(),
			"fanning out mutation"
		);

		let request = Request::Apply(mutation.clone());
		let replies = join_all(targets.iter().map(|node| {
			let request = request.clone();
			async move {
				(node, substrate.call(node, request, Some(FANOUT_TIMEOUT)).await)
			}
		}))
		.await;

		// A timed-out or unreachable node does not fail the mutation: the
		// lock is held for fairness, not correctness, and is released here
		// regardless of the replies.
		drop(guard);

		let bad: Vec<_> = replies
			.into_iter()
			.filter_map(|(node, result)| {
				result
					.inspect_err(|error| {
						warn!(
							group = %mutation.group(),
							node = %node,
							error = %error,
							"fan-out straggler"
						);
					})
					.err()
					.map(|_| node.clone())
			})
			.collect();

		// Bad nodes, plus nodes that connected while the fan-out was in
		// flight, missed the mutation. Enqueue a node-up-equivalent event
		// for each: the worker answers it with a full exchange, which is
		// idempotent and strictly stronger than retrying the lost call. The
		// hello asks the straggler to push its state back once reachable.
		let snapshot: BTreeSet<_> = targets.into_iter().collect();
		let late = substrate
			.nodes()
			.into_iter()
			.filter(|node| !snapshot.contains(node));

		for node in bad.into_iter().chain(late).unique() {
			let _ = intake.send(Intake::Link(LinkEvent::Up(node.clone())));
			substrate.send(&node, Wire::Hello {
				from: substrate.node(),
			});
		}

		return;
	}
}
