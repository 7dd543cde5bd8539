#![allow(unused)]

use {core::time::Duration, roster::prelude::*};

/// Polls `condition` until it holds or a generous deadline passes. Used to
/// wait out the asynchronous exchange rounds between nodes.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
	for _ in 0..300 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	panic!("timed out waiting for: {what}");
}

/// A short grace period for things that should *not* happen.
pub async fn grace() {
	tokio::time::sleep(Duration::from_millis(100)).await;
}

pub fn sorted(mut members: Vec<EndpointId>) -> Vec<EndpointId> {
	members.sort();
	members
}

/// Spawns one registry per node name on a fresh mesh, with no links yet.
pub fn cluster(names: &[&str]) -> (Mesh, Vec<Registry<MeshNode>>) {
	let mesh = Mesh::default();
	let registries = names
		.iter()
		.map(|name| Registry::spawn(mesh.node(*name)))
		.collect();

	(mesh, registries)
}

/// Links every pair of the given nodes.
pub fn connect_all(mesh: &Mesh, names: &[&str]) {
	for (i, a) in names.iter().enumerate() {
		for b in &names[i + 1..] {
			mesh.connect(*a, *b);
		}
	}
}
