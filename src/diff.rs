//! Manifest comparison.
//!
//! [`plan`] classifies every path of `local ∪ remote` into exactly one bucket
//! of a [`SyncPlan`]. The optional baseline is the manifest both sides agreed
//! on after the last successful pass; it is what lets a deletion on one side be
//! told apart from a creation on the other. Without a baseline nothing is
//! ever deleted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::hash::Digest;
use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delta {
    ToUpload,
    ToDownload,
    ToDeleteLocal,
    ToDeleteRemote,
}

impl Delta {
    pub fn label(&self) -> &'static str {
        match self {
            Delta::ToUpload => "upload",
            Delta::ToDownload => "download",
            Delta::ToDeleteLocal => "local delete",
            Delta::ToDeleteRemote => "remote delete",
        }
    }
}

/// Which side wins when both changed the same path since the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    RemoteWins,
    LocalWins,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub upload: Vec<String>,
    pub download: Vec<String>,
    pub delete_local: Vec<String>,
    pub delete_remote: Vec<String>,
    pub unchanged: Vec<String>,
}

impl SyncPlan {
    /// Number of paths that need a transfer or delete.
    pub fn action_count(&self) -> usize {
        self.upload.len() + self.download.len() + self.delete_local.len() + self.delete_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.action_count() == 0
    }

    pub fn classify(&self, path: &str) -> Option<Delta> {
        let has = |list: &Vec<String>| list.iter().any(|p| p == path);
        if has(&self.upload) {
            Some(Delta::ToUpload)
        } else if has(&self.download) {
            Some(Delta::ToDownload)
        } else if has(&self.delete_local) {
            Some(Delta::ToDeleteLocal)
        } else if has(&self.delete_remote) {
            Some(Delta::ToDeleteRemote)
        } else {
            None
        }
    }

    fn push(&mut self, path: &str, delta: Option<Delta>) {
        let list = match delta {
            Some(Delta::ToUpload) => &mut self.upload,
            Some(Delta::ToDownload) => &mut self.download,
            Some(Delta::ToDeleteLocal) => &mut self.delete_local,
            Some(Delta::ToDeleteRemote) => &mut self.delete_remote,
            None => &mut self.unchanged,
        };
        list.push(path.to_string());
    }
}

/// Compare two manifests and decide what each path needs.
pub fn plan(
    local: &Manifest,
    remote: &Manifest,
    baseline: Option<&Manifest>,
    policy: ConflictPolicy,
) -> SyncPlan {
    let paths: BTreeSet<&str> = local.paths().chain(remote.paths()).collect();
    let mut plan = SyncPlan::default();

    for path in paths {
        let base = baseline.and_then(|b| b.get(path));
        let delta = classify(local.get(path), remote.get(path), base, policy);
        plan.push(path, delta);
    }

    plan
}

fn classify(
    local: Option<&Digest>,
    remote: Option<&Digest>,
    base: Option<&Digest>,
    policy: ConflictPolicy,
) -> Option<Delta> {
    match (local, remote) {
        (Some(l), None) if base == Some(l) => Some(Delta::ToDeleteLocal),
        (Some(_), None) => Some(Delta::ToUpload),
        (None, Some(r)) if base == Some(r) => Some(Delta::ToDeleteRemote),
        (None, Some(_)) => Some(Delta::ToDownload),
        (Some(l), Some(r)) if l == r => None,
        (Some(l), Some(_)) if base == Some(l) => Some(Delta::ToDownload),
        (Some(_), Some(r)) if base == Some(r) => Some(Delta::ToUpload),
        (Some(_), Some(_)) => match policy {
            ConflictPolicy::RemoteWins => Some(Delta::ToDownload),
            ConflictPolicy::LocalWins => Some(Delta::ToUpload),
        },
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), Digest::of_bytes(content.as_bytes())))
            .collect()
    }

    #[test]
    fn test_first_sync_never_deletes() {
        let local = manifest(&[("a.txt", "hi"), ("same", "s")]);
        let remote = manifest(&[("b.txt", "x"), ("same", "s")]);

        let plan = plan(&local, &remote, None, ConflictPolicy::default());
        assert_eq!(plan.upload, vec!["a.txt"]);
        assert_eq!(plan.download, vec!["b.txt"]);
        assert_eq!(plan.unchanged, vec!["same"]);
        assert!(plan.delete_local.is_empty());
        assert!(plan.delete_remote.is_empty());
    }

    #[test]
    fn test_conflict_resolves_to_one_transfer() {
        let local = manifest(&[("c.txt", "mine")]);
        let remote = manifest(&[("c.txt", "theirs")]);

        let remote_wins = plan(&local, &remote, None, ConflictPolicy::RemoteWins);
        assert_eq!(remote_wins.classify("c.txt"), Some(Delta::ToDownload));
        assert_eq!(remote_wins.action_count(), 1);

        let local_wins = plan(&local, &remote, None, ConflictPolicy::LocalWins);
        assert_eq!(local_wins.classify("c.txt"), Some(Delta::ToUpload));
        assert_eq!(local_wins.action_count(), 1);
    }

    #[test]
    fn test_baseline_identifies_changed_side() {
        let baseline = manifest(&[("doc", "v1")]);

        // Only local moved on: push even though the policy favours the remote.
        let plan_up = plan(&manifest(&[("doc", "v2")]), &baseline, Some(&baseline), ConflictPolicy::RemoteWins);
        assert_eq!(plan_up.classify("doc"), Some(Delta::ToUpload));

        // Only remote moved on: pull even though the policy favours local.
        let plan_down = plan(&baseline, &manifest(&[("doc", "v2")]), Some(&baseline), ConflictPolicy::LocalWins);
        assert_eq!(plan_down.classify("doc"), Some(Delta::ToDownload));
    }

    #[test]
    fn test_baseline_propagates_deletions() {
        let baseline = manifest(&[("gone_here", "1"), ("gone_there", "2"), ("kept", "3")]);
        let local = manifest(&[("gone_there", "2"), ("kept", "3")]);
        let remote = manifest(&[("gone_here", "1"), ("kept", "3")]);

        let plan = plan(&local, &remote, Some(&baseline), ConflictPolicy::default());
        assert_eq!(plan.delete_remote, vec!["gone_here"]);
        assert_eq!(plan.delete_local, vec!["gone_there"]);
        assert_eq!(plan.unchanged, vec!["kept"]);
    }

    #[test]
    fn test_modification_beats_deletion() {
        let baseline = manifest(&[("f", "v1")]);
        let local = Manifest::new();
        let remote = manifest(&[("f", "v2")]);

        let plan = plan(&local, &remote, Some(&baseline), ConflictPolicy::default());
        assert_eq!(plan.classify("f"), Some(Delta::ToDownload));
    }

    #[test]
    fn test_identical_manifests_plan_nothing() {
        let both = manifest(&[("a", "1"), ("b/c", "2")]);
        let plan = plan(&both, &both, Some(&both), ConflictPolicy::default());
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged.len(), 2);
    }

    fn arb_manifest() -> impl Strategy<Value = Manifest> {
        prop::collection::btree_map("[a-e]{1,2}", 0u8..3, 0..12).prop_map(|m: BTreeMap<String, u8>| {
            m.into_iter().map(|(path, v)| (path, Digest::of_bytes(&[v]))).collect()
        })
    }

    proptest! {
        #[test]
        fn prop_plan_partitions_union(
            local in arb_manifest(),
            remote in arb_manifest(),
            baseline in prop::option::of(arb_manifest()),
            local_wins in any::<bool>(),
        ) {
            let policy = if local_wins { ConflictPolicy::LocalWins } else { ConflictPolicy::RemoteWins };
            let plan = plan(&local, &remote, baseline.as_ref(), policy);

            let mut seen = BTreeSet::new();
            for list in [&plan.upload, &plan.download, &plan.delete_local, &plan.delete_remote, &plan.unchanged] {
                for path in list {
                    prop_assert!(seen.insert(path.clone()), "{} classified twice", path);
                }
            }

            let union: BTreeSet<String> = local.paths().chain(remote.paths()).map(str::to_string).collect();
            prop_assert_eq!(seen, union);

            for path in &plan.unchanged {
                prop_assert_eq!(local.get(path), remote.get(path));
            }
            for path in plan.upload.iter().chain(&plan.delete_local) {
                prop_assert!(local.contains(path));
            }
            for path in plan.download.iter().chain(&plan.delete_remote) {
                prop_assert!(remote.contains(path));
            }
        }
    }
}
