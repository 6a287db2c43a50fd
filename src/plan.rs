//! # Shard partition planning.
//!
//! Pure, deterministic assignment of shard ids to workers and of worker
//! groups to clusters. No I/O and no state: re-running [`build_plan`] with
//! unchanged inputs always yields an identical assignment, which rolling
//! reload ordering depends on.
//!
//! A cluster's workers are described by a [`WorkerLayout`]:
//! - [`WorkerLayout::Explicit`] — hand-written workers with shard lists or
//!   contiguous ranges;
//! - [`WorkerLayout::Count`] — an even split of the cluster range across N
//!   workers (the first `T mod N` workers receive `⌈T/N⌉` shards, the rest
//!   `⌊T/N⌋`, ascending and contiguous);
//! - [`WorkerLayout::PerShard`] — one worker per shard, single-cluster only.
//!
//! Every inconsistency is a fatal [`PlanError`]; no partial plan is produced.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// Logical partition of the real-time connection, identified by a small integer.
pub type ShardId = u32;

/// Stable worker identifier, unique within a cluster.
pub type WorkerId = String;

/// Inclusive range of shard ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub start: ShardId,
    pub end: ShardId,
}

impl ShardRange {
    pub fn new(start: ShardId, end: ShardId) -> Result<Self, PlanError> {
        if end < start {
            return Err(PlanError::ReversedRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of shards in the range; never zero since the range is inclusive.
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        shard >= self.start && shard <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = ShardId> {
        self.start..=self.end
    }
}

/// Shard assignment of a single explicitly configured worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardSelection {
    /// Explicit shard ids; deduplicated and sorted during planning.
    List(Vec<ShardId>),
    /// Contiguous inclusive range; `end < start` is a fatal error.
    Range { start: ShardId, end: ShardId },
}

/// One hand-written worker entry inside [`WorkerLayout::Explicit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitWorker {
    pub id: WorkerId,
    pub shards: ShardSelection,
}

/// How a cluster's shard range is divided into workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLayout {
    /// Hand-written worker list.
    Explicit(Vec<ExplicitWorker>),
    /// Even split across N workers with derived ids.
    Count(u32),
    /// One worker per shard, id derived from the shard id.
    PerShard,
}

/// Operator-supplied description of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: String,
    pub first_shard_id: ShardId,
    pub last_shard_id: ShardId,
    pub workers: WorkerLayout,
}

/// Validated shard assignment of one worker: id plus a sorted, deduplicated
/// shard list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: WorkerId,
    pub shards: Vec<ShardId>,
}

impl WorkerConfig {
    /// The worker's lowest-owned shard, the sort key for rolling restarts.
    pub fn lowest_shard(&self) -> ShardId {
        self.shards.first().copied().unwrap_or(ShardId::MAX)
    }
}

/// Validated output of the planner for the active cluster.
///
/// Invariant: the union of `workers[].shards` equals the inclusive cluster
/// range with no gaps and no duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPlan {
    pub id: String,
    pub range: ShardRange,
    pub workers: Vec<WorkerConfig>,
}

impl ClusterPlan {
    pub fn worker(&self, id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Workers in ascending order of lowest-owned shard id.
    pub fn workers_by_lowest_shard(&self) -> Vec<WorkerConfig> {
        let mut ordered = self.workers.clone();
        ordered.sort_by_key(WorkerConfig::lowest_shard);
        ordered
    }
}

/// Mapping of shard id to owning worker id, rebuilt whenever the worker set
/// changes (a full reload; rolling reloads keep ownership untouched).
#[derive(Debug, Clone, Default)]
pub struct ShardOwnership {
    map: HashMap<ShardId, WorkerId>,
}

impl ShardOwnership {
    pub fn from_workers(workers: &[WorkerConfig]) -> Self {
        let mut map = HashMap::new();
        for worker in workers {
            for &shard in &worker.shards {
                map.insert(shard, worker.id.clone());
            }
        }
        Self { map }
    }

    pub fn owner_of(&self, shard: ShardId) -> Option<&str> {
        self.map.get(&shard).map(String::as_str)
    }

    pub fn shard_count(&self) -> usize {
        self.map.len()
    }
}

/// Builds the validated partition plan for the active cluster.
///
/// Cluster selection: `active_cluster` by id; an unknown id falls back to the
/// first configured cluster; with no clusters configured a synthetic default
/// cluster spanning all `total_shards` is used.
pub fn build_plan(
    total_shards: u32,
    clusters: &[ClusterSpec],
    active_cluster: Option<&str>,
) -> Result<ClusterPlan, PlanError> {
    if total_shards == 0 {
        return Err(PlanError::ZeroShards);
    }
    if clusters.len() > 1 {
        let per_shard = clusters
            .iter()
            .any(|c| matches!(c.workers, WorkerLayout::PerShard));
        if per_shard {
            return Err(PlanError::AutoNeedsSingleCluster {
                count: clusters.len(),
            });
        }
    }

    let synthetic;
    let spec = match select_cluster(clusters, active_cluster) {
        Some(spec) => spec,
        None => {
            synthetic = ClusterSpec {
                id: "default".to_string(),
                first_shard_id: 0,
                last_shard_id: total_shards - 1,
                workers: WorkerLayout::Count(1),
            };
            &synthetic
        }
    };

    let range = ShardRange::new(spec.first_shard_id, spec.last_shard_id)?;
    let workers = match &spec.workers {
        WorkerLayout::Explicit(entries) => explicit_workers(&spec.id, range, entries)?,
        WorkerLayout::Count(n) => even_split(&spec.id, range, *n)?,
        WorkerLayout::PerShard => per_shard_workers(range),
    };
    validate_coverage(&spec.id, range, &workers)?;

    Ok(ClusterPlan {
        id: spec.id.clone(),
        range,
        workers,
    })
}

fn select_cluster<'a>(
    clusters: &'a [ClusterSpec],
    active: Option<&str>,
) -> Option<&'a ClusterSpec> {
    if clusters.is_empty() {
        return None;
    }
    active
        .and_then(|id| clusters.iter().find(|c| c.id == id))
        .or_else(|| clusters.first())
}

fn explicit_workers(
    cluster: &str,
    range: ShardRange,
    entries: &[ExplicitWorker],
) -> Result<Vec<WorkerConfig>, PlanError> {
    let mut workers = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut shards = match &entry.shards {
            ShardSelection::List(ids) => ids.clone(),
            ShardSelection::Range { start, end } => ShardRange::new(*start, *end)?.iter().collect(),
        };
        shards.sort_unstable();
        shards.dedup();
        if shards.is_empty() {
            return Err(PlanError::EmptyWorker {
                cluster: cluster.to_string(),
                id: entry.id.clone(),
            });
        }
        for &shard in &shards {
            if !range.contains(shard) {
                return Err(PlanError::ShardOutOfRange {
                    cluster: cluster.to_string(),
                    shard,
                    start: range.start,
                    end: range.end,
                });
            }
        }
        workers.push(WorkerConfig {
            id: entry.id.clone(),
            shards,
        });
    }
    Ok(workers)
}

fn even_split(cluster: &str, range: ShardRange, n: u32) -> Result<Vec<WorkerConfig>, PlanError> {
    if n == 0 {
        return Err(PlanError::ZeroWorkers {
            cluster: cluster.to_string(),
        });
    }
    let total = range.len();
    if n > total {
        return Err(PlanError::TooManyWorkers {
            cluster: cluster.to_string(),
            workers: n,
            shards: total,
        });
    }

    let base = total / n;
    let remainder = total % n;
    let mut workers = Vec::with_capacity(n as usize);
    let mut next = range.start;
    for index in 0..n {
        let size = if index < remainder { base + 1 } else { base };
        let shards: Vec<ShardId> = (next..next + size).collect();
        next += size;
        workers.push(WorkerConfig {
            id: format!("w{index}"),
            shards,
        });
    }
    Ok(workers)
}

fn per_shard_workers(range: ShardRange) -> Vec<WorkerConfig> {
    range
        .iter()
        .map(|shard| WorkerConfig {
            id: format!("w{shard}"),
            shards: vec![shard],
        })
        .collect()
}

fn validate_coverage(
    cluster: &str,
    range: ShardRange,
    workers: &[WorkerConfig],
) -> Result<(), PlanError> {
    let mut ids = HashSet::new();
    let mut seen = HashSet::new();
    for worker in workers {
        if !ids.insert(worker.id.as_str()) {
            return Err(PlanError::DuplicateWorkerId {
                cluster: cluster.to_string(),
                id: worker.id.clone(),
            });
        }
        for &shard in &worker.shards {
            if !seen.insert(shard) {
                return Err(PlanError::DuplicateShard {
                    cluster: cluster.to_string(),
                    shard,
                });
            }
        }
    }
    for shard in range.iter() {
        if !seen.contains(&shard) {
            return Err(PlanError::UnassignedShard {
                cluster: cluster.to_string(),
                shard,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_cluster(id: &str, first: u32, last: u32, n: u32) -> ClusterSpec {
        ClusterSpec {
            id: id.to_string(),
            first_shard_id: first,
            last_shard_id: last,
            workers: WorkerLayout::Count(n),
        }
    }

    #[test]
    fn even_split_sizes_and_order() {
        let plan = build_plan(10, &[count_cluster("main", 0, 9, 3)], None).unwrap();
        let sizes: Vec<usize> = plan.workers.iter().map(|w| w.shards.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(plan.workers[0].shards, vec![0, 1, 2, 3]);
        assert_eq!(plan.workers[1].shards, vec![4, 5, 6]);
        assert_eq!(plan.workers[2].shards, vec![7, 8, 9]);
    }

    #[test]
    fn even_split_assigns_every_shard_exactly_once() {
        for (total, n) in [(1u32, 1u32), (7, 3), (16, 4), (5, 5), (100, 7)] {
            let plan = build_plan(total, &[count_cluster("c", 0, total - 1, n)], None).unwrap();
            let mut seen = HashSet::new();
            for w in &plan.workers {
                for &s in &w.shards {
                    assert!(seen.insert(s), "shard {s} assigned twice");
                }
            }
            assert_eq!(seen.len(), total as usize);
        }
    }

    #[test]
    fn planner_is_deterministic() {
        let clusters = [count_cluster("main", 0, 31, 5)];
        let a = build_plan(32, &clusters, None).unwrap();
        let b = build_plan(32, &clusters, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reversed_range_is_rejected() {
        let err = build_plan(10, &[count_cluster("main", 9, 3, 2)], None).unwrap_err();
        assert_eq!(err, PlanError::ReversedRange { start: 9, end: 3 });
    }

    #[test]
    fn reversed_explicit_worker_range_is_rejected() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 3,
            workers: WorkerLayout::Explicit(vec![ExplicitWorker {
                id: "a".into(),
                shards: ShardSelection::Range { start: 3, end: 0 },
            }]),
        };
        let err = build_plan(4, &[spec], None).unwrap_err();
        assert!(matches!(err, PlanError::ReversedRange { .. }));
    }

    #[test]
    fn explicit_lists_are_sorted_and_deduplicated() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 3,
            workers: WorkerLayout::Explicit(vec![
                ExplicitWorker {
                    id: "a".into(),
                    shards: ShardSelection::List(vec![1, 0, 1]),
                },
                ExplicitWorker {
                    id: "b".into(),
                    shards: ShardSelection::List(vec![3, 2]),
                },
            ]),
        };
        let plan = build_plan(4, &[spec], None).unwrap();
        assert_eq!(plan.workers[0].shards, vec![0, 1]);
        assert_eq!(plan.workers[1].shards, vec![2, 3]);
    }

    #[test]
    fn duplicate_assignment_across_workers_is_rejected() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 1,
            workers: WorkerLayout::Explicit(vec![
                ExplicitWorker {
                    id: "a".into(),
                    shards: ShardSelection::List(vec![0, 1]),
                },
                ExplicitWorker {
                    id: "b".into(),
                    shards: ShardSelection::List(vec![1]),
                },
            ]),
        };
        let err = build_plan(2, &[spec], None).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateShard { shard: 1, .. }));
    }

    #[test]
    fn coverage_gap_is_rejected() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 2,
            workers: WorkerLayout::Explicit(vec![ExplicitWorker {
                id: "a".into(),
                shards: ShardSelection::List(vec![0, 2]),
            }]),
        };
        let err = build_plan(3, &[spec], None).unwrap_err();
        assert!(matches!(err, PlanError::UnassignedShard { shard: 1, .. }));
    }

    #[test]
    fn duplicate_worker_ids_are_rejected() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 1,
            workers: WorkerLayout::Explicit(vec![
                ExplicitWorker {
                    id: "a".into(),
                    shards: ShardSelection::List(vec![0]),
                },
                ExplicitWorker {
                    id: "a".into(),
                    shards: ShardSelection::List(vec![1]),
                },
            ]),
        };
        let err = build_plan(2, &[spec], None).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateWorkerId { .. }));
    }

    #[test]
    fn per_shard_layout_derives_worker_ids() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 2,
            workers: WorkerLayout::PerShard,
        };
        let plan = build_plan(3, &[spec], None).unwrap();
        let ids: Vec<&str> = plan.workers.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["w0", "w1", "w2"]);
        assert!(plan.workers.iter().all(|w| w.shards.len() == 1));
    }

    #[test]
    fn per_shard_layout_needs_single_cluster() {
        let a = ClusterSpec {
            id: "a".into(),
            first_shard_id: 0,
            last_shard_id: 1,
            workers: WorkerLayout::PerShard,
        };
        let b = count_cluster("b", 2, 3, 1);
        let err = build_plan(4, &[a, b], None).unwrap_err();
        assert_eq!(err, PlanError::AutoNeedsSingleCluster { count: 2 });
    }

    #[test]
    fn cluster_selection_by_id_with_first_as_fallback() {
        let clusters = [count_cluster("a", 0, 3, 2), count_cluster("b", 4, 7, 2)];
        let plan = build_plan(8, &clusters, Some("b")).unwrap();
        assert_eq!(plan.id, "b");
        assert_eq!(plan.range, ShardRange { start: 4, end: 7 });

        let plan = build_plan(8, &clusters, Some("missing")).unwrap();
        assert_eq!(plan.id, "a");

        let plan = build_plan(8, &clusters, None).unwrap();
        assert_eq!(plan.id, "a");
    }

    #[test]
    fn synthetic_default_cluster_spans_all_shards() {
        let plan = build_plan(6, &[], None).unwrap();
        assert_eq!(plan.id, "default");
        assert_eq!(plan.range, ShardRange { start: 0, end: 5 });
        assert_eq!(plan.workers.len(), 1);
        assert_eq!(plan.workers[0].shards, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn zero_and_oversplit_worker_counts_are_rejected() {
        let err = build_plan(4, &[count_cluster("c", 0, 3, 0)], None).unwrap_err();
        assert!(matches!(err, PlanError::ZeroWorkers { .. }));

        let err = build_plan(2, &[count_cluster("c", 0, 1, 3)], None).unwrap_err();
        assert!(matches!(err, PlanError::TooManyWorkers { .. }));
    }

    #[test]
    fn ownership_maps_every_shard_to_its_worker() {
        let plan = build_plan(6, &[count_cluster("main", 0, 5, 2)], None).unwrap();
        let ownership = ShardOwnership::from_workers(&plan.workers);
        assert_eq!(ownership.shard_count(), 6);
        assert_eq!(ownership.owner_of(0), Some("w0"));
        assert_eq!(ownership.owner_of(2), Some("w0"));
        assert_eq!(ownership.owner_of(3), Some("w1"));
        assert_eq!(ownership.owner_of(9), None);
    }

    #[test]
    fn workers_by_lowest_shard_sorts_for_rolling_restart() {
        let spec = ClusterSpec {
            id: "main".into(),
            first_shard_id: 0,
            last_shard_id: 5,
            workers: WorkerLayout::Explicit(vec![
                ExplicitWorker {
                    id: "high".into(),
                    shards: ShardSelection::Range { start: 4, end: 5 },
                },
                ExplicitWorker {
                    id: "low".into(),
                    shards: ShardSelection::Range { start: 0, end: 1 },
                },
                ExplicitWorker {
                    id: "mid".into(),
                    shards: ShardSelection::Range { start: 2, end: 3 },
                },
            ]),
        };
        let plan = build_plan(6, &[spec], None).unwrap();
        let ordered = plan.workers_by_lowest_shard();
        let order: Vec<&str> = ordered.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(order, vec!["low", "mid", "high"]);
    }
}
