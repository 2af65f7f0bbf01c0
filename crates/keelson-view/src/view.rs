//! Topology view model.
//!
//! Views are immutable apart from the `current` flag, which the view
//! manager clears when a view is superseded.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use keelson_core::{AnnounceData, Announces, Properties};

use crate::error::{ViewError, ViewResult};

/// Cluster id of the placeholder view used before the protocol runs.
pub const UNDEFINED_CLUSTER_ID: &str = "undefined";

/// One instance as seen in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    sling_id: String,
    cluster_id: String,
    server_info: String,
    leader: bool,
    local: bool,
    properties: Properties,
}

impl InstanceDescription {
    /// Unique instance identifier.
    pub fn sling_id(&self) -> &str {
        &self.sling_id
    }

    /// Cluster this instance belongs to.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Endpoint the instance announced, opaque to discovery.
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Whether this instance holds the oldest announce of its cluster.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Whether this is the instance that built the view.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Properties last published by the instance.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// A single property value.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Instances sharing a cluster id, oldest announce first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    id: String,
    instances: Vec<InstanceDescription>,
}

impl ClusterView {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instances(&self) -> &[InstanceDescription] {
        &self.instances
    }

    /// The instance with the lowest announce key name.
    pub fn leader(&self) -> &InstanceDescription {
        // Clusters are only built with at least one instance.
        &self.instances[0]
    }
}

/// Snapshot of every known cluster and instance.
#[derive(Debug)]
pub struct TopologyView {
    announces: Announces,
    clusters: Vec<ClusterView>,
    local_sling_id: String,
    current: AtomicBool,
}

impl TopologyView {
    /// Build a view from a merged announce snapshot.
    ///
    /// Every instance gets the properties stored under its sling id in
    /// `properties` (none if absent). Fails when `announces` is empty or
    /// does not contain exactly one entry for `local_sling_id`.
    pub fn build(
        announces: Announces,
        properties: &HashMap<String, Properties>,
        local_sling_id: &str,
        current: bool,
    ) -> ViewResult<Self> {
        if announces.is_empty() {
            return Err(ViewError::NoAnnounces);
        }
        let local_count = announces
            .iter()
            .filter(|a| a.sling_id() == local_sling_id)
            .count();
        match local_count {
            0 => return Err(ViewError::NoLocalInstance(local_sling_id.to_string())),
            1 => {}
            count => return Err(ViewError::MultipleLocalInstances { count }),
        }

        let mut clusters: Vec<ClusterView> = Vec::new();
        for announce in &announces {
            let data = announce.data();
            let index = match clusters.iter().position(|c| c.id == data.cluster_id) {
                Some(index) => index,
                None => {
                    clusters.push(ClusterView {
                        id: data.cluster_id.clone(),
                        instances: Vec::new(),
                    });
                    clusters.len() - 1
                }
            };
            let cluster = &mut clusters[index];
            let leader = cluster.instances.is_empty();
            cluster.instances.push(InstanceDescription {
                sling_id: data.sling_id.clone(),
                cluster_id: data.cluster_id.clone(),
                server_info: data.server_info.clone(),
                leader,
                local: data.sling_id == local_sling_id,
                properties: properties.get(&data.sling_id).cloned().unwrap_or_default(),
            });
        }

        Ok(Self {
            announces,
            clusters,
            local_sling_id: local_sling_id.to_string(),
            current: AtomicBool::new(current),
        })
    }

    /// Single-instance view of the local instance alone, never current.
    pub fn isolated(local: &AnnounceData, properties: Properties) -> Self {
        let instance = InstanceDescription {
            sling_id: local.sling_id.clone(),
            cluster_id: local.cluster_id.clone(),
            server_info: local.server_info.clone(),
            leader: true,
            local: true,
            properties,
        };
        Self {
            announces: Announces::default(),
            clusters: vec![ClusterView {
                id: local.cluster_id.clone(),
                instances: vec![instance],
            }],
            local_sling_id: local.sling_id.clone(),
            current: AtomicBool::new(false),
        }
    }

    /// Placeholder held before the first real view is computed.
    pub fn undefined(local_sling_id: &str) -> Self {
        let local = AnnounceData::new(local_sling_id, "", UNDEFINED_CLUSTER_ID, 0);
        Self::isolated(&local, Properties::new())
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire)
    }

    /// Mark the view as superseded. Returns whether it was current.
    pub fn mark_old(&self) -> bool {
        self.current.swap(false, Ordering::AcqRel)
    }

    pub fn announces(&self) -> &Announces {
        &self.announces
    }

    pub fn cluster_views(&self) -> &[ClusterView] {
        &self.clusters
    }

    pub fn cluster_view(&self, cluster_id: &str) -> Option<&ClusterView> {
        self.clusters.iter().find(|c| c.id == cluster_id)
    }

    pub fn cluster_ids(&self) -> BTreeSet<&str> {
        self.clusters.iter().map(|c| c.id.as_str()).collect()
    }

    /// Every instance, grouped by cluster in view order.
    pub fn instances(&self) -> impl Iterator<Item = &InstanceDescription> {
        self.clusters.iter().flat_map(|c| c.instances.iter())
    }

    pub fn instance(&self, sling_id: &str) -> Option<&InstanceDescription> {
        self.instances().find(|i| i.sling_id == sling_id)
    }

    pub fn local_instance(&self) -> &InstanceDescription {
        // Construction guarantees exactly one local instance.
        self.instances()
            .find(|i| i.local)
            .unwrap_or(&self.clusters[0].instances[0])
    }

    pub fn local_sling_id(&self) -> &str {
        &self.local_sling_id
    }

    /// Whether instances joined, left, moved cluster or changed leader.
    pub fn members_differ(&self, other: &TopologyView) -> bool {
        let members = |view: &TopologyView| {
            view.instances()
                .map(|i| (i.sling_id.clone(), i.cluster_id.clone(), i.server_info.clone(), i.leader))
                .collect::<Vec<_>>()
        };
        members(self) != members(other)
    }

    pub fn properties_differ(&self, other: &TopologyView) -> bool {
        let properties = |view: &TopologyView| {
            view.instances()
                .map(|i| (i.sling_id.clone(), i.properties.clone()))
                .collect::<HashMap<_, _>>()
        };
        properties(self) != properties(other)
    }

    pub fn cluster_ids_differ(&self, other: &TopologyView) -> bool {
        self.cluster_ids() != other.cluster_ids()
    }
}
