//! Topology listener that reports changes to the log.

use anyhow::Context;
use tracing::{debug, info};

use keelson_view::{TopologyEvent, TopologyEventKind, TopologyEventListener, TopologyView};

pub struct LoggingListener;

impl TopologyEventListener for LoggingListener {
    fn handle_topology_event(&self, event: &TopologyEvent) -> anyhow::Result<()> {
        if event.kind == TopologyEventKind::Changing {
            info!("topology changing");
            return Ok(());
        }
        let view = event
            .new_view
            .as_ref()
            .with_context(|| format!("{:?} event without a view", event.kind))?;
        info!(
            kind = ?event.kind,
            instances = view.instances().count(),
            topology = %describe(view),
            "topology updated"
        );
        for instance in view.instances() {
            debug!(
                sling_id = %instance.sling_id(),
                cluster_id = %instance.cluster_id(),
                server_info = %instance.server_info(),
                leader = instance.is_leader(),
                properties = instance.properties().len(),
                "instance"
            );
        }
        Ok(())
    }
}

/// One-line summary: `cluster[leader,member,…]` per cluster, the local
/// instance marked with `*`.
pub fn describe(view: &TopologyView) -> String {
    view.cluster_views()
        .iter()
        .map(|cluster| {
            let members: Vec<String> = cluster
                .instances()
                .iter()
                .map(|i| {
                    if i.is_local() {
                        format!("{}*", i.sling_id())
                    } else {
                        i.sling_id().to_string()
                    }
                })
                .collect();
            format!("{}[{}]", cluster.id(), members.join(","))
        })
        .collect::<Vec<_>>()
        .join(" ")
}
