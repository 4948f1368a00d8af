//! # Prometheus Metrics
//!
//! Node metrics, scraped at `/metrics` on the metrics port. Everything lives
//! in a dedicated [`prometheus::Registry`] prefixed with `arbor_`.
//!
//! Gauges are refreshed from the chain service whenever a [`ChainEvent`]
//! arrives, so they always describe the tree as it was after the last
//! import or finalization.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use arbor_protocol::network::{ChainEvent, ChainService};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Blocks linked into the tree since startup.
    pub blocks_imported_total: IntCounter,
    /// Times the best block moved.
    pub best_block_changes_total: IntCounter,
    /// Nodes removed from the tree by finalization.
    pub blocks_pruned_total: IntCounter,
    pub tree_nodes: IntGauge,
    pub tree_leaves: IntGauge,
    pub best_block_number: IntGauge,
    pub finalized_block_number: IntGauge,
    /// Blocks buffered while waiting for their parent.
    pub orphan_blocks: IntGauge,
}

impl NodeMetrics {
    /// Create and register all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("arbor".into()), None)?;

        let blocks_imported_total =
            IntCounter::new("blocks_imported_total", "Blocks linked into the block tree")?;
        let best_block_changes_total =
            IntCounter::new("best_block_changes_total", "Number of best block changes")?;
        let blocks_pruned_total =
            IntCounter::new("blocks_pruned_total", "Blocks pruned by finalization")?;
        let tree_nodes = IntGauge::new("tree_nodes", "Nodes currently in the block tree")?;
        let tree_leaves = IntGauge::new("tree_leaves", "Current chain tips")?;
        let best_block_number = IntGauge::new("best_block_number", "Number of the best block")?;
        let finalized_block_number =
            IntGauge::new("finalized_block_number", "Number of the tree root")?;
        let orphan_blocks = IntGauge::new("orphan_blocks", "Blocks waiting for their parent")?;

        registry.register(Box::new(blocks_imported_total.clone()))?;
        registry.register(Box::new(best_block_changes_total.clone()))?;
        registry.register(Box::new(blocks_pruned_total.clone()))?;
        registry.register(Box::new(tree_nodes.clone()))?;
        registry.register(Box::new(tree_leaves.clone()))?;
        registry.register(Box::new(best_block_number.clone()))?;
        registry.register(Box::new(finalized_block_number.clone()))?;
        registry.register(Box::new(orphan_blocks.clone()))?;

        Ok(Self {
            registry,
            blocks_imported_total,
            best_block_changes_total,
            blocks_pruned_total,
            tree_nodes,
            tree_leaves,
            best_block_number,
            finalized_block_number,
            orphan_blocks,
        })
    }

    /// Account for one event, then resample the gauges from `service`.
    pub fn record(&self, event: &ChainEvent, service: &ChainService) {
        match event {
            ChainEvent::BlockImported { .. } => self.blocks_imported_total.inc(),
            ChainEvent::BestBlockChanged { .. } => self.best_block_changes_total.inc(),
            ChainEvent::Finalized { pruned, .. } => self.blocks_pruned_total.inc_by(*pruned as u64),
        }
        self.sample(service);
    }

    pub fn sample(&self, service: &ChainService) {
        let snapshot = service.tree().snapshot();
        self.tree_nodes.set(snapshot.node_count as i64);
        self.tree_leaves.set(snapshot.leaves.len() as i64);
        self.best_block_number.set(snapshot.best.number as i64);
        self.finalized_block_number.set(snapshot.root.number as i64);
        self.orphan_blocks.set(service.orphan_count() as i64);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler for `/metrics`.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
