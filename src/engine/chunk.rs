use std::ops::Range;

use crate::engine::TaskBatch;

/// Splits a batch's contexts into the ranges handed to each `execute` call.
///
/// The batch size comes from the scheduling preferences of the first context.
/// Sequence batches always form a single chunk.
pub(crate) fn layout(batch: &TaskBatch) -> Vec<Range<usize>> {
    let len = batch.contexts.len();
    let Some(first) = batch.contexts.first() else {
        return Vec::new();
    };

    if batch.is_sequence() {
        return vec![0..len];
    }

    let size = batch.node.dispatcher_config(first).batch_size.max(1);

    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}
