use crate::engine::{BatchId, TaskBatch};
use crate::error::CycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

struct Orderer<'a> {
    batches: &'a [TaskBatch],
    marks: Vec<Mark>,
    /// Owners of each batch not yet done.
    owners_left: Vec<usize>,
    order: Vec<BatchId>,
}

/// Depth-first post-order over the batch dependencies, rejecting cycles.
///
/// A post task is entered as soon as its last owner is done, so it follows that
/// owner directly unless it has pre tasks of its own still waiting. Roots are
/// walked first, then any batch they didn't reach in creation order.
pub(crate) fn linearize(batches: &[TaskBatch], roots: &[BatchId]) -> Result<Vec<BatchId>, CycleError> {
    let mut orderer = Orderer {
        batches,
        marks: vec![Mark::Unvisited; batches.len()],
        owners_left: batches.iter().map(|batch| batch.post_of.len()).collect(),
        order: Vec::with_capacity(batches.len()),
    };

    for &root in roots {
        orderer.visit(root)?;
    }

    for index in 0..batches.len() {
        orderer.visit(BatchId(index))?;
    }

    Ok(orderer.order)
}

impl Orderer<'_> {
    fn visit(&mut self, id: BatchId) -> Result<(), CycleError> {
        let batches = self.batches;

        match self.marks[id.0] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(CycleError::Dispatch {
                    node: batches[id.0].name(),
                });
            }
            Mark::Unvisited => {}
        }

        self.marks[id.0] = Mark::InProgress;

        let batch = &batches[id.0];
        for dependency in batch.dependencies() {
            self.visit(dependency)?;
        }

        self.marks[id.0] = Mark::Done;
        self.order.push(id);

        for &post in batch.post.iter() {
            self.owners_left[post.0] -= 1;
            if self.owners_left[post.0] == 0 && self.marks[post.0] == Mark::Unvisited {
                self.visit(post)?;
            }
        }

        Ok(())
    }
}
