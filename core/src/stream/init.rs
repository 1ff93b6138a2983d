use crossbeam_channel::bounded;
use tracing::trace;

use super::{BoxedStream, StreamContext};
use crate::error::{PlanError, PlanResult};
use crate::pool::WorkerPool;

/// Outcome of initializing the children of a boolean node.
pub enum Initialized {
    All(Vec<BoxedStream>),
    /// A child resolved `Absent` under a parent that cannot survive it.
    ShortCircuit(BoxedStream),
}

/// Resolves every `Initialized` child, one pool task per child, and waits
/// for all of them. Without a pool the children resolve on the caller.
/// Children come back in their original order.
pub fn initialize_children(
    children: Vec<BoxedStream>,
    pool: Option<&WorkerPool>,
    stop_on_absent: bool,
) -> PlanResult<Initialized> {
    let total = children.len();
    let mut slots: Vec<Option<BoxedStream>> = Vec::with_capacity(total);
    let (tx, rx) = bounded::<(usize, BoxedStream)>(total.max(1));
    let mut pending = 0;

    for (idx, mut child) in children.into_iter().enumerate() {
        match pool {
            Some(pool) if child.context() == StreamContext::Initialized => {
                let tx = tx.clone();
                pool.submit(move || {
                    child.initialize();
                    let _ = tx.send((idx, child));
                })?;
                pending += 1;
                slots.push(None);
            }
            _ => {
                child.initialize();
                slots.push(Some(child));
            }
        }
    }
    drop(tx);

    for _ in 0..pending {
        let (idx, child) = rx
            .recv()
            .map_err(|_| PlanError::Internal("child initialization was abandoned".into()))?;
        trace!(child = %child.context_debug(), "child initialized");
        slots[idx] = Some(child);
    }

    let mut ready = Vec::with_capacity(total);
    for (idx, slot) in slots.into_iter().enumerate() {
        let child = slot.ok_or_else(|| PlanError::Internal(format!("child {idx} never initialized")))?;
        ready.push(child);
    }

    if stop_on_absent
        && let Some(pos) = ready.iter().position(|c| c.context() == StreamContext::Absent)
    {
        return Ok(Initialized::ShortCircuit(ready.swap_remove(pos)));
    }
    Ok(Initialized::All(ready))
}
