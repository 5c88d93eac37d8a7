//! Task staging between the orchestrator and the per-tick dispatch loop.

use std::collections::VecDeque;

use tessera_types::Task;

/// FIFO holding tasks the orchestrator has released but the platform has not
/// yet accepted for execution this tick.
#[derive(Debug, Default)]
pub struct TaskStager {
    queue: VecDeque<Task>,
}

impl TaskStager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.queue.pop_front()
    }

    /// Put a deferred task back; order among deferred tasks is preserved by
    /// the caller re-staging them front-first.
    pub fn push_front(&mut self, task: Task) {
        self.queue.push_front(task);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// In-order issue stage. Accepted tasks leave in arrival order on the next
/// scheduler tick; the separate stage exists so dispatch-order guarantees
/// survive the deferral shuffling above it.
#[derive(Debug, Default)]
pub struct FifoScheduler {
    accepted: VecDeque<Task>,
    ticks: u64,
}

impl FifoScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: Task) {
        self.accepted.push_back(task);
    }

    /// One scheduler tick: everything accepted this cycle drains, in order.
    pub fn tick(&mut self) -> Vec<Task> {
        self.ticks += 1;
        self.accepted.drain(..).collect()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn backlog(&self) -> usize {
        self.accepted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{CommandKind, NodePayload, OpType, Target, Task};

    fn task(seq: u64) -> Task {
        Task {
            node_id: seq,
            seq_id: seq,
            target: Target::Digital,
            op_type: OpType::Compute,
            opcode: CommandKind::PeGemm,
            exec_domain: None,
            latency: 1,
            enqueue_cycle: 0,
            src: (-1, -1),
            dst: (-1, -1),
            host_addr: 0,
            buffer_id: -1,
            sub_op: 0,
            request_bytes: 0,
            response_bytes: 0,
            payload: NodePayload::Empty,
            metadata: Default::default(),
        }
    }

    #[test]
    fn scheduler_preserves_arrival_order() {
        let mut sched = FifoScheduler::new();
        for i in 0..4 {
            sched.enqueue(task(i));
        }
        let order: Vec<u64> = sched.tick().into_iter().map(|t| t.seq_id).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(sched.backlog(), 0);
    }

    #[test]
    fn stager_refronts_deferred_tasks() {
        let mut stager = TaskStager::new();
        stager.push(task(0));
        stager.push(task(1));
        let t0 = stager.pop().unwrap();
        stager.push_front(t0);
        assert_eq!(stager.pop().unwrap().seq_id, 0);
        assert_eq!(stager.pop().unwrap().seq_id, 1);
    }
}
