//! Round scheduler: the FIFO of member UUIDs probed one per
//! `round_tick`, refilled by a fresh Fisher–Yates shuffle whenever it
//! runs dry (SPEC_FULL.md §4.2).

use crate::table::MemberTable;
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Default)]
pub struct RoundScheduler {
    queue: VecDeque<Uuid>,
}

impl RoundScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Reshuffles every non-self member into a fresh round order. A
    /// no-op on a cluster of size 1 (no non-self members to probe).
    pub fn new_round(&mut self, table: &MemberTable) {
        self.queue = table.shuffled_round_queue();
    }

    /// Pops the head of the round queue, refilling first if empty.
    /// Returns `None` only when the table has no non-self members.
    pub fn next(&mut self, table: &MemberTable) -> Option<Uuid> {
        if self.queue.is_empty() {
            self.new_round(table);
        }
        self.queue.pop_front()
    }
}
