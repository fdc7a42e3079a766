use serde::Serialize;

/// Counters collected while tracing relationships.
///
/// Truncations and skips are expected outcomes of bounded tracing, so they are counted here
/// instead of being reported as errors.
#[derive(Clone, Debug, Default, Serialize, Eq, PartialEq)]
pub struct TraceStats {
    pub(crate) node_visits: usize,
    pub(crate) heuristic_edges: usize,
    pub(crate) exact_edges: usize,
    pub(crate) rejected_by_date: usize,
    pub(crate) truncated_branches: usize,
    pub(crate) cycles_blocked: usize,
    pub(crate) missing_raw_data: usize,
}

impl TraceStats {
    pub fn inc_visits(&mut self) {
        self.node_visits += 1;
    }

    pub fn inc_heuristic_edges(&mut self) {
        self.heuristic_edges += 1;
    }

    pub fn inc_exact_edges(&mut self) {
        self.exact_edges += 1;
    }

    pub fn inc_rejected_by_date(&mut self) {
        self.rejected_by_date += 1;
    }

    pub fn inc_truncated(&mut self) {
        self.truncated_branches += 1;
    }

    pub fn inc_cycles_blocked(&mut self) {
        self.cycles_blocked += 1;
    }

    pub fn inc_missing_raw_data(&mut self) {
        self.missing_raw_data += 1;
    }

    pub fn node_visits(&self) -> usize {
        self.node_visits
    }

    pub fn rejected_by_date(&self) -> usize {
        self.rejected_by_date
    }

    pub fn truncated_branches(&self) -> usize {
        self.truncated_branches
    }

    pub fn cycles_blocked(&self) -> usize {
        self.cycles_blocked
    }

    pub fn missing_raw_data(&self) -> usize {
        self.missing_raw_data
    }

    pub fn pretty_print(&self) {
        println!("{self:#?}");
        println!();
    }
}
