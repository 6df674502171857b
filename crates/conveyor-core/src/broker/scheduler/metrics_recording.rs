use super::*;

impl Scheduler {
    /// Record depth and in-flight gauges for every known queue, so idle
    /// queues report zero rather than their last busy value.
    pub(super) fn record_gauges(&mut self) {
        let mut in_flight: HashMap<&str, u64> = HashMap::new();
        for lease in self.leased.values() {
            *in_flight.entry(lease.queue_id.as_str()).or_default() += 1;
        }

        for queue_id in self.queues.keys() {
            let depth = self.pending.get(queue_id).map_or(0, |p| p.len() as u64);
            let leases = in_flight.get(queue_id.as_str()).copied().unwrap_or(0);
            self.metrics.set_queue_depth(queue_id, depth);
            self.metrics.set_in_flight(queue_id, leases);
        }
    }
}
