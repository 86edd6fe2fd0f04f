//! Dispatch decisions: queue fusion, SRPT pairing, forced-dispatch backoff.

use crate::scheduler::{
    request::Request,
    server::{BatchStatus, ServerStatistic},
};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fallback mean response time in milliseconds, used for the backoff window
/// before any server has reported a sample.
const DEFAULT_RESPONSE_TIME_MS: f64 = 500.0;

/// Millisecond epoch ticks, the time base for arrival ordering and backoff.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// The scheduling engine.
///
/// Owns every record arena-style: servers live in a position-stable vector
/// and are referenced by index, requests live in a name-keyed map. The two
/// idle pools hold indices of servers with no outstanding work; a busy
/// server is in neither pool and rejoins exactly one of them when its batch
/// drains. Requests wait in FIFO order in one of two queues depending on
/// whether their declared size is usable.
///
/// Every mutation takes the current time as an explicit millisecond
/// argument, so the engine itself never reads a clock.
pub struct Scheduler {
    servers: Vec<ServerStatistic>,
    /// Idle servers with a per-byte-rate sample, selected by that rate.
    calibrated: Vec<usize>,
    /// Idle servers without one, selected by mean response time.
    approximated: Vec<usize>,
    /// Queued requests with a known size, FIFO.
    identified: VecDeque<String>,
    /// Queued requests without one, FIFO.
    unidentified: VecDeque<String>,
    /// Every accepted request, from submission until completion accounting.
    requests: HashMap<String, Request>,
    /// Dispatched request name to owning server index.
    in_flight: HashMap<String, usize>,
    /// Timestamp of the last ordinary dispatch (or forced-batch drain).
    timeout_trigger: u64,
    /// Backoff scale; doubles per forced dispatch, resets to 2.
    multiplier: u64,
    forced_outstanding: u32,
    forced_completed: u32,
}

impl Scheduler {
    pub fn new<I, S>(names: I, now: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers: Vec<ServerStatistic> = names
            .into_iter()
            .map(|name| ServerStatistic::new(name.into()))
            .collect();
        let approximated = (0..servers.len()).collect();

        Self {
            servers,
            calibrated: Vec::new(),
            approximated,
            identified: VecDeque::new(),
            unidentified: VecDeque::new(),
            requests: HashMap::new(),
            in_flight: HashMap::new(),
            timeout_trigger: now,
            multiplier: 2,
            forced_outstanding: 0,
            forced_completed: 0,
        }
    }

    /// Accepts a `"name,size"` submission line; malformed lines are
    /// dropped. Never blocks, never reports an error upstream.
    pub fn submit(&mut self, line: &str, now: u64) {
        let Some(request) = Request::parse(line, now) else {
            return;
        };
        let name = request.name().to_owned();
        match request.is_sized() {
            true => self.identified.push_back(name.clone()),
            false => self.unidentified.push_back(name.clone()),
        }
        self.requests.insert(name, request);
    }

    /// Completion accounting for `name`. Unknown names are a no-op:
    /// completions may race a scheduler restart.
    pub fn complete(&mut self, name: &str, now: u64) {
        let Some(server_id) = self.in_flight.remove(name) else {
            return;
        };
        let Some(mut request) = self.requests.remove(name) else {
            return;
        };

        let status = self.servers[server_id].record(&mut request, now);

        if request.forced() {
            self.forced_completed += 1;
            if self.forced_completed == self.forced_outstanding {
                self.forced_completed = 0;
                self.forced_outstanding = 0;
                self.reset_timeout(now);
            }
        }

        if status == BatchStatus::Drained {
            self.requeue_server(server_id);
        }
    }

    /// Produces at most one assignment line.
    ///
    /// An uncalibrated server paired with the smallest sized request yields
    /// an uncontaminated per-byte sample, so that pairing wins whenever
    /// both halves are available; otherwise the pools and queues are merged
    /// on their own orderings.
    pub fn handle_next(&mut self, now: u64) -> Option<String> {
        if self.calibrated.is_empty() && self.approximated.is_empty() {
            return None;
        }
        if self.identified.is_empty() && self.unidentified.is_empty() {
            return None;
        }

        if !self.approximated.is_empty() && !self.identified.is_empty() {
            let name = self.take_smallest_identified()?;
            let server_id = self.pop_best_approximated()?;
            self.reset_timeout(now);
            return self.assign(server_id, name, now);
        }

        let name = self.pop_older_head()?;
        let server_id = self.pop_merge_server()?;
        self.reset_timeout(now);
        self.assign(server_id, name, now)
    }

    /// Forced dispatch for requests stranded behind slow servers.
    ///
    /// Fires only once the quiet period exceeds `multiplier` mean response
    /// times and the stranded request itself is at least two means old;
    /// both gates keep a merely slow system from forcing early. The
    /// dispatch doubles the backoff window and deliberately leaves
    /// `timeout_trigger` alone.
    pub fn handle_timeout(&mut self, now: u64) -> Option<String> {
        let mean = self.mean_response_time();
        let elapsed = now.saturating_sub(self.timeout_trigger) as f64;
        if elapsed < self.multiplier as f64 * mean {
            return None;
        }

        let from_identified = self.older_head_is_identified()?;
        let name = match from_identified {
            true => self.identified.front(),
            false => self.unidentified.front(),
        }?
        .clone();

        let age = now.saturating_sub(self.arrival_of(&name)) as f64;
        if age < 2.0 * mean {
            return None;
        }

        match from_identified {
            true => self.identified.pop_front(),
            false => self.unidentified.pop_front(),
        };
        if let Some(request) = self.requests.get_mut(&name) {
            request.mark_forced();
        }

        let server_id = self.pick_timeout_handler()?;
        self.remove_idle(server_id);

        let line = self.assign(server_id, name, now)?;
        self.multiplier *= 2;
        self.forced_outstanding += 1;
        Some(line)
    }

    /// Backoff multiplier, for diagnostics.
    #[inline]
    pub fn multiplier(&self) -> u64 {
        self.multiplier
    }

    /// Accepted requests not yet dispatched.
    #[inline]
    pub fn pending(&self) -> usize {
        self.identified.len() + self.unidentified.len()
    }

    fn reset_timeout(&mut self, now: u64) {
        self.timeout_trigger = now;
        self.multiplier = 2;
    }

    fn requeue_server(&mut self, server_id: usize) {
        match self.servers[server_id].is_calibrated() {
            true => self.calibrated.push(server_id),
            false => self.approximated.push(server_id),
        }
    }

    fn remove_idle(&mut self, server_id: usize) {
        self.calibrated.retain(|&id| id != server_id);
        self.approximated.retain(|&id| id != server_id);
    }

    /// Stamps the dispatch and renders the wire form
    /// `"{server},{request},{size}\n"`.
    fn assign(&mut self, server_id: usize, name: String, now: u64) -> Option<String> {
        let request = self.requests.get_mut(&name)?;
        self.servers[server_id].process(request, now);
        let line = format!(
            "{},{},{}\n",
            self.servers[server_id].name(),
            request.name(),
            request.size()
        );
        self.in_flight.insert(name, server_id);
        Some(line)
    }

    fn arrival_of(&self, name: &str) -> u64 {
        self.requests.get(name).map(Request::arrival).unwrap_or(u64::MAX)
    }

    /// Which queue holds the older head; `None` when both are empty. The
    /// identified head wins an equal-arrival tie.
    fn older_head_is_identified(&self) -> Option<bool> {
        match (self.identified.front(), self.unidentified.front()) {
            (None, None) => None,
            (Some(_), None) => Some(true),
            (None, Some(_)) => Some(false),
            (Some(sized), Some(unsized_)) => {
                Some(self.arrival_of(sized) <= self.arrival_of(unsized_))
            }
        }
    }

    fn pop_older_head(&mut self) -> Option<String> {
        match self.older_head_is_identified()? {
            true => self.identified.pop_front(),
            false => self.unidentified.pop_front(),
        }
    }

    /// Linear scan for the smallest declared size; earliest position wins
    /// a tie.
    fn take_smallest_identified(&mut self) -> Option<String> {
        let mut best: Option<(usize, i64)> = None;
        for (index, name) in self.identified.iter().enumerate() {
            let size = self
                .requests
                .get(name.as_str())
                .map(Request::size)
                .unwrap_or(i64::MAX);
            match best {
                Some((_, smallest)) if smallest <= size => {}
                _ => best = Some((index, size)),
            }
        }
        let (index, _) = best?;
        self.identified.remove(index)
    }

    fn pop_best_approximated(&mut self) -> Option<usize> {
        let index = best_index(&self.approximated, |id| {
            self.servers[id].response_time().unwrap_or(f64::INFINITY)
        })?;
        Some(self.approximated.remove(index))
    }

    fn pop_best_calibrated(&mut self) -> Option<usize> {
        let index = best_index(&self.calibrated, |id| {
            self.servers[id].per_byte_rate().unwrap_or(f64::INFINITY)
        })?;
        Some(self.calibrated.remove(index))
    }

    /// Merge-path server selection: the sole non-empty pool's top, or the
    /// top whose mean response time is smaller.
    fn pop_merge_server(&mut self) -> Option<usize> {
        if self.calibrated.is_empty() {
            return self.pop_best_approximated();
        }
        if self.approximated.is_empty() {
            return self.pop_best_calibrated();
        }

        let calibrated_index = best_index(&self.calibrated, |id| {
            self.servers[id].per_byte_rate().unwrap_or(f64::INFINITY)
        })?;
        let approximated_index = best_index(&self.approximated, |id| {
            self.servers[id].response_time().unwrap_or(f64::INFINITY)
        })?;

        let calibrated_time = self.servers[self.calibrated[calibrated_index]]
            .response_time()
            .unwrap_or(f64::INFINITY);
        let approximated_time = self.servers[self.approximated[approximated_index]]
            .response_time()
            .unwrap_or(f64::INFINITY);

        match approximated_time < calibrated_time {
            true => Some(self.approximated.remove(approximated_index)),
            false => Some(self.calibrated.remove(calibrated_index)),
        }
    }

    /// Timeout-handler selection: minimum product of outstanding work and
    /// mean response time. The comparison is pairwise: when either side of
    /// a comparison lacks a response-time sample, that pair is decided by
    /// outstanding work alone. First-seen wins a tie.
    fn pick_timeout_handler(&self) -> Option<usize> {
        if self.servers.is_empty() {
            return None;
        }
        let mut best = 0;
        for id in 1..self.servers.len() {
            if self.beats_handler(id, best) {
                best = id;
            }
        }
        Some(best)
    }

    fn beats_handler(&self, challenger: usize, best: usize) -> bool {
        let both_sampled = self.servers[challenger].response_time().is_some()
            && self.servers[best].response_time().is_some();
        match both_sampled {
            true => self.load_time_product(challenger) < self.load_time_product(best),
            false => self.servers[challenger].active() < self.servers[best].active(),
        }
    }

    fn load_time_product(&self, id: usize) -> f64 {
        self.servers[id].active() as f64 * self.servers[id].response_time().unwrap_or(0.0)
    }

    /// Mean of the per-server mean response times, or the default when no
    /// server has reported yet.
    fn mean_response_time(&self) -> f64 {
        let mut sum = 0.0;
        let mut sampled = 0u32;
        for server in &self.servers {
            if let Some(mean) = server.response_time() {
                sum += mean;
                sampled += 1;
            }
        }
        match sampled {
            0 => DEFAULT_RESPONSE_TIME_MS,
            sampled => sum / f64::from(sampled),
        }
    }
}

/// First occurrence of the minimum key in a pool.
fn best_index<F: Fn(usize) -> f64>(pool: &[usize], key: F) -> Option<usize> {
    if pool.is_empty() {
        return None;
    }
    let mut best = 0;
    for index in 1..pool.len() {
        if key(pool[index]) < key(pool[best]) {
            best = index;
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(names: &[&str]) -> Scheduler {
        Scheduler::new(names.iter().copied(), 0)
    }

    fn idle_count(scheduler: &Scheduler) -> usize {
        scheduler.calibrated.len() + scheduler.approximated.len()
    }

    #[test]
    fn first_dispatch_goes_to_first_greeted_server() {
        let mut s = scheduler(&["s1", "s2"]);

        s.submit("a,100", 10);
        assert_eq!(s.handle_next(10), Some("s1,a,100\n".into()));
        assert_eq!(s.handle_next(10), None);
    }

    #[test]
    fn single_server_round_trip() {
        let mut s = scheduler(&["s1"]);

        s.submit("a,100", 0);
        assert_eq!(s.handle_next(0), Some("s1,a,100\n".into()));

        s.complete("a", 40);
        s.submit("b,50", 50);
        assert_eq!(s.handle_next(50), Some("s1,b,50\n".into()));
    }

    #[test]
    fn srpt_pairs_smallest_request_first() {
        let mut s = scheduler(&["s1", "s2"]);

        s.submit("a,200", 0);
        s.submit("b,100", 1);

        // Two fresh servers and two sized requests: each server takes one,
        // smallest size first.
        assert_eq!(s.handle_next(2), Some("s1,b,100\n".into()));
        assert_eq!(s.handle_next(2), Some("s2,a,200\n".into()));
        assert_eq!(s.handle_next(2), None);
    }

    #[test]
    fn srpt_tie_breaks_by_queue_position() {
        let mut s = scheduler(&["s1"]);

        s.submit("a,100", 0);
        s.submit("b,100", 1);
        assert_eq!(s.handle_next(2), Some("s1,a,100\n".into()));
    }

    #[test]
    fn unknown_sizes_serialize_on_single_server() {
        let mut s = scheduler(&["s1"]);

        s.submit("a,-1", 0);
        s.submit("b,-1", 1);
        assert_eq!(s.handle_next(1), Some("s1,a,-1\n".into()));
        assert_eq!(s.handle_next(1), None);

        s.complete("a", 30);
        assert_eq!(s.handle_next(30), Some("s1,b,-1\n".into()));
    }

    #[test]
    fn calibrated_server_serves_from_calibrated_pool() {
        let mut s = scheduler(&["s1"]);

        s.submit("a,100", 0);
        assert!(s.handle_next(0).is_some());
        s.complete("a", 50);
        assert_eq!(s.calibrated, vec![0]);

        s.submit("b,200", 60);
        assert_eq!(s.handle_next(60), Some("s1,b,200\n".into()));
    }

    #[test]
    fn merge_prefers_older_head_across_queues() {
        let mut s = scheduler(&["s1"]);

        // Occupy the only server so both queues build up.
        s.submit("warm,10", 0);
        assert!(s.handle_next(0).is_some());

        s.submit("old,-1", 5);
        s.submit("young,100", 9);
        s.complete("warm", 20);

        // Merge path: s1 is calibrated, the unidentified head is older.
        assert_eq!(s.handle_next(20), Some("s1,old,-1\n".into()));
    }

    #[test]
    fn queue_membership_follows_declared_size() {
        let mut s = scheduler(&[] as &[&str]);

        s.submit("a,100", 0);
        s.submit("b,0", 0);
        s.submit("c,-1", 0);

        assert_eq!(s.identified, vec!["a"]);
        assert_eq!(s.unidentified, vec!["b", "c"]);
        assert_eq!(s.pending(), 3);
        // No servers at all: nothing dispatches, queues are preserved.
        assert_eq!(s.handle_next(1), None);
        assert_eq!(s.pending(), 3);
    }

    #[test]
    fn no_duplicate_dispatch_before_completion() {
        let mut s = scheduler(&["s1", "s2"]);

        s.submit("a,100", 0);
        assert!(s.handle_next(0).is_some());
        assert_eq!(s.handle_next(0), None);
        assert_eq!(s.handle_timeout(10_000), None);
    }

    #[test]
    fn unknown_completion_is_noop() {
        let mut s = scheduler(&["s1"]);

        s.complete("ghost", 5);
        s.submit("a,100", 10);
        // A completion for a queued-but-undispatched name changes nothing.
        s.complete("a", 11);
        assert_eq!(s.handle_next(12), Some("s1,a,100\n".into()));
    }

    #[test]
    fn all_servers_return_to_idle() {
        let mut s = scheduler(&["s1", "s2", "s3"]);

        for (index, line) in ["a,100", "b,-1", "c,30"].iter().enumerate() {
            s.submit(line, index as u64);
            assert!(s.handle_next(index as u64).is_some());
        }
        assert_eq!(idle_count(&s), 0);

        for name in ["b", "a", "c"] {
            s.complete(name, 200);
        }
        assert_eq!(idle_count(&s), 3);
        assert!(s.requests.is_empty());
        assert!(s.in_flight.is_empty());
    }

    #[test]
    fn timeout_respects_backoff_window() {
        let mut s = scheduler(&["s1"]);

        // Strand a request behind the busy server.
        s.submit("busy,10", 0);
        assert!(s.handle_next(0).is_some());
        s.submit("stuck,-1", 0);

        // Default mean is 500 ms and the multiplier is 2: nothing before
        // the 1000 ms window closes, forced dispatch at the boundary.
        assert_eq!(s.handle_timeout(999), None);
        let line = s.handle_timeout(1000);
        assert_eq!(line, Some("s1,stuck,-1\n".into()));
        assert_eq!(s.multiplier(), 4);
    }

    #[test]
    fn timeout_spares_young_requests() {
        let mut s = scheduler(&["s1"]);

        s.submit("busy,10", 0);
        assert!(s.handle_next(0).is_some());
        // Arrives late: the quiet period is long enough but the request
        // itself is younger than two mean response times.
        s.submit("late,-1", 900);

        assert_eq!(s.handle_timeout(1100), None);
        assert_eq!(s.pending(), 1);
        assert_eq!(s.handle_timeout(1900), Some("s1,late,-1\n".into()));
    }

    #[test]
    fn forced_completion_resets_backoff() {
        let mut s = scheduler(&["s1"]);

        s.submit("busy,10", 0);
        assert!(s.handle_next(0).is_some());
        s.submit("stuck,-1", 0);
        assert!(s.handle_timeout(1000).is_some());
        assert_eq!(s.multiplier(), 4);

        s.complete("busy", 1200);
        assert_eq!(s.multiplier(), 4);

        // The last outstanding forced request completing resets the clock.
        s.complete("stuck", 1500);
        assert_eq!(s.multiplier(), 2);
        assert_eq!(s.timeout_trigger, 1500);
    }

    #[test]
    fn ordinary_dispatch_resets_multiplier() {
        let mut s = scheduler(&["s1", "s2"]);

        s.submit("a,10", 0);
        s.submit("b,20", 0);
        assert!(s.handle_next(0).is_some());
        assert!(s.handle_next(0).is_some());

        s.submit("stuck,-1", 0);
        assert!(s.handle_timeout(1000).is_some());
        assert_eq!(s.multiplier(), 4);

        // Draining s2 and dispatching normally resets the backoff even
        // while the forced request is still outstanding.
        s.complete("b", 1100);
        s.submit("c,30", 1200);
        assert!(s.handle_next(1200).is_some());
        assert_eq!(s.multiplier(), 2);
    }

    #[test]
    fn forced_dispatch_pulls_idle_server_out_of_pool() {
        let mut s = scheduler(&["s1", "s2"]);

        s.submit("a,10", 0);
        assert_eq!(s.handle_next(0), Some("s1,a,10\n".into()));
        s.submit("stuck,-1", 10);

        // The timeout path picks idle s2 (fewest active requests) and must
        // pull it out of the approximated pool as it goes busy.
        assert_eq!(s.handle_timeout(1500), Some("s2,stuck,-1\n".into()));
        assert_eq!(idle_count(&s), 0);

        s.complete("stuck", 1600);
        assert_eq!(s.approximated, vec![1]);
    }

    #[test]
    fn timeout_handler_uses_load_time_product() {
        let mut s = scheduler(&["s1", "s2"]);

        // Calibrate both servers: s1 fast (5 ms), s2 slow (300 ms).
        s.submit("w1,10", 0);
        assert_eq!(s.handle_next(0), Some("s1,w1,10\n".into()));
        s.complete("w1", 5);
        s.submit("w2,10", 10);
        assert_eq!(s.handle_next(10), Some("s2,w2,10\n".into()));
        s.complete("w2", 310);

        // Occupy both, strand x3 and x4.
        s.submit("x1,10", 400);
        s.submit("x2,10", 400);
        assert_eq!(s.handle_next(400), Some("s1,x1,10\n".into()));
        assert_eq!(s.handle_next(400), Some("s2,x2,10\n".into()));
        s.submit("x3,10", 400);
        s.submit("x4,10", 800);

        // Mean of means is 152.5 ms; the first window closes 305 ms after
        // the last ordinary dispatch. s1: 1 active x 5 ms beats s2:
        // 1 active x 300 ms.
        assert_eq!(s.handle_timeout(800), Some("s1,x3,10\n".into()));
        assert_eq!(s.multiplier(), 4);

        // Now s1 carries two active requests yet its product (2 x 5) still
        // beats s2 (1 x 300): the product form, not the active count,
        // decides the handler.
        assert_eq!(s.handle_timeout(1500), Some("s1,x4,10\n".into()));
        assert_eq!(s.multiplier(), 8);
    }

    #[test]
    fn timeout_handler_compares_pairwise_when_a_server_is_unsampled() {
        let mut s = scheduler(&["s1", "s2", "s3"]);

        // s1 slow (100 ms) and s3 fast (1 ms) get calibrated; s2 never
        // completes anything, so it has no response-time sample.
        s.submit("a,10", 0);
        assert_eq!(s.handle_next(0), Some("s1,a,10\n".into()));
        s.complete("a", 100);

        s.submit("b,10", 100);
        assert_eq!(s.handle_next(100), Some("s2,b,10\n".into()));
        s.submit("c,10", 100);
        assert_eq!(s.handle_next(100), Some("s3,c,10\n".into()));
        s.complete("c", 101);

        // Occupy s1 and s3 again so every server carries one active
        // request, then strand f.
        s.submit("d,10", 101);
        assert_eq!(s.handle_next(101), Some("s3,d,10\n".into()));
        s.submit("e,10", 101);
        assert_eq!(s.handle_next(101), Some("s1,e,10\n".into()));
        s.submit("f,10", 101);

        // The unsampled s2 wins no pairwise active-count comparison (all
        // three are equally loaded), and among the sampled pair the
        // product picks fast s3 (1 x 1 ms) over slow s1 (1 x 100 ms). A
        // fleet-wide sample check would have degraded every comparison to
        // active counts and handed f to s1.
        assert_eq!(s.handle_timeout(300), Some("s3,f,10\n".into()));
    }

    #[test]
    fn busy_server_requeues_once_after_batch_drains() {
        let mut s = scheduler(&["s1"]);

        s.submit("a,10", 0);
        assert!(s.handle_next(0).is_some());
        s.submit("b,-1", 0);
        assert!(s.handle_timeout(1000).is_some());

        s.complete("a", 1100);
        assert_eq!(idle_count(&s), 0);
        s.complete("b", 1200);
        // Two-deep batch never produced a clean per-byte sample.
        assert_eq!(s.approximated, vec![0]);
        assert!(s.calibrated.is_empty());
    }
}
