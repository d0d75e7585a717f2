use crate::config::AdmissionPolicy;
use crate::request::Request;

/// Decides which requests make up each tick's batch.
///
/// Requests that already hold a slot stay in the batch until they resolve;
/// there is no preemption. Free slots are filled from the waiting list
/// according to the [`AdmissionPolicy`], greedily, up to `max_batch_size`.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    max_batch_size: usize,
    policy: AdmissionPolicy,
}

impl BatchAssembler {
    pub fn new(max_batch_size: usize, policy: AdmissionPolicy) -> Self {
        Self { max_batch_size, policy }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Slots left for new admissions next to `active` in-flight requests.
    #[inline]
    pub fn free_slots(&self, active: usize) -> usize {
        self.max_batch_size.saturating_sub(active)
    }

    /// Removes waiting requests whose callers have withdrawn.
    pub fn withdraw_cancelled(waiting: &mut Vec<Request>) -> Vec<Request> {
        let (cancelled, kept): (Vec<_>, Vec<_>) = waiting.drain(..).partition(Request::is_cancelled);
        *waiting = kept;
        cancelled
    }

    /// Moves as many waiting requests into `active` as there are free
    /// slots, marking each one active. Returns how many were admitted.
    ///
    /// `waiting` must be in submission order, which is how the submission
    /// queue keeps it.
    pub fn admit(&self, waiting: &mut Vec<Request>, active: &mut Vec<Request>) -> usize {
        let take = self.free_slots(active.len()).min(waiting.len());
        if take == 0 {
            return 0;
        }

        if self.policy == AdmissionPolicy::ShortestInputFirst {
            // stable on submission order among equal lengths
            waiting.sort_by_key(|request| (request.input().len(), request.seq()));
        }
        let mut admitted = waiting.drain(..take).collect::<Vec<_>>();

        if self.policy == AdmissionPolicy::ShortestInputFirst {
            waiting.sort_by_key(Request::seq);
        }

        for request in admitted.iter_mut() {
            request.activate();
        }
        active.extend(admitted);
        take
    }
}
