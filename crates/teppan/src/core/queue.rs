use crate::request::Request;

/// Requests accepted by the host that have not been admitted yet.
///
/// Shared between submitters and the tick loop behind a mutex that is only
/// ever held for pushes and drains, never across an evaluation.
#[derive(Debug, Default)]
pub struct SubmissionQueue {
    requests: Vec<Request>,
    next_seq: u64,
    closed: bool,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The submission number the next pushed request must carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Appends a request built with [`next_seq`](Self::next_seq).
    ///
    /// Hands the request back once the queue is closed.
    pub fn push(&mut self, request: Request) -> Result<(), Request> {
        if self.closed {
            return Err(request);
        }
        debug_assert_eq!(request.seq(), self.next_seq);
        self.next_seq += 1;
        self.requests.push(request);
        Ok(())
    }

    /// Stops accepting requests. Already queued requests stay queued.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn requests_mut(&mut self) -> &mut Vec<Request> {
        &mut self.requests
    }

    pub fn take_all(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
