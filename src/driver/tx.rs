use super::request::ReqRef;

/// A transaction groups data writes with the metadata writes that make
/// them durable. Members increment `started` on joining and `finished`
/// when their I/O completes; the transaction runs its terminal state
/// machine once the two counts meet. `closed` is set by the
/// data-transaction finisher, after which late writes for the same
/// bitmap are queued for the next transaction instead of joining.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub error: Option<i32>,
    pub closed: bool,
    pub started: u32,
    pub finished: u32,
    /// The transaction also commits a BAT entry (block allocation).
    pub update_bat: bool,
    pub requests: Vec<ReqRef>,
}

impl Transaction {
    /// A transaction exists from the first join until it is reset.
    pub fn live(&self) -> bool {
        self.started > 0
    }

    /// All members have completed their I/O.
    pub fn completed(&self) -> bool {
        self.started > 0 && self.started == self.finished
    }

    pub fn add(&mut self, member: ReqRef) {
        debug_assert!(!self.closed);
        self.started += 1;
        self.requests.push(member);
    }

    pub fn fail(&mut self, errno: i32) {
        if self.error.is_none() {
            self.error = Some(errno);
        }
    }

    pub fn reset(&mut self) {
        self.error = None;
        self.closed = false;
        self.started = 0;
        self.finished = 0;
        self.update_bat = false;
        self.requests.clear();
    }
}
