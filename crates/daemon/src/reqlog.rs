//! Request-scoped log accumulator.
//!
//! Lines are buffered while a request runs and flushed as a single tracing
//! event on every exit path. Handlers flush explicitly with the outcome;
//! `Drop` is the backstop for paths that unwind early.

use dispatch_core::new_request_id;
use tracing::info;

pub struct RequestLog {
    request_id: String,
    op: &'static str,
    lines: Vec<String>,
    flushed: bool,
}

impl RequestLog {
    pub fn new(op: &'static str) -> Self {
        Self {
            request_id: new_request_id(),
            op,
            lines: Vec::new(),
            flushed: false,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn flush(mut self, outcome: &str) {
        self.emit(outcome);
    }

    fn emit(&mut self, outcome: &str) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        info!(
            request_id = %self.request_id,
            op = self.op,
            outcome,
            detail = %self.lines.join(" | "),
            "request finished"
        );
    }
}

impl Drop for RequestLog {
    fn drop(&mut self) {
        self.emit("aborted");
    }
}
