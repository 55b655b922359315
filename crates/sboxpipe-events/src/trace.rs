//! Ambient trace-ID context.
//!
//! A pipeline invocation installs its trace id with [`TraceScope::enter`];
//! nested scopes shadow the outer id and restore it on drop. Synchronous
//! event handlers read the current id without any signature change.

use std::cell::RefCell;

thread_local! {
    static TRACE_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// 16 lowercase hex chars.
pub fn generate_trace_id() -> String {
    let raw: u64 = rand::random();
    format!("{raw:016x}")
}

/// Short random token for event and message ids (8 hex chars).
pub fn short_token() -> String {
    let raw: u32 = rand::random();
    format!("{raw:08x}")
}

/// The innermost active trace id on this thread, if any.
pub fn current_trace_id() -> Option<String> {
    TRACE_STACK.with(|stack| stack.borrow().last().cloned())
}

/// RAII guard installing a trace id for the duration of a scope.
#[derive(Debug)]
pub struct TraceScope {
    _private: (),
}

impl TraceScope {
    pub fn enter(trace_id: String) -> Self {
        TRACE_STACK.with(|stack| stack.borrow_mut().push(trace_id));
        Self { _private: () }
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        TRACE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
