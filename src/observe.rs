use std::time::Duration;

use crate::error::Error;
use crate::executor::RequestPhase;
use crate::interceptor::RequestContext;
use crate::outcome::Outcome;

pub trait Observer: Send + Sync {
    fn on_request_start(&self, _context: &RequestContext) {}

    fn on_phase_change(&self, _context: &RequestContext, _phase: RequestPhase) {}

    fn on_retry_scheduled(&self, _context: &RequestContext, _error: &Error, _delay: Duration) {}

    fn on_replay(&self, _context: &RequestContext) {}

    fn on_request_complete(&self, _context: &RequestContext, _outcome: &Outcome) {}
}
