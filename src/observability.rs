use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("chatloop.client.requests");
pub(crate) static CLIENT_ATTEMPTS: Counter = Counter::new("chatloop.client.attempts");
pub(crate) static CLIENT_REQUEST_RETRIES: Counter = Counter::new("chatloop.client.retries");
pub(crate) static CLIENT_RATE_LIMITED: Counter = Counter::new("chatloop.client.rate_limited");
pub(crate) static CLIENT_TRANSIENT_FAILURES: Counter =
    Counter::new("chatloop.client.transient_failures");
pub(crate) static CLIENT_FATAL_FAILURES: Counter = Counter::new("chatloop.client.fatal_failures");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("chatloop.client.request_duration_seconds");
pub(crate) static CLIENT_RETRY_BACKOFF: Moments =
    Moments::new("chatloop.client.retry_backoff_seconds");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("chatloop.stream.events");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("chatloop.stream.errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("chatloop.stream.bytes");

pub(crate) static SESSION_ROUNDS: Counter = Counter::new("chatloop.session.rounds");
pub(crate) static SESSION_RESETS: Counter = Counter::new("chatloop.session.resets");
pub(crate) static SESSION_INTERRUPTS: Counter = Counter::new("chatloop.session.interrupts");
pub(crate) static SESSION_TRUNCATIONS: Counter = Counter::new("chatloop.session.truncations");
pub(crate) static SESSION_INJECTIONS: Counter = Counter::new("chatloop.session.injections");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_ATTEMPTS);
    collector.register_counter(&CLIENT_REQUEST_RETRIES);
    collector.register_counter(&CLIENT_RATE_LIMITED);
    collector.register_counter(&CLIENT_TRANSIENT_FAILURES);
    collector.register_counter(&CLIENT_FATAL_FAILURES);
    collector.register_moments(&CLIENT_REQUEST_DURATION);
    collector.register_moments(&CLIENT_RETRY_BACKOFF);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_BYTES);

    collector.register_counter(&SESSION_ROUNDS);
    collector.register_counter(&SESSION_RESETS);
    collector.register_counter(&SESSION_INTERRUPTS);
    collector.register_counter(&SESSION_TRUNCATIONS);
    collector.register_counter(&SESSION_INJECTIONS);
}
