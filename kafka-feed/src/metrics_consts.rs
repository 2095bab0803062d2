// ==== Consumer metrics ====
/// Counter for messages handed to a callback successfully
pub const CONSUMER_MESSAGES_DISPATCHED: &str = "feed_consumer_messages_dispatched_total";

/// Counter for fetched batches, empty ones included
pub const CONSUMER_BATCHES_FETCHED: &str = "feed_consumer_batches_fetched_total";

/// Counter for loop passes abandoned by an error, labelled by kind
pub const CONSUMER_LOOP_ERRORS: &str = "feed_consumer_loop_errors_total";

/// Counter for removals of selectors that were not active
pub const CONSUMER_SELECTOR_NOT_FOUND: &str = "feed_consumer_selector_not_found_total";

/// Gauge for the size of the active selector list
pub const CONSUMER_ACTIVE_SELECTORS: &str = "feed_consumer_active_selectors";

// ==== Producer metrics ====
/// Counter for records handed to the client's buffered send path
pub const PRODUCER_MESSAGES_SUBMITTED: &str = "feed_producer_messages_submitted_total";

/// Counter for flushes, labelled by outcome
pub const PRODUCER_FLUSHES: &str = "feed_producer_flushes_total";

/// Counter for send/flush failures, labelled by class (timeout, failure)
pub const PRODUCER_ERRORS: &str = "feed_producer_errors_total";
