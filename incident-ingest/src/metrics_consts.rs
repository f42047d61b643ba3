// ==== Consumption ====
/// Counter for envelopes read from the stream, labelled by source
pub const MESSAGES_CONSUMED: &str = "incident_ingest_messages_consumed_total";

/// Counter for envelopes that failed decoding or validation, labelled by reason
pub const INVALID_MESSAGES: &str = "incident_ingest_invalid_messages_total";

// ==== Deduplication ====
/// Counter for reports rejected as near-duplicates, labelled by source
pub const DUPLICATES_DROPPED: &str = "incident_ingest_duplicates_dropped_total";

/// Gauge for the number of reports currently eligible for matching
pub const DEDUP_INDEX_SIZE: &str = "incident_ingest_dedup_index_size";

// ==== Sinks ====
/// Counter for rows newly written to the primary store, labelled by source
pub const INCIDENTS_INSERTED: &str = "incident_ingest_incidents_inserted_total";

/// Counter for writes that hit an existing canonical key, labelled by source
pub const INCIDENTS_ALREADY_PRESENT: &str = "incident_ingest_incidents_already_present_total";

/// Counter for failed mirror writes, labelled by reason
pub const SECONDARY_FAILURES: &str = "incident_ingest_secondary_failures_total";

/// Counter for primary store write attempts that will be retried
pub const PRIMARY_RETRIES: &str = "incident_ingest_primary_retries_total";

/// Histogram of seconds between collector ingestion and persistence
pub const LATENCY_HISTOGRAM: &str = "incident_ingest_latency_seconds";

// ==== HTTP ====
/// Counter for requests to the health and metrics endpoints
pub const HTTP_REQUESTS: &str = "incident_ingest_http_requests_total";

/// Histogram of request handling time for the health and metrics endpoints
pub const HTTP_REQUEST_DURATION: &str = "incident_ingest_http_request_duration_seconds";
