//! ID generation for projects, error groups, events, and notification jobs.
//!
//! Uses short, prefixed slugs: pr-xxx, eg-xxx, ev-xxx, nj-xxx

/// Prefix for project IDs
const PROJECT_PREFIX: &str = "pr";
/// Prefix for error group IDs
const GROUP_PREFIX: &str = "eg";
/// Prefix for event IDs
const EVENT_PREFIX: &str = "ev";
/// Prefix for notification job IDs
const JOB_PREFIX: &str = "nj";

/// Length of the random suffix (in base36 chars). 13 digits hold any u64.
const SUFFIX_LEN: usize = 13;

const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a base36 suffix from 64 bits of OS randomness.
fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        // No OS entropy source; the clock is unique enough per process.
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        bytes = nanos.to_le_bytes();
    }
    encode_base36(u64::from_le_bytes(bytes))
}

/// Zero-padded base36, most significant digit first.
fn encode_base36(mut n: u64) -> String {
    let mut digits = [b'0'; SUFFIX_LEN];
    for slot in digits.iter_mut().rev() {
        *slot = CHARS[(n % 36) as usize];
        n /= 36;
    }
    digits.iter().map(|&b| b as char).collect()
}

/// Generate a new project ID (e.g., "pr-1x0k3m9x2a1bq")
pub fn new_project_id() -> String {
    format!("{}-{}", PROJECT_PREFIX, random_suffix())
}

/// Generate a new error group ID (e.g., "eg-2h7fq2k0c8zte")
pub fn new_group_id() -> String {
    format!("{}-{}", GROUP_PREFIX, random_suffix())
}

/// Generate a new event ID (e.g., "ev-0a81kd9w2mqr5")
pub fn new_event_id() -> String {
    format!("{}-{}", EVENT_PREFIX, random_suffix())
}

/// Generate a new notification job ID (e.g., "nj-3cp0w1x9s7fe0")
pub fn new_job_id() -> String {
    format!("{}-{}", JOB_PREFIX, random_suffix())
}

fn has_shape(s: &str, prefix: &str) -> bool {
    s.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| {
            suffix.len() == SUFFIX_LEN && suffix.bytes().all(|b| CHARS.contains(&b))
        })
}

/// Check if a string looks like a valid error group ID
pub fn is_group_id(s: &str) -> bool {
    has_shape(s, GROUP_PREFIX)
}

/// Check if a string looks like a valid event ID
pub fn is_event_id(s: &str) -> bool {
    has_shape(s, EVENT_PREFIX)
}
