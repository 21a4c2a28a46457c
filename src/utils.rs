use chrono::{DateTime, Utc};
use rand::RngCore;

pub(crate) fn to_millis(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

/// Generates an id for a job enqueued without one, `job-` followed by 8 hex digits.
pub fn gen_job_id() -> String {
    let mut random_bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut random_bytes);
    format!("job-{}", hex::encode(random_bytes))
}

/// Shortens `input` to at most `max` bytes, on a char boundary.
pub(crate) fn truncate(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}
