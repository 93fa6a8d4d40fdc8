use std::collections::HashMap;

/// What a worker is doing right now, as read from its observation hash.
/// Present only while a job is mid-execution.
#[derive(Debug, Clone)]
pub struct Observation {
    pub worker_id: String,
    pub job_id: String,
    pub job_name: String,
    pub args_json: String,
    pub started_at: i64,
    pub checkin: Option<String>,
    pub checkin_at: Option<i64>,
}

impl Observation {
    pub(crate) fn parse(worker_id: &str, raw: &HashMap<String, String>) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self {
            worker_id: worker_id.to_string(),
            job_id: raw.get("job_id").cloned().unwrap_or_default(),
            job_name: raw.get("job_name").cloned().unwrap_or_default(),
            args_json: raw.get("args").cloned().unwrap_or_else(|| "{}".to_string()),
            started_at: raw
                .get("started_at")
                .and_then(|value| value.parse().ok())
                .unwrap_or_default(),
            checkin: raw.get("checkin").cloned(),
            checkin_at: raw.get("checkin_at").and_then(|value| value.parse().ok()),
        })
    }
}
