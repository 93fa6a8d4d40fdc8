use anyhow::Result;

/// Derives every runtime key from `(namespace, kind, identifier)`.
///
/// All cooperating processes must produce byte-identical keys, so the
/// concatenation scheme here is the compatibility surface shared with the
/// management UI.
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Result<Self> {
        if namespace.is_empty() {
            anyhow::bail!("namespace must be non-empty");
        }
        Ok(Self {
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix prepended to a job name to form its live-queue key. The Lua
    /// scripts route records with this same concatenation.
    pub fn queue_prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    pub fn queue(&self, job_name: &str) -> String {
        format!("{}:{job_name}", self.namespace)
    }

    pub fn in_progress(&self, worker_id: &str) -> String {
        format!("{}:{worker_id}:inprogress", self.namespace)
    }

    pub fn known_jobs(&self) -> String {
        format!("{}:known_jobs", self.namespace)
    }

    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    pub fn retry(&self) -> String {
        format!("{}:retry", self.namespace)
    }

    pub fn dead(&self) -> String {
        format!("{}:dead", self.namespace)
    }

    pub fn unique(&self, fingerprint: &str) -> String {
        format!("{}:unique:{fingerprint}", self.namespace)
    }

    pub fn pools(&self) -> String {
        format!("{}:pools", self.namespace)
    }

    pub fn heartbeat(&self, pool_id: &str) -> String {
        format!("{}:{pool_id}:heartbeat", self.namespace)
    }

    pub fn observation(&self, worker_id: &str) -> String {
        format!("{}:{worker_id}:observation", self.namespace)
    }

    pub fn periodic_last_enqueued(&self) -> String {
        format!("{}:periodic:last_enqueued", self.namespace)
    }

    pub fn reap_lock(&self, pool_id: &str) -> String {
        format!("{}:{pool_id}:reap_lock", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespace_prefixed() {
        let keys = Keys::new("ns").unwrap();
        assert_eq!(keys.queue("send_email"), "ns:send_email");
        assert_eq!(keys.in_progress("w1"), "ns:w1:inprogress");
        assert_eq!(keys.known_jobs(), "ns:known_jobs");
        assert_eq!(keys.scheduled(), "ns:scheduled");
        assert_eq!(keys.retry(), "ns:retry");
        assert_eq!(keys.dead(), "ns:dead");
        assert_eq!(keys.unique("abc"), "ns:unique:abc");
        assert_eq!(keys.pools(), "ns:pools");
        assert_eq!(keys.heartbeat("p1"), "ns:p1:heartbeat");
        assert_eq!(keys.observation("w1"), "ns:w1:observation");
        assert_eq!(keys.periodic_last_enqueued(), "ns:periodic:last_enqueued");
        assert_eq!(keys.reap_lock("p1"), "ns:p1:reap_lock");
    }

    #[test]
    fn queue_prefix_matches_queue_derivation() {
        let keys = Keys::new("ns").unwrap();
        assert_eq!(
            format!("{}{}", keys.queue_prefix(), "ping"),
            keys.queue("ping")
        );
    }

    #[test]
    fn empty_namespace_is_rejected() {
        assert!(Keys::new("").is_err());
    }
}
