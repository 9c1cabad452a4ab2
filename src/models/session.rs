use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A caller's binding to one proxy
///
/// The binding is fixed when the session is created; only the bookkeeping
/// fields change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub proxy_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub request_count: u64,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_session_expiry_boundary() {
        let now = Utc::now();
        let session = Session {
            session_id: "s".to_string(),
            proxy_id: "p".to_string(),
            created_at: now,
            last_used_at: now,
            expires_at: now + Duration::seconds(10),
            request_count: 0,
        };
        assert!(!session.is_expired_at(now));
        assert!(!session.is_expired_at(now + Duration::seconds(9)));
        assert!(session.is_expired_at(now + Duration::seconds(10)));
    }
}
