//! Security event recorder.
//!
//! Events are appended through the [`SecurityEventStore`] seam; monitoring
//! consumes them out-of-band.

use std::sync::Arc;

use crate::models::SecurityEvent;
use crate::services::SecurityEventStore;

/// Request-scoped metadata attached to emitted events.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl RequestMeta {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: None,
            session_id: None,
        }
    }
}

#[derive(Clone)]
pub struct SecurityEventService {
    store: Arc<dyn SecurityEventStore>,
}

impl SecurityEventService {
    pub fn new(store: Arc<dyn SecurityEventStore>) -> Self {
        Self { store }
    }

    /// Record an event without blocking the request path.
    pub fn log_async(&self, event: SecurityEvent) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert_event(&event).await {
                tracing::error!(
                    error = %e,
                    event_type = %event.event_type,
                    "Failed to write security event"
                );
            } else {
                tracing::warn!(
                    event_type = %event.event_type,
                    risk_score = event.risk_score,
                    risk_tier = event.risk_tier().as_str(),
                    device_id = event.device_id.as_deref().unwrap_or("-"),
                    "Security event recorded"
                );
            }
        });
    }

    /// Record an event and wait for the write.
    pub async fn log(&self, event: SecurityEvent) -> Result<(), anyhow::Error> {
        tracing::warn!(
            event_type = %event.event_type,
            risk_score = event.risk_score,
            risk_tier = event.risk_tier().as_str(),
            device_id = event.device_id.as_deref().unwrap_or("-"),
            "Security event"
        );
        self.store.insert_event(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SecurityEventType;
    use crate::services::MemoryStore;

    #[tokio::test]
    async fn log_appends_to_store() {
        let store = Arc::new(MemoryStore::new());
        let events = SecurityEventService::new(store.clone());

        events
            .log(SecurityEvent::new(
                SecurityEventType::DeviceRegistered,
                0.1,
                "10.0.0.1",
            ))
            .await
            .unwrap();

        let recorded = store.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].event_type, "device_registered");
    }
}
