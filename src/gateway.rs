use async_trait::async_trait;

/// Push delivery failed. Callers log and continue — delivery is
/// fire-and-forget and never blocks a state transition.
#[derive(Debug)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Delivery seam for push notifications. The real transport (FCM or
/// whatever the deployment uses) lives behind this trait; the engine only
/// knows device tokens and title/body pairs.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver(&self, device_token: &str, title: &str, body: &str)
        -> Result<(), DeliveryError>;
}

/// Default gateway: logs the webpush-shaped payload instead of sending it.
/// Useful for development and as the stand-in when no transport is wired.
pub struct LoggingGateway;

#[async_trait]
impl NotificationGateway for LoggingGateway {
    async fn deliver(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "notification": { "title": title, "body": body },
            "webpush": { "fcmOptions": { "link": "/" } },
        });
        tracing::info!(token = device_token, %payload, "notification delivered");
        Ok(())
    }
}

/// Test double that records every delivery.
#[cfg(test)]
pub struct RecordingGateway {
    pub sent: std::sync::Mutex<Vec<(String, String, String)>>,
}

#[cfg(test)]
impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn titles_for(&self, token: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == token)
            .map(|(_, title, _)| title.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn deliver(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((
            device_token.to_string(),
            title.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

/// Test double that always fails, for exercising log-and-continue paths.
#[cfg(test)]
pub struct FailingGateway;

#[cfg(test)]
#[async_trait]
impl NotificationGateway for FailingGateway {
    async fn deliver(&self, _: &str, _: &str, _: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError("transport unavailable".into()))
    }
}
