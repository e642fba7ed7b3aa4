use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::ConnectivityError;
use crate::service::http::HttpEditService;
use crate::service::{EditService, ServerInfo, ServiceError};

/// Handle to one reachable editing service.
#[derive(Clone)]
pub struct Connection {
    host: String,
    port: u16,
    service: Arc<dyn EditService>,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, service: Arc<dyn EditService>) -> Self {
        Self {
            host: host.into(),
            port,
            service,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Result<Self, ServiceError> {
        let host = host.into();
        let service = HttpEditService::new(&host, port)?;
        Ok(Self::new(host, port, Arc::new(service)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service(&self) -> &Arc<dyn EditService> {
        &self.service
    }

    pub async fn is_alive(&self) -> bool {
        self.service.server_info().await.is_ok()
    }

    /// Probes the service up to `attempts` times, sleeping `delay` between probes.
    pub async fn wait_until_ready(
        &self,
        attempts: u32,
        delay: Duration,
    ) -> Result<ServerInfo, ConnectivityError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.service.server_info().await {
                Ok(info) => {
                    info!(
                        target: "reef::connection",
                        host = %self.host,
                        port = self.port,
                        version = %info.version,
                        attempt,
                        "service ready"
                    );
                    return Ok(info);
                }
                Err(err) if attempt >= attempts => {
                    return Err(ConnectivityError::Unreachable {
                        host: self.host.clone(),
                        port: self.port,
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    debug!(
                        target: "reef::connection",
                        attempt,
                        attempts,
                        error = %err,
                        "service not ready; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::{MemoryEditService, ServiceOp};

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn retries_until_the_service_answers() {
        let service = MemoryEditService::new();
        service.fail_next(ServiceOp::ServerInfo);
        service.fail_next(ServiceOp::ServerInfo);
        let connection = Connection::new("127.0.0.1", 9000, service.clone());

        let info = connection
            .wait_until_ready(5, Duration::from_millis(100))
            .await
            .expect("ready on third probe");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(service.call_count(ServiceOp::ServerInfo), 3);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn gives_up_after_the_attempt_budget() {
        let service = MemoryEditService::new();
        for _ in 0..3 {
            service.fail_next(ServiceOp::ServerInfo);
        }
        let connection = Connection::new("localhost", 1, service.clone());

        let err = connection
            .wait_until_ready(3, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::Unreachable { attempts: 3, .. }
        ));
        assert_eq!(service.call_count(ServiceOp::ServerInfo), 3);
        // Injected failures are spent; the next probe answers.
        assert!(connection.is_alive().await);
    }
}
