//! A broker client that logs requests without sending them.

use std::future::Future;

use tracing::info;

use super::{
    BrokerClient, BrokerError, BrokerResponse, DeprovisionRequest, LastOperation,
    LastOperationRequest, LastOperationState, UnbindRequest,
};

/// Dry-run broker client.
///
/// Every deprovision and unbind completes synchronously and every poll
/// reports success, so cascades run to completion against the repository
/// alone. The daemon uses it until a real protocol client is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBrokerClient;

impl LoggingBrokerClient {
    pub fn new() -> Self {
        LoggingBrokerClient
    }
}

impl BrokerClient for LoggingBrokerClient {
    fn deprovision(
        &self,
        request: DeprovisionRequest,
    ) -> impl Future<Output = Result<BrokerResponse, BrokerError>> + Send {
        info!(
            broker_id = %request.target.broker_id,
            instance_id = %request.instance_id,
            "LoggingBrokerClient: deprovision logged (not sent)"
        );
        async { Ok(BrokerResponse::Completed) }
    }

    fn unbind(
        &self,
        request: UnbindRequest,
    ) -> impl Future<Output = Result<BrokerResponse, BrokerError>> + Send {
        info!(
            broker_id = %request.target.broker_id,
            instance_id = %request.instance_id,
            binding_id = %request.binding_id,
            "LoggingBrokerClient: unbind logged (not sent)"
        );
        async { Ok(BrokerResponse::Completed) }
    }

    fn last_operation(
        &self,
        request: LastOperationRequest,
    ) -> impl Future<Output = Result<LastOperation, BrokerError>> + Send {
        info!(
            broker_id = %request.target.broker_id,
            subject = ?request.subject,
            "LoggingBrokerClient: last_operation logged (not sent)"
        );
        async { Ok(LastOperation::new(LastOperationState::Succeeded)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerTarget, PollSubject};

    fn target() -> BrokerTarget {
        BrokerTarget {
            broker_id: "b1".into(),
            broker_url: "https://broker.example".to_string(),
            service_id: "svc".into(),
            plan_id: "plan".into(),
        }
    }

    #[tokio::test]
    async fn everything_succeeds() {
        let client = LoggingBrokerClient::new();
        let deprovisioned = client
            .deprovision(DeprovisionRequest {
                target: target(),
                instance_id: "i1".into(),
                accepts_incomplete: true,
            })
            .await
            .unwrap();
        assert_eq!(deprovisioned, BrokerResponse::Completed);

        let polled = client
            .last_operation(LastOperationRequest {
                target: target(),
                subject: PollSubject::Instance {
                    instance_id: "i1".into(),
                },
                operation: None,
            })
            .await
            .unwrap();
        assert_eq!(polled.state, LastOperationState::Succeeded);
    }
}
