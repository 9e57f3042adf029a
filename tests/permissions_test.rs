use crabstream::testing::StaticAuthorization;
use crabstream::{AuthorizationGate, AuthorizationStatus, DeviceKind};
use futures::future::join_all;
use std::sync::Arc;

#[tokio::test]
async fn test_granted_backend_never_prompts() {
    let backend = Arc::new(StaticAuthorization::granted());
    let gate = AuthorizationGate::new(backend.clone());

    assert_eq!(
        gate.request_access(DeviceKind::Camera).await,
        AuthorizationStatus::Authorized
    );
    assert_eq!(backend.requests(), 0);
}

#[tokio::test]
async fn test_each_kind_prompts_separately() {
    let backend = Arc::new(StaticAuthorization::undetermined(true));
    let gate = AuthorizationGate::new(backend.clone());

    let (camera, microphone) = tokio::join!(
        gate.request_access(DeviceKind::Camera),
        gate.request_access(DeviceKind::Microphone)
    );
    assert_eq!(camera, AuthorizationStatus::Authorized);
    assert_eq!(microphone, AuthorizationStatus::Authorized);
    assert_eq!(backend.requests(), 2);

    gate.request_access(DeviceKind::Camera).await;
    assert_eq!(backend.requests(), 2);
}

#[tokio::test]
async fn test_denied_answer_is_cached() {
    let backend = Arc::new(StaticAuthorization::undetermined(false));
    let gate = AuthorizationGate::new(backend.clone());
    let mut changes = gate.subscribe();

    assert_eq!(
        gate.query_status(DeviceKind::Microphone),
        AuthorizationStatus::NotDetermined
    );
    assert_eq!(
        gate.request_access(DeviceKind::Microphone).await,
        AuthorizationStatus::Denied
    );
    assert_eq!(
        gate.query_status(DeviceKind::Microphone),
        AuthorizationStatus::Denied
    );

    let change = changes.recv().await.unwrap();
    assert_eq!(change.kind, DeviceKind::Microphone);
    assert_eq!(change.status, AuthorizationStatus::Denied);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_prompt() {
    let backend = Arc::new(StaticAuthorization::undetermined(true));
    let gate = AuthorizationGate::new(backend.clone());

    let results = join_all((0..8).map(|_| gate.request_access(DeviceKind::Camera))).await;
    assert!(results
        .iter()
        .all(|status| *status == AuthorizationStatus::Authorized));
    assert_eq!(backend.requests(), 1);
}
