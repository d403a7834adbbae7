use toolbridge_common::ToolbridgeError;

#[test]
fn test_error_display() {
    let err = ToolbridgeError::NotFound("a0000000-0000-0000-0000-000000000001".to_string());
    assert_eq!(err.to_string(), "Not found: a0000000-0000-0000-0000-000000000001");
}

#[test]
fn test_error_equality() {
    let err1 = ToolbridgeError::NotFound("x".to_string());
    let err2 = ToolbridgeError::NotFound("x".to_string());
    let err3 = ToolbridgeError::NotFound("y".to_string());

    assert_eq!(err1, err2);
    assert_ne!(err1, err3);
}

#[test]
fn test_transport_error() {
    let err = ToolbridgeError::Transport("connection refused".to_string());
    assert_eq!(err.to_string(), "transport failure: connection refused");
}

#[test]
fn test_backend_fault() {
    let err = ToolbridgeError::Backend("session missing after create".to_string());
    assert_eq!(err.to_string(), "backend fault: session missing after create");
}

#[test]
fn test_epoch_mismatch_carries_server_epoch() {
    let err = ToolbridgeError::EpochMismatch { epoch: 7 };
    assert_eq!(err.to_string(), "Epoch mismatch; server epoch is 7");
}

#[test]
fn test_version_mismatch_carries_current_version() {
    let err = ToolbridgeError::VersionMismatch { current: 4 };
    assert_eq!(err.to_string(), "Version mismatch; server version is 4");
}

#[test]
fn test_rate_limited() {
    let err = ToolbridgeError::RateLimited { retry_after_secs: 30 };
    assert_eq!(err.to_string(), "Rate limited; retry after 30s");
}

#[test]
fn test_http_error() {
    let err = ToolbridgeError::HttpError(500, "boom".to_string());
    assert_eq!(err.to_string(), "HTTP 500: boom");
}

#[test]
fn test_error_survives_serde_round_trip() {
    let err = ToolbridgeError::EpochMismatch { epoch: 3 };
    let json = serde_json::to_string(&err).unwrap();
    let decoded: ToolbridgeError = serde_json::from_str(&json).unwrap();
    assert_eq!(err, decoded);
}
