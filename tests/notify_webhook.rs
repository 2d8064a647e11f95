use convo::collab::{CollabError, NotificationDispatcher, NotificationKind, WebhookNotifier};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn posts_recipients_kind_and_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(json!({
            "recipients": [3, 4],
            "kind": "new_message",
            "payload": {"thread_id": 12}
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(format!("{}/notify", server.uri()));
    notifier
        .notify(&[3, 4], NotificationKind::NewMessage, json!({"thread_id": 12, "preview": "Bonjour"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn server_errors_surface_as_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(format!("{}/notify", server.uri()));
    let err = notifier
        .notify(&[1], NotificationKind::ThreadCreated, json!({"thread_id": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, CollabError::Unavailable(_)));
}

#[tokio::test]
async fn unreachable_endpoint_is_unavailable() {
    // nothing listens on port 9 of localhost
    let notifier = WebhookNotifier::new("http://127.0.0.1:9/notify");
    let err = notifier
        .notify(&[1], NotificationKind::ParticipantAdded, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, CollabError::Unavailable(_)));
}
