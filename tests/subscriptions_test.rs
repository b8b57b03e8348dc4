mod common;

use common::{endpoint, test_config, Harness, RecordingResponder, SECRET};
use gist_webhooks::{
    ContentType, DeliveryFailure, DeliveryId, DeliveryOutcome, EventFilter, EventType,
    NewSubscription, Owner, Secret, SubscriptionId, SubscriptionPatch, WebhookError,
    SIGNATURE_256_HEADER,
};

#[tokio::test]
async fn create_rejects_bad_configuration() {
    let harness = Harness::new(test_config());
    let service = &harness.service;

    let err = service
        .create(NewSubscription::new(Owner::User(1), "ftp://example.com/hook"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidUrl(_)));

    let err = service
        .create(NewSubscription::new(Owner::User(1), "https://example.com/hook").with_secret("short"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSecret { min: 16 }));

    let err = service
        .create(
            NewSubscription::new(Owner::User(1), "https://example.com/hook")
                .with_events(EventFilter::only([])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Validation(_)));

    assert!(service.list_for_owner(Owner::User(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn custom_filter_entries_are_stored_canonically() {
    let harness = Harness::new(test_config());

    let created = harness
        .service
        .create(
            NewSubscription::new(Owner::User(4), "https://example.com/hook")
                .with_events(EventFilter::only([EventType::Custom("gist.created".to_string())])),
        )
        .await
        .unwrap();
    assert_eq!(created.events, EventFilter::only([EventType::GistCreated]));
    assert!(created.accepts(&EventType::GistCreated));

    // A filter naming `test` is refused however it is spelled.
    let err = harness
        .service
        .create(
            NewSubscription::new(Owner::User(4), "https://example.com/hook")
                .with_events(EventFilter::Only([EventType::Custom("test".to_string())].into_iter().collect())),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Validation(_)));
}

#[tokio::test]
async fn crud_lifecycle() {
    let harness = Harness::new(test_config());
    let service = &harness.service;

    let created = service
        .create(
            NewSubscription::new(Owner::Organization(10), "https://example.com/a")
                .with_secret(SECRET)
                .with_events(EventFilter::only([EventType::GistCreated, EventType::GistStarred])),
        )
        .await
        .unwrap();
    assert!(created.active);
    assert!(created.has_secret());
    assert_eq!(created.content_type, ContentType::Json);

    // Read APIs never expose the secret.
    let json = serde_json::to_string(&service.get(created.id).await.unwrap()).unwrap();
    assert!(!json.contains(SECRET));

    let updated = service
        .update(
            created.id,
            SubscriptionPatch {
                url: Some("https://example.com/b".to_string()),
                events: Some(EventFilter::All),
                content_type: Some(ContentType::Form),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.url, "https://example.com/b");
    assert_eq!(updated.events, EventFilter::All);
    assert_eq!(updated.content_type, ContentType::Form);
    assert!(updated.has_secret());
    assert!(updated.updated_at >= created.updated_at);

    let err = service
        .update(
            created.id,
            SubscriptionPatch {
                secret: Some(Secret::new("tiny")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSecret { .. }));

    let err = service
        .update(
            created.id,
            SubscriptionPatch {
                secret: Some(Secret::default()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Validation(_)));
    assert!(service.get(created.id).await.unwrap().has_secret());

    // Rotating to another valid secret is fine.
    let rotated = service
        .update(
            created.id,
            SubscriptionPatch {
                secret: Some(Secret::new("whsec_rotated_secret_value")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(rotated.has_secret());

    let other = service
        .create(NewSubscription::new(Owner::Organization(10), "https://example.com/c"))
        .await
        .unwrap();
    service
        .create(NewSubscription::new(Owner::User(10), "https://example.com/d"))
        .await
        .unwrap();
    assert_eq!(service.list_for_owner(Owner::Organization(10)).await.unwrap().len(), 2);

    service.delete(other.id).await.unwrap();
    assert!(matches!(service.get(other.id).await, Err(WebhookError::SubscriptionNotFound)));
    assert!(matches!(service.delete(other.id).await, Err(WebhookError::SubscriptionNotFound)));

    let owned = service.list_for_owner(Owner::Organization(10)).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, created.id);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let harness = Harness::new(test_config());

    assert!(matches!(
        harness.service.get(SubscriptionId::generate()).await,
        Err(WebhookError::SubscriptionNotFound)
    ));
    assert!(matches!(
        harness.service.get_delivery(DeliveryId::generate()).await,
        Err(WebhookError::DeliveryNotFound)
    ));
    assert!(matches!(
        harness.service.redeliver(DeliveryId::generate()).await,
        Err(WebhookError::DeliveryNotFound)
    ));
}

#[tokio::test]
async fn test_delivery_bypasses_filter_and_is_recorded() {
    let responder = RecordingResponder::ok();
    let (_server, url) = endpoint(responder.clone()).await;
    let harness = Harness::new(test_config());

    // Inactive and filtered: still reachable through a test delivery.
    let sub = harness
        .service
        .create(
            NewSubscription::new(Owner::User(2), url)
                .with_secret(SECRET)
                .with_events(EventFilter::only([EventType::CommentDeleted]))
                .with_active(false),
        )
        .await
        .unwrap();

    let delivery = harness.service.test_delivery(sub.id).await.unwrap();
    assert!(delivery.success);
    assert_eq!(delivery.event_type, EventType::Test);

    let request = &responder.requests()[0];
    let body = request.body_json();
    assert_eq!(body["event"]["type"], "test");
    assert_eq!(body["event"]["actor"]["kind"], "system");
    assert_eq!(body["event"]["data"]["subscription_id"], sub.id.to_string());
    assert!(request.header(SIGNATURE_256_HEADER).is_some());

    let history = harness.service.list_deliveries(sub.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, delivery.id);
}

#[tokio::test]
async fn failed_test_delivery_is_reported_and_not_retried() {
    let responder = RecordingResponder::with_status(404);
    let (_server, url) = endpoint(responder).await;
    let harness = Harness::new(test_config());

    let sub = harness
        .service
        .create(NewSubscription::new(Owner::User(2), url))
        .await
        .unwrap();

    let err = harness.service.test_delivery(sub.id).await.unwrap_err();
    assert!(matches!(err, WebhookError::TestDeliveryFailed(DeliveryFailure::Http(404))));

    let history = harness.service.list_deliveries(sub.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].next_retry_at, None);
}

#[tokio::test]
async fn history_is_newest_first_and_limited() {
    let responder = RecordingResponder::ok();
    let (_server, url) = endpoint(responder).await;
    let harness = Harness::new(test_config());

    let sub = harness
        .service
        .create(NewSubscription::new(Owner::User(2), url))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(harness.service.test_delivery(sub.id).await.unwrap().id);
    }

    let history = harness.service.list_deliveries(sub.id, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, ids[2]);
    assert_eq!(history[1].id, ids[1]);
}

#[tokio::test]
async fn manual_redelivery_replays_stored_payload() {
    let responder = RecordingResponder::fail_times(1);
    let (_server, url) = endpoint(responder.clone()).await;
    let harness = Harness::new(test_config());

    let sub = harness
        .service
        .create(NewSubscription::new(Owner::User(2), url).with_secret(SECRET))
        .await
        .unwrap();
    let event = gist_webhooks::Event::new(
        EventType::GistDeleted,
        gist_webhooks::Actor::user(2, "bob", None),
        Default::default(),
    );
    let first = harness.executor.deliver(&sub, &event).await;
    assert!(!first.outcome.is_delivered());

    let replay = harness.service.redeliver(first.delivery.id).await.unwrap();
    assert_eq!(replay.outcome, DeliveryOutcome::Delivered { status: 200 });
    assert_eq!(replay.delivery.id, first.delivery.id);
    assert_eq!(replay.delivery.attempt_count, 2);

    let requests = responder.requests();
    assert_eq!(requests[0].body, requests[1].body);

    let stored = harness.service.get_delivery(first.delivery.id).await.unwrap();
    assert!(stored.success);
    assert_eq!(stored.next_retry_at, None);
}

#[tokio::test]
async fn redelivery_for_deleted_subscription_is_refused() {
    let responder = RecordingResponder::with_status(500);
    let (_server, url) = endpoint(responder.clone()).await;
    let harness = Harness::new(test_config());

    let sub = harness
        .service
        .create(NewSubscription::new(Owner::User(2), url))
        .await
        .unwrap();
    let event = gist_webhooks::Event::new(
        EventType::GistCreated,
        gist_webhooks::Actor::system(),
        Default::default(),
    );
    let first = harness.executor.deliver(&sub, &event).await;
    harness.service.delete(sub.id).await.unwrap();

    assert!(matches!(
        harness.service.redeliver(first.delivery.id).await,
        Err(WebhookError::SubscriptionNotFound)
    ));
    assert_eq!(responder.count(), 1);
}
