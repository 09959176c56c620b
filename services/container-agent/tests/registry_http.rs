//! Integration tests for the thin-edge.io HTTP registry adapter against a
//! mock HTTP server standing in for the entity store and the cloud proxy.

use serde_json::json;
use tedge_container_agent::config::{ClientConfig, Endpoint};
use tedge_container_agent::registry::{Entity, Registry, TedgeRegistry, Target};
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn device() -> Target {
    Target::new("te", "device/main//").with_cloud_identity("dev01")
}

fn registry(server: &MockServer) -> TedgeRegistry {
    let port = server.address().port();
    let config = ClientConfig {
        http: Endpoint {
            host: "127.0.0.1".to_string(),
            port,
        },
        c8y: Endpoint {
            host: "127.0.0.1".to_string(),
            port,
        },
        ..ClientConfig::default()
    };
    let (tx, _rx) = mpsc::channel(1);
    let (registry, _session) =
        TedgeRegistry::new(&config, device().service("tedge-container-plugin"), tx).unwrap();
    registry
}

#[tokio::test]
async fn test_register_accepts_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/te/v1/entities"))
        .and(body_partial_json(json!({
            "@type": "service",
            "@topic-id": "device/main/service/app",
            "@parent": "device/main//",
            "name": "app",
            "type": "container",
        })))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&server)
        .await;

    let device = device();
    let entity = Entity::service(&device.service("app"), &device, "app", "container");
    registry(&server).register(&entity).await.unwrap();
}

#[tokio::test]
async fn test_register_fails_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/te/v1/entities"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let device = device();
    let entity = Entity::service(&device.service("app"), &device, "app", "container");
    let err = registry(&server).register(&entity).await.unwrap_err();
    assert!(err.to_string().contains("register entity"), "got {err}");
}

#[tokio::test]
async fn test_deregister_tolerates_missing_entity() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/te/v1/entities/device/main/service/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    registry(&server)
        .deregister(&device().service("gone"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_has_entity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/te/v1/entities/device/main/service/app"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"@topic-id": "device/main/service/app"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/te/v1/entities/device/main/service/other"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = registry(&server);
    assert!(registry.has_entity(&device().service("app")).await.unwrap());
    assert!(!registry.has_entity(&device().service("other")).await.unwrap());
}

#[tokio::test]
async fn test_update_twin() {
    let server = MockServer::start().await;
    let value = json!({"containerId": "abc", "image": "nginx:1"});
    Mock::given(method("PUT"))
        .and(path("/te/v1/entities/device/main/service/app/twin/container"))
        .and(body_json(value.clone()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    registry(&server)
        .update_twin(&device().service("app"), "container", &value)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_entities_reads_type_from_twin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/te/v1/entities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"@topic-id": "device/main//", "@type": "device"},
            {"@topic-id": "device/main/service/app", "@type": "service", "@parent": "device/main//"},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/te/v1/entities/device/main/service/app/twin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"type": "container", "name": "app"})))
        .mount(&server)
        .await;

    // the device has no twin mock and is skipped
    let entities = registry(&server).list_entities().await.unwrap();
    assert_eq!(entities.len(), 1);
    let app = &entities["device/main/service/app"];
    assert_eq!(app.service_type, "container");
    assert_eq!(app.parent, "device/main//");
}

#[tokio::test]
async fn test_delete_remote_object() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c8y/identity/externalIds/c8y_Serial/dev01:device:main:service:app"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "externalId": "dev01:device:main:service:app",
            "managedObject": {"id": "12345"},
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/c8y/inventory/managedObjects/12345"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/c8y/identity/externalIds/c8y_Serial/dev01:device:main:service:gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = registry(&server);
    assert!(registry.delete_remote_object(&device().service("app")).await.unwrap());
    assert!(!registry.delete_remote_object(&device().service("gone")).await.unwrap());
}

#[tokio::test]
async fn test_list_cloud_services() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c8y/identity/externalIds/c8y_Serial/dev01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"managedObject": {"id": "100"}})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/c8y/inventory/managedObjects/100/childAdditions"))
        .and(query_param("pageSize", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "references": [
                {"managedObject": {"id": "1001", "name": "app", "serviceType": "container"}},
                {"managedObject": {"id": "1002", "name": "shop", "serviceType": "container-group"}},
            ]
        })))
        .mount(&server)
        .await;

    let services = registry(&server).list_cloud_services(&device()).await.unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[0].id, "1001");
    assert_eq!(services[1].name, "shop");
    assert_eq!(services[1].service_type, "container-group");
}

#[tokio::test]
async fn test_lookup_cloud_identity_strips_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c8y/user/currentUser"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userName": "device_dev01"})))
        .mount(&server)
        .await;

    let identity = registry(&server).lookup_cloud_identity().await.unwrap();
    assert_eq!(identity, "dev01");
}
