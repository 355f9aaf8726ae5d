//! Helpers for testing against a mocked API server.

use http::{Method, Request, Response};
use hyper::Body;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{core::ObjectMeta, Client, Resource as _};
use serde_json::{json, Value};

use crate::resources::{SwiftStorage, SwiftStorageSpec};

pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Scripted stand-in for the API server, answering one request at a time
pub struct ApiServerVerifier(ApiServerHandle);

/// A request as seen by the mocked API server
#[derive(Debug)]
pub struct Captured {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: Option<Value>,
}

/// A real `kube::Client` wired to a scripted API server
pub fn mock_client() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), ApiServerVerifier(handle))
}

impl ApiServerVerifier {
    async fn next(&mut self) -> (Captured, tower_test::mock::SendResponse<Response<Body>>) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or_default().to_string();

        let bytes = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let body = (!bytes.is_empty())
            .then(|| serde_json::from_slice(&bytes).expect("request body is json"));

        (
            Captured {
                method,
                path,
                query,
                body,
            },
            send,
        )
    }

    /// Answer the next request with a fixed status and body
    pub async fn respond(&mut self, status: u16, response: Value) -> Captured {
        let (captured, send) = self.next().await;
        send.send_response(
            Response::builder()
                .status(status)
                .body(Body::from(serde_json::to_vec(&response).unwrap()))
                .unwrap(),
        );
        captured
    }

    /// Answer the next request by echoing its body back, as a create or apply would
    pub async fn echo(&mut self, status: u16) -> Captured {
        let (captured, send) = self.next().await;
        let response = captured.body.clone().unwrap_or_else(|| json!({}));
        send.send_response(
            Response::builder()
                .status(status)
                .body(Body::from(serde_json::to_vec(&response).unwrap()))
                .unwrap(),
        );
        captured
    }

    /// Accept the next request and never answer it
    pub async fn hold(mut self) {
        let (_captured, _send) = self.next().await;
        std::future::pending::<()>().await
    }

    /// Fail if another request shows up shortly
    pub async fn assert_no_more_requests(&mut self) {
        let next = tokio::time::timeout(std::time::Duration::from_millis(100), self.0.next_request());
        if let Ok(Some((request, _))) = next.await {
            panic!("unexpected request {} {}", request.method(), request.uri());
        }
    }
}

/// Wait for a spawned scenario, failing the test if it hangs or panicked
pub async fn timeout_after_1s<T>(handle: tokio::task::JoinHandle<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// The body of a `metav1.Status` failure, as returned by the API server
pub fn status_error(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{reason} ({code})"),
        "reason": reason,
        "code": code,
    })
}

pub fn swift_storage() -> SwiftStorage {
    SwiftStorage {
        metadata: ObjectMeta {
            name: Some("swift".into()),
            namespace: Some("openstack".into()),
            uid: Some("storage-uid".into()),
            generation: Some(1),
            resource_version: Some("7".into()),
            ..Default::default()
        },
        spec: SwiftStorageSpec {
            replicas: 3,
            storage_class_name: Some("fast".into()),
            swift_ring_config_map: "ring-1".into(),
            ..Default::default()
        },
        status: None,
    }
}

pub fn owner_ref(storage: &SwiftStorage) -> OwnerReference {
    storage
        .controller_owner_ref(&())
        .expect("fixture storage has a uid")
}
