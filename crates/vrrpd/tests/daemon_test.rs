//! Configuration through the engine to the status endpoint

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceExt;
use vrrp::{
    AdapterError, CaptureBinding, EngineSettings, InterfaceEvent, SwitchAdapter, VrrpServer,
};
use vrrpd::{Config, MetricsRegistry, StatusServer};

#[derive(Default)]
struct SilentBinding {
    closed: Notify,
}

#[async_trait]
impl CaptureBinding for SilentBinding {
    fn name(&self) -> &str {
        "eth1"
    }

    async fn recv(&self) -> Result<Bytes, AdapterError> {
        self.closed.notified().await;
        Err(AdapterError::Closed)
    }

    fn send(&self, _payload: &[u8]) -> Result<(), AdapterError> {
        Ok(())
    }

    fn close(&self) {
        self.closed.notify_one();
    }
}

struct SilentAdapter;

#[async_trait]
impl SwitchAdapter for SilentAdapter {
    async fn resolve_interface_name(&self, _if_index: i32) -> Result<String, AdapterError> {
        Ok("eth1".to_string())
    }

    async fn open_capture(
        &self,
        _name: &str,
        _filter: &str,
    ) -> Result<Arc<dyn CaptureBinding>, AdapterError> {
        Ok(Arc::new(SilentBinding::default()))
    }

    async fn program_protocol_filter(&self, _enable: bool) -> Result<(), AdapterError> {
        Ok(())
    }
}

const CONFIG: &str = r#"
server:
  channel_size: 64
  status_listen: "127.0.0.1:0"

interfaces:
  - if_index: 3
    name: eth1
    address: 10.0.0.5

instances:
  - if_index: 3
    vrid: 10
    priority: 255
    virtual_ip: 10.0.0.254
  - if_index: 3
    vrid: 11
    virtual_ip: 10.0.0.253
"#;

#[tokio::test]
async fn test_configured_instances_visible_over_http() {
    let path = std::env::temp_dir().join(format!("vrrpd-test-{}.yaml", std::process::id()));
    std::fs::write(&path, CONFIG).unwrap();
    let config = Config::load_from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let settings = EngineSettings {
        channel_size: config.server.channel_size,
        ..config.engine_settings()
    };
    let server = VrrpServer::spawn(Arc::new(SilentAdapter), Vec::new(), settings);
    server.wait_ready().await.unwrap();

    let interface = &config.interfaces[0];
    server
        .notify_interface(InterfaceEvent::AddressAssigned {
            if_index: interface.if_index,
            address: interface.address.unwrap(),
        })
        .await
        .unwrap();
    for instance in &config.instances {
        server.create_instance(instance.to_config()).await.unwrap();
    }

    let status = StatusServer::new(
        server.registry(),
        server.drop_counters(),
        Arc::new(MetricsRegistry::new()),
        config.server.status_listen.clone(),
    );
    let response = status
        .router()
        .oneshot(Request::builder().uri("/state?count=10").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let page: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(page["count"], 2);
    assert_eq!(page["entries"][0]["vrid"], 10);
    assert_eq!(page["entries"][0]["state"], "MASTER");
    assert_eq!(page["entries"][0]["bound_address"], "10.0.0.5");
    assert_eq!(page["entries"][1]["state"], "BACKUP");

    server.shutdown().await;
}
