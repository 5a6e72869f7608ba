use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use meter_client::domain::{Meter, MeterKey};
use reqwest::Client;
use serde::Deserialize;

use super::{TransportError, UploadAck, UploadBatch, UploadTransport};
use crate::store::{ConfigSnapshot, ConfigSource, StoreError};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const MAX_CONFIG_PAGES: usize = 10_000;

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Deserialize)]
struct AckBody {
    #[serde(default)]
    processed: Option<u64>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Posts upload batches as JSON to the central ingestion endpoint.
pub struct HttpUploadTransport {
    client: Client,
    url: String,
}

impl HttpUploadTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn submit(
        &self,
        batch: &UploadBatch,
        api_key: &str,
    ) -> Result<UploadAck, TransportError> {
        let resp = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, api_key)
            .header(IDEMPOTENCY_HEADER, &batch.batch_id)
            .json(batch)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        // An empty or non-JSON 2xx body still acknowledges the whole batch.
        let body = resp.bytes().await?;
        let ack: Option<AckBody> = serde_json::from_slice(&body).ok();
        match ack {
            Some(AckBody {
                success: Some(false),
                error,
                ..
            }) => Err(TransportError::Rejected(
                error.unwrap_or_else(|| "no reason given".to_string()),
            )),
            Some(AckBody {
                processed: Some(processed),
                ..
            }) => Ok(UploadAck { processed }),
            _ => Ok(UploadAck {
                processed: batch.reading_count as u64,
            }),
        }
    }
}

/// Pulls tenant configuration from the central REST API, one meter page at a time.
pub struct HttpConfigSource {
    client: Client,
    url: String,
}

impl HttpConfigSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }

    async fn fetch_page(
        &self,
        api_key: &str,
        page: usize,
        page_size: usize,
    ) -> Result<ConfigSnapshot, TransportError> {
        let resp = self
            .client
            .get(&self.url)
            .header(API_KEY_HEADER, api_key)
            .query(&[("page", page), ("page_size", page_size)])
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<ConfigSnapshot>().await?)
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch_config(
        &self,
        api_key: &str,
        page_size: usize,
    ) -> Result<ConfigSnapshot, StoreError> {
        let page_size = page_size.max(1);
        let remote = |e: TransportError| StoreError::Unavailable(e.to_string());

        let mut snapshot = self.fetch_page(api_key, 0, page_size).await.map_err(remote)?;
        let mut meters: HashSet<MeterKey> = snapshot.meters.iter().map(Meter::key).collect();
        let mut registers: HashSet<i64> =
            snapshot.registers.iter().map(|r| r.register_id).collect();
        let mut device_registers: HashSet<i64> =
            snapshot.device_registers.iter().map(|r| r.device_register_id).collect();

        let mut last_len = snapshot.meters.len();
        let mut page = 1;
        while last_len >= page_size {
            if page >= MAX_CONFIG_PAGES {
                tracing::warn!(
                    pages = page,
                    meters = meters.len(),
                    "configuration paging cap reached"
                );
                break;
            }
            let next = self.fetch_page(api_key, page, page_size).await.map_err(remote)?;
            last_len = next.meters.len();

            let before = meters.len();
            for meter in next.meters {
                if meters.insert(meter.key()) {
                    snapshot.meters.push(meter);
                }
            }
            for row in next.registers {
                if registers.insert(row.register_id) {
                    snapshot.registers.push(row);
                }
            }
            for row in next.device_registers {
                if device_registers.insert(row.device_register_id) {
                    snapshot.device_registers.push(row);
                }
            }
            if meters.len() == before {
                tracing::debug!(page, "configuration page added no meters, paging stopped");
                break;
            }
            page += 1;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MeterRecord;
    use axum::{
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use std::{collections::HashMap, sync::Arc};
    use time::macros::datetime;

    const TIMEOUT: Duration = Duration::from_secs(5);

    type Seen = Arc<parking_lot::Mutex<Vec<(String, String, serde_json::Value)>>>;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn batch() -> UploadBatch {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("voltage_a_n".to_string(), 230.0);
        UploadBatch {
            batch_id: "abc".to_string(),
            records: vec![MeterRecord {
                meter_id: 1,
                meter_element_id: 1,
                timestamp: datetime!(2024-05-01 12:00:00 UTC),
                fields,
            }],
            reading_count: 1,
        }
    }

    #[tokio::test]
    async fn upload_sends_api_key_and_idempotency_key() {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route(
                "/readings",
                post(
                    |State(seen): State<Seen>,
                     headers: HeaderMap,
                     Json(body): Json<serde_json::Value>| async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        let keys = (header(API_KEY_HEADER), header(IDEMPOTENCY_HEADER));
                        seen.lock().push((keys.0, keys.1, body));
                        Json(serde_json::json!({ "processed": 1 }))
                    },
                ),
            )
            .with_state(Arc::clone(&seen));
        let base = serve(router).await;

        let transport = HttpUploadTransport::new(format!("{base}/readings"), TIMEOUT).unwrap();
        let ack = transport.submit(&batch(), "secret").await.unwrap();

        assert_eq!(ack.processed, 1);
        let seen = seen.lock();
        assert_eq!(seen[0].0, "secret");
        assert_eq!(seen[0].1, "abc");
        assert_eq!(seen[0].2["records"][0]["voltage_a_n"], 230.0);
    }

    #[tokio::test]
    async fn upload_maps_error_status() {
        let router = Router::new().route(
            "/readings",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let base = serve(router).await;

        let transport = HttpUploadTransport::new(format!("{base}/readings"), TIMEOUT).unwrap();
        match transport.submit(&batch(), "k").await {
            Err(TransportError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_respects_explicit_rejection() {
        let router = Router::new().route(
            "/readings",
            post(|| async { Json(serde_json::json!({ "success": false, "error": "bad tenant" })) }),
        );
        let base = serve(router).await;

        let transport = HttpUploadTransport::new(format!("{base}/readings"), TIMEOUT).unwrap();
        assert!(matches!(
            transport.submit(&batch(), "k").await,
            Err(TransportError::Rejected(reason)) if reason == "bad tenant"
        ));
    }

    #[tokio::test]
    async fn config_source_pages_meters_and_coerces_text_ids() {
        let router = Router::new().route(
            "/config",
            get(|Query(q): Query<HashMap<String, usize>>| async move {
                let page = q.get("page").copied().unwrap_or(0);
                let meters = match page {
                    0 => serde_json::json!([
                        {"meter_id": "1", "meter_element_id": "1", "device_id": "10", "name": "a", "active": true, "ip": "10.0.0.1", "port": "502", "element": null},
                        {"meter_id": "2", "meter_element_id": "1", "device_id": "20", "name": "b", "active": true, "ip": "10.0.0.2", "port": 502, "element": null}
                    ]),
                    1 => serde_json::json!([
                        {"meter_id": 3, "meter_element_id": 1, "device_id": 30, "name": "c", "active": false, "ip": null, "port": null, "element": null}
                    ]),
                    _ => serde_json::json!([]),
                };
                Json(serde_json::json!({
                    "tenant": {"tenant_id": "5", "api_key": "k", "download_batch_size": 2, "upload_batch_size": "50"},
                    "meters": meters,
                    "registers": [{"register_id": 1, "name": "Voltage A-N", "register": "10", "unit": "V", "field_name": "voltage_a_n"}],
                    "device_registers": [{"device_register_id": 1, "device_id": 10, "register_id": 1}]
                }))
            }),
        );
        let base = serve(router).await;

        let source = HttpConfigSource::new(format!("{base}/config"), TIMEOUT).unwrap();
        let snapshot = source.fetch_config("k", 2).await.unwrap();

        assert_eq!(snapshot.tenant.tenant_id, 5);
        assert_eq!(snapshot.tenant.upload_batch_size, 50);
        assert_eq!(snapshot.meters.len(), 3);
        assert_eq!(snapshot.registers[0].register, 10);
        assert_eq!(snapshot.registers[0].scale, 1.0);
        assert_eq!(snapshot.device_registers.len(), 1);
    }

    #[tokio::test]
    async fn config_source_stops_when_server_ignores_paging() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let router = Router::new().route(
            "/config",
            get(move |Query(q): Query<HashMap<String, usize>>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let page = q.get("page").copied().unwrap_or(0);
                    let extra_register = serde_json::json!({
                        "register_id": 2, "name": "Current A", "register": 11, "unit": "A", "field_name": "current_line_a"
                    });
                    let mut registers = vec![serde_json::json!({
                        "register_id": 1, "name": "Voltage A-N", "register": 10, "unit": "V", "field_name": "voltage_a_n"
                    })];
                    if page > 0 {
                        registers.push(extra_register);
                    }
                    Json(serde_json::json!({
                        "tenant": {"tenant_id": 5, "api_key": "k", "download_batch_size": 2, "upload_batch_size": 50},
                        "meters": [
                            {"meter_id": 1, "meter_element_id": 1, "device_id": 10, "name": "a", "active": true, "ip": "10.0.0.1", "port": 502, "element": null},
                            {"meter_id": 2, "meter_element_id": 1, "device_id": 20, "name": "b", "active": true, "ip": "10.0.0.2", "port": 502, "element": null}
                        ],
                        "registers": registers,
                        "device_registers": [{"device_register_id": page + 1, "device_id": 10, "register_id": 1}]
                    }))
                }
            }),
        );
        let base = serve(router).await;

        let source = HttpConfigSource::new(format!("{base}/config"), TIMEOUT).unwrap();
        let snapshot = source.fetch_config("k", 2).await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(snapshot.meters.len(), 2);
        assert_eq!(snapshot.registers.len(), 2);
        assert_eq!(snapshot.device_registers.len(), 2);
    }
}
