//! REST client for the volume storage service.

use async_trait::async_trait;
use berth_core::{ByteStream, DriverVolume, Encoding, Handle, Strategy, VolumeDriver, VolumeSpec};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::{DriverError, DriverResult};

/// Streams can run for a long time, so only connecting is bounded.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CreateVolumeRequest<'a> {
    handle: &'a Handle,
    strategy: &'a Strategy,
    privileged: bool,
    properties: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct VolumeResponse {
    handle: Handle,
    path: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrivilegedBody {
    privileged: bool,
}

#[derive(Clone)]
struct Endpoint {
    client: Client,
    base_url: Url,
}

impl Endpoint {
    fn url(&self, segments: &[&str]) -> DriverResult<Url> {
        append_segments(&self.base_url, segments)
    }

    fn volume_url(&self, handle: &Handle, segments: &[&str]) -> DriverResult<Url> {
        let mut all = vec!["volumes", handle.as_str()];
        all.extend_from_slice(segments);
        self.url(&all)
    }

    async fn send(&self, request: RequestBuilder) -> DriverResult<Response> {
        check(request.send().await?).await
    }
}

async fn check(response: Response) -> DriverResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(DriverError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

fn append_segments(base: &Url, segments: &[&str]) -> DriverResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DriverError::InvalidBaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Volume driver talking to a volume storage service over HTTP.
pub struct HttpVolumeDriver {
    endpoint: Endpoint,
}

impl HttpVolumeDriver {
    pub fn new(base_url: Url) -> DriverResult<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: Url) -> Self {
        Self {
            endpoint: Endpoint { client, base_url },
        }
    }

    pub async fn create(&self, handle: &Handle, spec: &VolumeSpec) -> DriverResult<HttpVolume> {
        let url = self.endpoint.url(&["volumes"])?;
        debug!(volume = %handle, url = %url, strategy = ?spec.strategy, "Creating volume");

        let request = self.endpoint.client.post(url).json(&CreateVolumeRequest {
            handle,
            strategy: &spec.strategy,
            privileged: spec.privileged,
            properties: &spec.properties,
        });
        let volume: VolumeResponse = self.endpoint.send(request).await?.json().await?;
        Ok(HttpVolume::new(self.endpoint.clone(), volume))
    }

    pub async fn lookup(&self, handle: &Handle) -> DriverResult<Option<HttpVolume>> {
        let url = self.endpoint.volume_url(handle, &[])?;
        let response = self.endpoint.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let volume: VolumeResponse = check(response).await?.json().await?;
        Ok(Some(HttpVolume::new(self.endpoint.clone(), volume)))
    }
}

#[async_trait]
impl VolumeDriver for HttpVolumeDriver {
    async fn create_volume(
        &self,
        handle: &Handle,
        spec: &VolumeSpec,
    ) -> berth_core::Result<Arc<dyn DriverVolume>> {
        Ok(Arc::new(self.create(handle, spec).await?))
    }

    async fn lookup_volume(
        &self,
        handle: &Handle,
    ) -> berth_core::Result<Option<Arc<dyn DriverVolume>>> {
        Ok(self
            .lookup(handle)
            .await?
            .map(|volume| Arc::new(volume) as Arc<dyn DriverVolume>))
    }
}

/// A volume on the storage service.
pub struct HttpVolume {
    endpoint: Endpoint,
    handle: Handle,
    path: String,
}

impl HttpVolume {
    fn new(endpoint: Endpoint, volume: VolumeResponse) -> Self {
        Self {
            endpoint,
            handle: volume.handle,
            path: volume.path,
        }
    }

    fn url(&self, segments: &[&str]) -> DriverResult<Url> {
        self.endpoint.volume_url(&self.handle, segments)
    }
}

#[async_trait]
impl DriverVolume for HttpVolume {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn path(&self) -> &str {
        &self.path
    }

    async fn properties(&self) -> berth_core::Result<BTreeMap<String, String>> {
        let url = self.url(&[])?;
        let response = self.endpoint.send(self.endpoint.client.get(url)).await?;
        let volume: VolumeResponse = response.json().await.map_err(DriverError::from)?;
        Ok(volume.properties)
    }

    async fn set_property(&self, name: &str, value: &str) -> berth_core::Result<()> {
        let url = self.url(&["properties", name])?;
        self.endpoint
            .send(self.endpoint.client.put(url).body(value.to_string()))
            .await?;
        Ok(())
    }

    async fn privileged(&self) -> berth_core::Result<bool> {
        let url = self.url(&["privileged"])?;
        let response = self.endpoint.send(self.endpoint.client.get(url)).await?;
        let body: PrivilegedBody = response.json().await.map_err(DriverError::from)?;
        Ok(body.privileged)
    }

    async fn set_privileged(&self, privileged: bool) -> berth_core::Result<()> {
        let url = self.url(&["privileged"])?;
        self.endpoint
            .send(self.endpoint.client.put(url).json(&PrivilegedBody { privileged }))
            .await?;
        Ok(())
    }

    async fn stream_in(
        &self,
        path: &str,
        encoding: Encoding,
        content: ByteStream,
    ) -> berth_core::Result<()> {
        let mut url = self.url(&["stream-in"])?;
        url.query_pairs_mut().append_pair("path", path);
        debug!(volume = %self.handle, path, encoding = encoding.as_str(), "Streaming in");

        let request = self
            .endpoint
            .client
            .put(url)
            .header(header::CONTENT_ENCODING, encoding.as_str())
            .body(Body::wrap_stream(content));
        self.endpoint.send(request).await?;
        Ok(())
    }

    async fn stream_out(&self, path: &str, encoding: Encoding) -> berth_core::Result<ByteStream> {
        let mut url = self.url(&["stream-out"])?;
        url.query_pairs_mut().append_pair("path", path);
        debug!(volume = %self.handle, path, encoding = encoding.as_str(), "Streaming out");

        let request = self
            .endpoint
            .client
            .get(url)
            .header(header::ACCEPT_ENCODING, encoding.as_str());
        let response = self.endpoint.send(request).await?;
        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }

    async fn stream_in_p2p_url(&self, path: &str) -> berth_core::Result<String> {
        let url = self.endpoint.url(&["p2p-url"])?;
        let response = self.endpoint.send(self.endpoint.client.get(url)).await?;
        let base = response.text().await.map_err(DriverError::from)?;
        let base = Url::parse(base.trim()).map_err(DriverError::from)?;

        let mut url = append_segments(&base, &["volumes", self.handle.as_str(), "stream-in"])?;
        url.query_pairs_mut().append_pair("path", path);
        Ok(url.to_string())
    }

    async fn stream_p2p_out(
        &self,
        path: &str,
        dest_url: &str,
        encoding: Encoding,
    ) -> berth_core::Result<()> {
        let mut url = self.url(&["stream-p2p-out"])?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("streamInURL", dest_url)
            .append_pair("encoding", encoding.as_str());
        debug!(volume = %self.handle, path, dest_url, "Streaming peer to peer");

        self.endpoint.send(self.endpoint.client.put(url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::response::{IntoResponse, Response as HttpResponse};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use bytes::Bytes;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StoredVolume {
        properties: BTreeMap<String, String>,
        privileged: bool,
        content: Vec<u8>,
        content_encoding: Option<String>,
    }

    /// In-process volume service recording what the client sent.
    #[derive(Default)]
    struct VolumeService {
        volumes: HashMap<String, StoredVolume>,
        accept_encodings: Vec<String>,
        p2p_pushes: Vec<HashMap<String, String>>,
    }

    type Shared = Arc<Mutex<VolumeService>>;

    fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn volume_json(handle: &str, volume: &StoredVolume) -> serde_json::Value {
        serde_json::json!({
            "handle": handle,
            "path": format!("/data/volumes/{}", handle),
            "properties": volume.properties,
        })
    }

    async fn create_volume(
        State(service): State<Shared>,
        Json(body): Json<serde_json::Value>,
    ) -> HttpResponse {
        let handle = body["handle"].as_str().unwrap_or_default().to_string();
        if handle == "full" {
            return (HttpStatus::INTERNAL_SERVER_ERROR, "disk full").into_response();
        }
        let volume = StoredVolume {
            privileged: body["privileged"].as_bool().unwrap_or(false),
            ..Default::default()
        };
        let json = volume_json(&handle, &volume);
        service.lock().unwrap().volumes.insert(handle, volume);
        (HttpStatus::CREATED, Json(json)).into_response()
    }

    async fn get_volume(State(service): State<Shared>, Path(handle): Path<String>) -> HttpResponse {
        match service.lock().unwrap().volumes.get(&handle) {
            Some(volume) => Json(volume_json(&handle, volume)).into_response(),
            None => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn set_property(
        State(service): State<Shared>,
        Path((handle, name)): Path<(String, String)>,
        value: String,
    ) -> HttpStatus {
        let mut service = service.lock().unwrap();
        let Some(volume) = service.volumes.get_mut(&handle) else {
            return HttpStatus::NOT_FOUND;
        };
        volume.properties.insert(name, value);
        HttpStatus::NO_CONTENT
    }

    async fn get_privileged(State(service): State<Shared>, Path(handle): Path<String>) -> HttpResponse {
        match service.lock().unwrap().volumes.get(&handle) {
            Some(volume) => Json(PrivilegedBody {
                privileged: volume.privileged,
            })
            .into_response(),
            None => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn set_privileged(
        State(service): State<Shared>,
        Path(handle): Path<String>,
        Json(body): Json<PrivilegedBody>,
    ) -> HttpStatus {
        let mut service = service.lock().unwrap();
        let Some(volume) = service.volumes.get_mut(&handle) else {
            return HttpStatus::NOT_FOUND;
        };
        volume.privileged = body.privileged;
        HttpStatus::NO_CONTENT
    }

    async fn stream_in(
        State(service): State<Shared>,
        Path(handle): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> HttpStatus {
        if query.get("path").map(String::as_str) != Some(".") {
            return HttpStatus::BAD_REQUEST;
        }
        let mut service = service.lock().unwrap();
        let Some(volume) = service.volumes.get_mut(&handle) else {
            return HttpStatus::NOT_FOUND;
        };
        volume.content = body.to_vec();
        volume.content_encoding = header_value(&headers, header::CONTENT_ENCODING);
        HttpStatus::NO_CONTENT
    }

    async fn stream_out(
        State(service): State<Shared>,
        Path(handle): Path<String>,
        headers: HeaderMap,
    ) -> HttpResponse {
        let mut service = service.lock().unwrap();
        if let Some(encoding) = header_value(&headers, header::ACCEPT_ENCODING) {
            service.accept_encodings.push(encoding);
        }
        match service.volumes.get(&handle) {
            Some(volume) => volume.content.clone().into_response(),
            None => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn p2p_url() -> &'static str {
        "http://10.1.2.3:7788/\n"
    }

    async fn stream_p2p_out(
        State(service): State<Shared>,
        Path(handle): Path<String>,
        Query(mut query): Query<HashMap<String, String>>,
    ) -> HttpStatus {
        query.insert("handle".to_string(), handle);
        service.lock().unwrap().p2p_pushes.push(query);
        HttpStatus::NO_CONTENT
    }

    /// Serve the fake service on a random local port.
    async fn serve() -> (HttpVolumeDriver, Shared) {
        let service = Shared::default();
        let app = Router::new()
            .route("/volumes", post(create_volume))
            .route("/volumes/{handle}", get(get_volume))
            .route("/volumes/{handle}/properties/{name}", put(set_property))
            .route(
                "/volumes/{handle}/privileged",
                get(get_privileged).put(set_privileged),
            )
            .route("/volumes/{handle}/stream-in", put(stream_in))
            .route("/volumes/{handle}/stream-out", get(stream_out))
            .route("/volumes/{handle}/stream-p2p-out", put(stream_p2p_out))
            .route("/p2p-url", get(p2p_url))
            .with_state(service.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let base = Url::parse(&format!("http://{}/", addr)).unwrap();
        (HttpVolumeDriver::new(base).unwrap(), service)
    }

    #[test]
    fn test_volume_urls() {
        let endpoint = Endpoint {
            client: Client::new(),
            base_url: Url::parse("http://10.0.0.1:7788/api/").unwrap(),
        };
        let handle = Handle::from("vol 1");

        assert_eq!(
            endpoint.volume_url(&handle, &["properties", "ttl"]).unwrap().as_str(),
            "http://10.0.0.1:7788/api/volumes/vol%201/properties/ttl"
        );
        assert_eq!(
            endpoint.url(&["volumes"]).unwrap().as_str(),
            "http://10.0.0.1:7788/api/volumes"
        );
    }

    #[test]
    fn test_cannot_be_a_base_url_is_rejected() {
        let base = Url::parse("data:text/plain,hi").unwrap();
        assert!(matches!(
            append_segments(&base, &["volumes"]),
            Err(DriverError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_create_request_body() {
        let spec = VolumeSpec::cow(Handle::from("parent"), true);
        let body = serde_json::to_value(CreateVolumeRequest {
            handle: &Handle::from("child"),
            strategy: &spec.strategy,
            privileged: spec.privileged,
            properties: &spec.properties,
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "handle": "child",
                "strategy": {"type": "cow", "parent": "parent"},
                "privileged": true,
                "properties": {}
            })
        );
    }

    #[test]
    fn test_driver_errors_become_core_errors() {
        let err: berth_core::Error = DriverError::Status {
            status: 500,
            url: "http://x/volumes".into(),
            body: "boom".into(),
        }
        .into();
        assert!(matches!(err, berth_core::Error::Driver(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_lookup_missing_volume() {
        let (driver, _) = serve().await;
        assert!(driver.lookup(&Handle::from("gone")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_and_lookup_volume() {
        let (driver, service) = serve().await;

        let volume = driver
            .create_volume(&Handle::from("v1"), &VolumeSpec::empty(true))
            .await
            .unwrap();
        assert_eq!(volume.handle().as_str(), "v1");
        assert_eq!(volume.path(), "/data/volumes/v1");
        assert!(service.lock().unwrap().volumes["v1"].privileged);

        let found = driver.lookup_volume(&Handle::from("v1")).await.unwrap().unwrap();
        assert_eq!(found.path(), "/data/volumes/v1");
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let (driver, _) = serve().await;

        let err = driver
            .create(&Handle::from("full"), &VolumeSpec::empty(false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::Status { status: 500, ref body, .. } if body == "disk full"));
    }

    #[tokio::test]
    async fn test_properties_and_privilege() {
        let (driver, _) = serve().await;
        let volume = driver
            .create(&Handle::from("v1"), &VolumeSpec::empty(false))
            .await
            .unwrap();

        volume.set_property("ttl", "60").await.unwrap();
        assert_eq!(
            volume.properties().await.unwrap(),
            BTreeMap::from([("ttl".to_string(), "60".to_string())])
        );

        assert!(!volume.privileged().await.unwrap());
        volume.set_privileged(true).await.unwrap();
        assert!(volume.privileged().await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_in_and_out() {
        let (driver, service) = serve().await;
        let volume = driver
            .create(&Handle::from("v1"), &VolumeSpec::empty(false))
            .await
            .unwrap();

        let content: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"tar ")),
            Ok(Bytes::from_static(b"bytes")),
        ])
        .boxed();
        volume.stream_in(".", Encoding::Gzip, content).await.unwrap();
        {
            let service = service.lock().unwrap();
            let stored = &service.volumes["v1"];
            assert_eq!(stored.content, b"tar bytes");
            assert_eq!(stored.content_encoding.as_deref(), Some("gzip"));
        }

        let chunks: Vec<Bytes> = volume
            .stream_out(".", Encoding::Raw)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"tar bytes");
        assert_eq!(service.lock().unwrap().accept_encodings, vec!["raw"]);
    }

    #[tokio::test]
    async fn test_stream_out_of_missing_volume_fails() {
        let (driver, _) = serve().await;
        let volume = driver
            .create(&Handle::from("v1"), &VolumeSpec::empty(false))
            .await
            .unwrap();
        let ghost = HttpVolume {
            handle: Handle::from("ghost"),
            ..volume
        };

        let err = ghost.stream_out(".", Encoding::Gzip).await.err().unwrap();
        assert!(matches!(err, berth_core::Error::Driver(msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_p2p_stream() {
        let (driver, service) = serve().await;
        let src = driver
            .create(&Handle::from("src"), &VolumeSpec::empty(false))
            .await
            .unwrap();
        let dst = driver
            .create(&Handle::from("dst"), &VolumeSpec::empty(false))
            .await
            .unwrap();

        let url = dst.stream_in_p2p_url(".").await.unwrap();
        assert_eq!(url, "http://10.1.2.3:7788/volumes/dst/stream-in?path=.");

        src.stream_p2p_out(".", &url, Encoding::Gzip).await.unwrap();
        let pushes = service.lock().unwrap().p2p_pushes.clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0]["handle"], "src");
        assert_eq!(pushes[0]["path"], ".");
        assert_eq!(pushes[0]["streamInURL"], url);
        assert_eq!(pushes[0]["encoding"], "gzip");
    }
}
