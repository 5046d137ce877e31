//! In-memory volume driver and container engine for tests.

use async_trait::async_trait;
use berth_core::compression::for_encoding;
use berth_core::{
    ByteStream, ContainerEngine, DriverVolume, Encoding, EngineContainer, EngineContainerSpec,
    EngineProcess, Error, Handle, ProcessIo, ProcessSpec, Result, Strategy, TtySpec, VolumeDriver,
    VolumeSpec, archive,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type Files = BTreeMap<String, Vec<u8>>;

/// A volume whose content is a map of file path to bytes.
pub struct FakeVolume {
    handle: Handle,
    path: String,
    spec: VolumeSpec,
    privileged: Mutex<bool>,
    properties: Mutex<BTreeMap<String, String>>,
    files: Mutex<Files>,
    streams_in: AtomicUsize,
    streams_out: AtomicUsize,
    stream_out_delay: Mutex<Option<Duration>>,
    fail_stream_out: AtomicBool,
    p2p_sent: Mutex<Vec<String>>,
}

impl FakeVolume {
    pub fn spec(&self) -> &VolumeSpec {
        &self.spec
    }

    pub fn files(&self) -> Files {
        lock(&self.files).clone()
    }

    pub fn write_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        lock(&self.files).insert(path.to_string(), content.into());
    }

    pub fn is_privileged(&self) -> bool {
        *lock(&self.privileged)
    }

    /// How many times content was streamed into this volume.
    pub fn streams_in(&self) -> usize {
        self.streams_in.load(Ordering::SeqCst)
    }

    /// How many times content was fully streamed out of this volume.
    pub fn streams_out(&self) -> usize {
        self.streams_out.load(Ordering::SeqCst)
    }

    /// Make every later stream out wait before producing content.
    pub fn delay_stream_out(&self, delay: Duration) {
        *lock(&self.stream_out_delay) = Some(delay);
    }

    pub fn fail_stream_out(&self, fail: bool) {
        self.fail_stream_out.store(fail, Ordering::SeqCst);
    }

    /// Destination URLs this volume was streamed to directly.
    pub fn p2p_sent(&self) -> Vec<String> {
        lock(&self.p2p_sent).clone()
    }

    fn archive(&self, path: &str, encoding: Encoding) -> Result<Vec<u8>> {
        let files = lock(&self.files);
        let selected: Files = if path == "." {
            files.clone()
        } else {
            files
                .get(path)
                .map(|content| BTreeMap::from([(path.to_string(), content.clone())]))
                .unwrap_or_default()
        };
        let tarball = archive::pack(&selected)?;
        Ok(for_encoding(encoding).compress(&tarball)?)
    }
}

#[async_trait]
impl DriverVolume for FakeVolume {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn path(&self) -> &str {
        &self.path
    }

    async fn properties(&self) -> Result<BTreeMap<String, String>> {
        Ok(lock(&self.properties).clone())
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        lock(&self.properties).insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn privileged(&self) -> Result<bool> {
        Ok(self.is_privileged())
    }

    async fn set_privileged(&self, privileged: bool) -> Result<()> {
        *lock(&self.privileged) = privileged;
        Ok(())
    }

    async fn stream_in(&self, _path: &str, encoding: Encoding, content: ByteStream) -> Result<()> {
        let chunks: Vec<Bytes> = content.try_collect().await?;
        let tarball = for_encoding(encoding).decompress(&chunks.concat())?;
        let files = archive::unpack(&tarball)?;
        lock(&self.files).extend(files);
        self.streams_in.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stream_out(&self, path: &str, encoding: Encoding) -> Result<ByteStream> {
        if self.fail_stream_out.load(Ordering::SeqCst) {
            return Err(Error::Stream(format!("volume {} is unreadable", self.handle)));
        }
        let delay = *lock(&self.stream_out_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let data = self.archive(path, encoding)?;
        self.streams_out.fetch_add(1, Ordering::SeqCst);
        Ok(stream::once(async move { Ok(Bytes::from(data)) }).boxed())
    }

    async fn stream_in_p2p_url(&self, path: &str) -> Result<String> {
        Ok(format!("fake://{}/stream-in?path={}", self.handle, path))
    }

    async fn stream_p2p_out(&self, _path: &str, dest_url: &str, _encoding: Encoding) -> Result<()> {
        lock(&self.p2p_sent).push(dest_url.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct DriverState {
    volumes: HashMap<Handle, Arc<FakeVolume>>,
    host_paths: HashMap<String, Files>,
}

/// Volume driver keeping volumes in memory.
///
/// Copy-on-write volumes copy their parent's files. Import volumes copy
/// files seeded with [`FakeDriver::seed_host_path`].
pub struct FakeDriver {
    root: String,
    state: Mutex<DriverState>,
    creates: AtomicUsize,
    fail_creates: AtomicBool,
    fail_lookups: AtomicBool,
}

impl FakeDriver {
    pub fn new(worker_name: &str) -> Self {
        Self {
            root: format!("/var/lib/{}/volumes", worker_name),
            state: Mutex::new(DriverState::default()),
            creates: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
            fail_lookups: AtomicBool::new(false),
        }
    }

    pub fn seed_host_path(&self, path: &str, files: Files) {
        lock(&self.state).host_paths.insert(path.to_string(), files);
    }

    pub fn volume(&self, handle: &Handle) -> Option<Arc<FakeVolume>> {
        lock(&self.state).volumes.get(handle).cloned()
    }

    pub fn remove(&self, handle: &Handle) {
        lock(&self.state).volumes.remove(handle);
    }

    pub fn len(&self) -> usize {
        lock(&self.state).volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeDriver for FakeDriver {
    async fn create_volume(&self, handle: &Handle, spec: &VolumeSpec) -> Result<Arc<dyn DriverVolume>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Driver("disk full".to_string()));
        }
        // Yield so concurrent callers interleave.
        tokio::task::yield_now().await;

        let mut state = lock(&self.state);
        if state.volumes.contains_key(handle) {
            return Err(Error::Driver(format!("volume {} already exists", handle)));
        }

        let files = match &spec.strategy {
            Strategy::Empty => Files::new(),
            Strategy::Cow { parent } => state
                .volumes
                .get(parent)
                .map(|parent| parent.files())
                .ok_or_else(|| Error::VolumeNotFound(parent.to_string()))?,
            Strategy::Import { path, .. } => state.host_paths.get(path).cloned().unwrap_or_default(),
        };

        let volume = Arc::new(FakeVolume {
            handle: handle.clone(),
            path: format!("{}/{}", self.root, handle),
            spec: spec.clone(),
            privileged: Mutex::new(spec.privileged),
            properties: Mutex::new(spec.properties.clone()),
            files: Mutex::new(files),
            streams_in: AtomicUsize::new(0),
            streams_out: AtomicUsize::new(0),
            stream_out_delay: Mutex::new(None),
            fail_stream_out: AtomicBool::new(false),
            p2p_sent: Mutex::new(Vec::new()),
        });
        state.volumes.insert(handle.clone(), volume.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(volume)
    }

    async fn lookup_volume(&self, handle: &Handle) -> Result<Option<Arc<dyn DriverVolume>>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::Driver("connection refused".to_string()));
        }
        Ok(self
            .volume(handle)
            .map(|volume| volume as Arc<dyn DriverVolume>))
    }
}

/// A finished process with a fixed exit status.
pub struct FakeProcess {
    id: String,
    status: i32,
}

#[async_trait]
impl EngineProcess for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> Result<i32> {
        Ok(self.status)
    }

    async fn set_tty(&self, _tty: TtySpec) -> Result<()> {
        Ok(())
    }
}

/// A container that runs nothing.
///
/// `echo` writes its arguments to stdout and exits 0. `exe-not-found`
/// fails to start. Anything else exits 0 without output.
pub struct FakeContainer {
    spec: EngineContainerSpec,
    properties: Mutex<BTreeMap<String, String>>,
    runs: Mutex<Vec<ProcessSpec>>,
    processes: Mutex<HashMap<String, i32>>,
    attaches: AtomicUsize,
}

impl FakeContainer {
    pub fn spec(&self) -> &EngineContainerSpec {
        &self.spec
    }

    pub fn runs(&self) -> Vec<ProcessSpec> {
        lock(&self.runs).clone()
    }

    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineContainer for FakeContainer {
    fn handle(&self) -> &Handle {
        &self.spec.handle
    }

    async fn run(&self, spec: ProcessSpec, mut io: ProcessIo) -> Result<Box<dyn EngineProcess>> {
        if spec.path == "exe-not-found" {
            return Err(Error::ExecutableNotFound(spec.path));
        }

        if spec.path == "echo" {
            if let Some(stdout) = io.stdout.as_mut() {
                stdout.write_all(spec.args.join(" ").as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        let id = spec.id.clone().unwrap_or_else(|| Handle::generate().into_string());
        lock(&self.processes).insert(id.clone(), 0);
        lock(&self.runs).push(spec);
        Ok(Box::new(FakeProcess { id, status: 0 }))
    }

    async fn attach(&self, process_id: &str, _io: ProcessIo) -> Result<Box<dyn EngineProcess>> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        let status = lock(&self.processes)
            .get(process_id)
            .copied()
            .ok_or_else(|| Error::ProcessNotFound(process_id.to_string()))?;
        Ok(Box::new(FakeProcess {
            id: process_id.to_string(),
            status,
        }))
    }

    async fn property(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.properties).get(name).cloned())
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        lock(&self.properties).insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Container engine keeping containers in memory.
#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<HashMap<Handle, Arc<FakeContainer>>>,
    creates: AtomicUsize,
    destroyed: Mutex<Vec<Handle>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, handle: &Handle) -> Option<Arc<FakeContainer>> {
        lock(&self.containers).get(handle).cloned()
    }

    pub fn remove(&self, handle: &Handle) {
        lock(&self.containers).remove(handle);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<Handle> {
        lock(&self.destroyed).clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, spec: EngineContainerSpec) -> Result<Arc<dyn EngineContainer>> {
        let mut containers = lock(&self.containers);
        if containers.contains_key(&spec.handle) {
            return Err(Error::Engine(format!("container {} already exists", spec.handle)));
        }
        let container = Arc::new(FakeContainer {
            properties: Mutex::new(spec.properties.clone()),
            spec,
            runs: Mutex::new(Vec::new()),
            processes: Mutex::new(HashMap::new()),
            attaches: AtomicUsize::new(0),
        });
        containers.insert(container.spec.handle.clone(), container.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(container)
    }

    async fn lookup(&self, handle: &Handle) -> Result<Option<Arc<dyn EngineContainer>>> {
        Ok(self
            .container(handle)
            .map(|container| container as Arc<dyn EngineContainer>))
    }

    async fn destroy(&self, handle: &Handle) -> Result<()> {
        lock(&self.containers).remove(handle);
        lock(&self.destroyed).push(handle.clone());
        Ok(())
    }
}
