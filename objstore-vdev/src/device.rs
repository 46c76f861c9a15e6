//! The leaf-device adapter: translates host lifecycle and I/O calls into
//! agent requests, owning the transport, request table, and serial latch
//! that back them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::KvMap;
use crate::config::ConnectionConfig;
use crate::error::VdevError;
use crate::io::{
    completion_channel, Completion, CompletionReceiver, IoOutcome, IoRequest, IoctlKind,
    PendingIo, Priority,
};
use crate::protocol::*;
use crate::request_table::{PriorityStats, RequestTable};
use crate::serial::SerialLatch;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaLoadState {
    Create,
    Open,
    Other,
}

/// Process-wide tunables, captured into the device at open time and not
/// revisited afterward even if the tunable changes later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub logical_ashift: u32,
    pub physical_ashift: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            logical_ashift: DEFAULT_ASHIFT,
            physical_ashift: DEFAULT_ASHIFT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResult {
    pub psize: u64,
    pub max_psize: u64,
    pub logical_ashift: u32,
    pub physical_ashift: u32,
    /// Object-store vdevs are never spinning disks; always `true`.
    pub non_rotational: bool,
    /// Always `false`: the agent protocol has no trim request type.
    pub trim_supported: bool,
    /// Always `false`, matching `trim_supported`.
    pub securetrim_supported: bool,
}

// The original lifecycle's FRESH state (struct allocated, fields not yet
// populated) has no Rust counterpart: `Shared::new` only ever runs to
// completion, so a `Device` is born straight into `Initialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Initialized,
    Open,
    Destroyed,
}

pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) request_table: RequestTable,
    pub(crate) serial: SerialLatch,
    pub(crate) next_block: AtomicU64,
    pub(crate) uberblock: Mutex<Vec<u8>>,

    transport: Mutex<Option<Transport>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<DeviceState>,
    degraded: Mutex<Option<String>>,
    psize: AtomicU64,
    max_psize: AtomicU64,
    logical_ashift: AtomicU32,
    physical_ashift: AtomicU32,
}

impl Shared {
    fn new(config: ConnectionConfig) -> Self {
        Shared {
            config,
            request_table: RequestTable::new(),
            serial: SerialLatch::new(),
            next_block: AtomicU64::new(0),
            uberblock: Mutex::new(Vec::new()),
            transport: Mutex::new(None),
            reader_handle: Mutex::new(None),
            state: Mutex::new(DeviceState::Initialized),
            degraded: Mutex::new(None),
            psize: AtomicU64::new(0),
            max_psize: AtomicU64::new(0),
            logical_ashift: AtomicU32::new(DEFAULT_ASHIFT),
            physical_ashift: AtomicU32::new(DEFAULT_ASHIFT),
        }
    }

    pub(crate) fn mark_degraded(&self, reason: String) {
        *self.degraded.lock().unwrap() = Some(reason);
    }

    /// Promotes a protocol fault: degrades the device, fails every in-flight
    /// io, and releases any blocked serial waiter. Used both by the reader
    /// thread and by send-side failures detected synchronously.
    pub(crate) fn fault(&self, e: VdevError) {
        let reason = e.to_string();
        self.mark_degraded(reason.clone());
        self.request_table.fail_all(reason.clone());
        self.serial.fault(reason);
    }

    fn is_readable(&self) -> bool {
        *self.state.lock().unwrap() == DeviceState::Open && self.degraded.lock().unwrap().is_none()
    }
}

/// A handle to one object-store-backed leaf device. Cheap to clone: clones
/// share the same underlying state, the way a host holds one dispatch
/// handle per vdev.
#[derive(Clone)]
pub struct Device(Arc<Shared>);

impl Device {
    /// Extracts connection parameters from `config` and readies an
    /// `Initialized` device. Does not touch the network.
    pub fn init(config: &HashMap<String, String>) -> Result<Device, VdevError> {
        let config = ConnectionConfig::from_map(config)?;
        info!(
            "vdev init endpoint={} region={}",
            config.endpoint, config.region
        );
        Ok(Device(Arc::new(Shared::new(config))))
    }

    /// Opens (or reopens) the device. `pool_name`/`guid` are only used when
    /// `load_state` is `Create`. `mode` is accepted for parity with the
    /// host's open call; this adapter behaves the same way under every
    /// `SpaMode` since read/write gating happens above this layer.
    /// `socket_path` is normally [`DEFAULT_SOCKET_PATH`] but is overridable
    /// for tests.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        bucket: &str,
        pool_name: &str,
        guid: u64,
        mode: SpaMode,
        load_state: SpaLoadState,
        reopen: bool,
        tunables: Tunables,
        socket_path: impl AsRef<Path>,
    ) -> Result<OpenResult, VdevError> {
        info!("opening vdev bucket={bucket} mode={mode:?} reopen={reopen}");
        if bucket.is_empty() {
            return Err(VdevError::BadLabel);
        }

        if !reopen {
            let (transport, read_half) = Transport::connect(socket_path)?;
            *self.0.transport.lock().unwrap() = Some(transport);

            let weak = Arc::downgrade(&self.0);
            let handle = std::thread::Builder::new()
                .name("objstore-vdev-reader".to_string())
                .spawn(move || crate::reader::run(weak, read_half))
                .expect("spawning the reader thread");
            *self.0.reader_handle.lock().unwrap() = Some(handle);

            if load_state == SpaLoadState::Create {
                self.send_create_pool(pool_name, guid, bucket)?;
                self.0.serial.arm_and_wait()?;
            }
            self.send_open_pool(guid, bucket)?;
            self.0.serial.arm_and_wait()?;
        }

        self.0.psize.store(PSIZE, Ordering::Release);
        self.0.max_psize.store(PSIZE, Ordering::Release);
        self.0
            .logical_ashift
            .store(tunables.logical_ashift, Ordering::Release);
        self.0
            .physical_ashift
            .store(tunables.physical_ashift, Ordering::Release);
        *self.0.state.lock().unwrap() = DeviceState::Open;

        Ok(OpenResult {
            psize: PSIZE,
            max_psize: PSIZE,
            logical_ashift: tunables.logical_ashift,
            physical_ashift: tunables.physical_ashift,
            non_rotational: true,
            trim_supported: false,
            securetrim_supported: false,
        })
    }

    /// Closes the transport and joins the reader thread. A no-op if the
    /// device is not open, or if this is a reopen in progress.
    pub fn close(&self, reopen: bool) {
        if reopen {
            return;
        }
        let state = self.0.state.lock().unwrap();
        if *state != DeviceState::Open {
            return;
        }
        if let Some(transport) = self.0.transport.lock().unwrap().take() {
            transport.close();
        }
        drop(state);
        if let Some(handle) = self.0.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.0.state.lock().unwrap() = DeviceState::Initialized;
        info!("vdev closed");
    }

    /// Consumes the device. Closes it first if it was left open.
    pub fn fini(self) {
        if *self.0.state.lock().unwrap() == DeviceState::Open {
            warn!("fini called on an open device, closing first");
            self.close(false);
        }
        *self.0.state.lock().unwrap() = DeviceState::Destroyed;
        info!("vdev fini");
    }

    /// Submits an io, blocking the calling thread if the request table is
    /// full. Matches the original source's back-pressure contract.
    pub fn io_start(&self, request: IoRequest, priority: Priority) -> Result<CompletionReceiver, VdevError> {
        self.submit_io(request, priority, true)
    }

    /// Non-blocking alternative: returns `WouldBlock` instead of parking the
    /// caller's thread when the request table is full.
    pub fn try_io_start(
        &self,
        request: IoRequest,
        priority: Priority,
    ) -> Result<CompletionReceiver, VdevError> {
        self.submit_io(request, priority, false)
    }

    /// No-op, present for parity with the host's dispatch table; the
    /// reader's completion hand-off is the real completion path.
    pub fn io_done(&self) {}

    /// The allocation hint the agent returned at pool-open, for seeding the
    /// metaslab's starting low-block-address.
    pub fn metaslab_init(&self) -> u64 {
        self.0.next_block.load(Ordering::Acquire)
    }

    pub fn config_generate(&self) -> HashMap<String, String> {
        self.0.config.generate()
    }

    pub fn begin_txg(&self, txg: u64) -> Result<(), VdevError> {
        let mut map = KvMap::new();
        map.insert(FIELD_TYPE, TYPE_BEGIN_TXG);
        map.insert(FIELD_TXG, txg);
        self.send_frame_checked(&map)
    }

    /// Serial: blocks until the agent acknowledges the end of the TXG.
    pub fn end_txg(&self, txg: u64) -> Result<(), VdevError> {
        let mut map = KvMap::new();
        map.insert(FIELD_TYPE, TYPE_END_TXG);
        map.insert(FIELD_TXG, txg);
        map.insert(FIELD_DATA, self.get_uberblock());
        self.send_frame_checked(&map)?;
        self.0.serial.arm_and_wait()
    }

    /// Fire-and-forget: the agent does not acknowledge frees.
    pub fn free_block(&self, offset: u64, asize: u64) -> Result<(), VdevError> {
        let mut map = KvMap::new();
        map.insert(FIELD_TYPE, TYPE_FREE_BLOCK);
        map.insert(FIELD_BLOCK, offset_to_block(offset));
        map.insert(FIELD_SIZE, asize);
        self.send_frame_checked(&map)
    }

    pub fn get_uberblock(&self) -> Vec<u8> {
        self.0.uberblock.lock().unwrap().clone()
    }

    pub fn is_readable(&self) -> bool {
        self.0.is_readable()
    }

    /// Active/queued-io counts for `priority`, exposed for stats.
    pub fn io_stats(&self, priority: Priority) -> PriorityStats {
        self.0.request_table.stats(priority)
    }

    fn send_create_pool(&self, pool_name: &str, guid: u64, bucket: &str) -> Result<(), VdevError> {
        let cfg = &self.0.config;
        let mut map = KvMap::new();
        map.insert(FIELD_TYPE, TYPE_CREATE_POOL);
        map.insert(FIELD_NAME, pool_name);
        map.insert(FIELD_GUID, guid);
        map.insert(FIELD_CREDENTIALS, cfg.credentials.clone());
        map.insert(FIELD_ENDPOINT, cfg.endpoint.clone());
        map.insert(FIELD_REGION, cfg.region.clone());
        map.insert(FIELD_BUCKET, bucket);
        self.send_frame_checked(&map)
    }

    fn send_open_pool(&self, guid: u64, bucket: &str) -> Result<(), VdevError> {
        let cfg = &self.0.config;
        let mut map = KvMap::new();
        map.insert(FIELD_TYPE, TYPE_OPEN_POOL);
        map.insert(FIELD_GUID, guid);
        map.insert(FIELD_CREDENTIALS, cfg.credentials.clone());
        map.insert(FIELD_ENDPOINT, cfg.endpoint.clone());
        map.insert(FIELD_REGION, cfg.region.clone());
        map.insert(FIELD_BUCKET, bucket);
        self.send_frame_checked(&map)
    }

    fn send_frame_checked(&self, map: &KvMap) -> Result<(), VdevError> {
        if self.0.degraded.lock().unwrap().is_some() {
            return Err(VdevError::Degraded);
        }
        let guard = self.0.transport.lock().unwrap();
        let transport = guard
            .as_ref()
            .ok_or_else(|| VdevError::protocol("transport is not open"))?;
        let result = transport.send_frame(map);
        drop(guard);
        if let Err(e) = &result {
            self.0.fault(VdevError::protocol(e.to_string()));
        }
        result
    }

    fn submit_io(
        &self,
        request: IoRequest,
        priority: Priority,
        blocking: bool,
    ) -> Result<CompletionReceiver, VdevError> {
        let (tx, rx) = completion_channel();
        match &request {
            IoRequest::Ioctl(kind) => debug!("io_start dispatch: ioctl {kind:?} priority={priority:?}"),
            IoRequest::Trim { .. } => debug!("io_start dispatch: trim priority={priority:?}"),
            IoRequest::Read { .. } => debug!("io_start dispatch: read priority={priority:?}"),
            IoRequest::Write { .. } => debug!("io_start dispatch: write priority={priority:?}"),
        }
        match request {
            IoRequest::Ioctl(kind) => {
                let outcome = if !self.is_readable() {
                    IoOutcome::Err(VdevError::DeviceUnreadable)
                } else {
                    match kind {
                        // Matches the original source: the cache-flush
                        // ioctl always succeeds; the nocacheflush tunable
                        // only ever gated a sync step that was never wired
                        // up, so there is nothing left for it to disable.
                        IoctlKind::FlushWriteCache => IoOutcome::Acked,
                        IoctlKind::Other => IoOutcome::Err(VdevError::NotSupported),
                    }
                };
                let _ = tx.send(Completion { outcome, delay: Duration::ZERO });
                Ok(rx)
            }
            IoRequest::Trim { .. } => {
                let _ = tx.send(Completion {
                    outcome: IoOutcome::Err(VdevError::NotSupported),
                    delay: Duration::ZERO,
                });
                Ok(rx)
            }
            IoRequest::Read { offset, size } => {
                let io = PendingIo::for_read(offset, size, priority);
                let block = io.block;
                let req_id = self.claim_slot(io, tx, blocking)?;
                let mut map = KvMap::new();
                map.insert(FIELD_TYPE, TYPE_READ_BLOCK);
                map.insert(FIELD_SIZE, size as u64);
                map.insert(FIELD_BLOCK, block);
                map.insert(FIELD_REQUEST_ID, req_id);
                self.send_queued_frame(&map);
                Ok(rx)
            }
            IoRequest::Write { offset, data } => {
                let io = PendingIo::for_write(offset, data, priority);
                let block = io.block;
                let data_copy = io.buffer.clone();
                let req_id = self.claim_slot(io, tx, blocking)?;
                let mut map = KvMap::new();
                map.insert(FIELD_TYPE, TYPE_WRITE_BLOCK);
                map.insert(FIELD_BLOCK, block);
                map.insert(FIELD_DATA, data_copy);
                map.insert(FIELD_REQUEST_ID, req_id);
                self.send_queued_frame(&map);
                Ok(rx)
            }
        }
    }

    fn claim_slot(
        &self,
        io: PendingIo,
        tx: crate::io::CompletionSender,
        blocking: bool,
    ) -> Result<u64, VdevError> {
        if blocking {
            self.0.request_table.submit(io, tx)
        } else {
            self.0.request_table.try_submit(io, tx)
        }
    }

    /// Sends a frame whose matching slot is already installed in the
    /// request table. A send failure is routed through `fault`, which will
    /// deliver the error to this request's completion channel along with
    /// every other in-flight io, rather than being returned here.
    fn send_queued_frame(&self, map: &KvMap) {
        let guard = self.0.transport.lock().unwrap();
        let Some(transport) = guard.as_ref() else {
            drop(guard);
            self.0.fault(VdevError::protocol("transport is not open"));
            return;
        };
        let result = transport.send_frame(map);
        drop(guard);
        if let Err(e) = result {
            self.0.fault(e);
        }
    }
}
