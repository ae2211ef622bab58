//! The engine façade
//!
//! `Core` wires the catalog, the two object caches, the disk-load pool and
//! the transfer coordinator together behind one handle. All cache mutation
//! and event fan-out happens on the thread that calls [`Core::process_events`]
//! (or one of the synchronous high-priority access paths); worker threads
//! only ever hand results back over channels, so there is exactly one writer.
//!
//! Per cached object the lifecycle is: `Ready` on creation, `Loading` while
//! the disk read is in flight, `Updating` while a network refresh is in
//! flight, then `Ok` or `UpdateFailed`. Requests coalesce: an update request
//! during `Updating` is a no-op, one during `Loading` sets the
//! `update_after_load` flag. Exactly one transfer job is in flight per
//! object, and every in-flight load or update holds a reference so the entry
//! cannot be evicted under it.

use crate::cache::{data_file_path, CacheKey, Cached, ObjectCache};
use crate::catalog::{Catalog, FormatVersion};
use crate::changelog::{ChangeLog, Incomplete, Resolution};
use crate::diskload::DiskLoadPool;
use crate::error::Result;
use crate::picture::{self, PictureData, PictureHandle};
use crate::priceguide::{self, PriceGuideData, PriceGuideHandle, PRICE_GUIDE_COST};
use crate::transfer::{
    AuthEvent, CoordinatorEvent, JobId, Outcome, SessionEndpoints, TransferCoordinator,
    TransferJob, TransferResult, Transport,
};
use crate::types::{Color, Item, ItemKey};
use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KIB: u64 = 1024;
const GIB: u64 = 1024 * 1024 * 1024;

const DEFAULT_PICTURE_INTERVAL_SECS: i64 = 14 * 24 * 3600;
const DEFAULT_PRICE_GUIDE_INTERVAL_SECS: i64 = 24 * 3600;
const PRICE_GUIDE_CACHE_ENTRIES: u64 = 5_000;

/// Engine configuration; everything has a usable default except `data_dir`.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    /// total physical memory, used to size the picture cache; the floors
    /// apply when absent
    pub physical_memory: Option<u64>,
    pub picture_update_interval_secs: i64,
    pub price_guide_update_interval_secs: i64,
    pub disk_load_workers: Option<usize>,
    pub endpoints: SessionEndpoints,
    pub price_guide_url: String,
    pub picture_url: String,
}

impl CoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        CoreConfig {
            data_dir: data_dir.into(),
            physical_memory: None,
            picture_update_interval_secs: DEFAULT_PICTURE_INTERVAL_SECS,
            price_guide_update_interval_secs: DEFAULT_PRICE_GUIDE_INTERVAL_SECS,
            disk_load_workers: None,
            endpoints: SessionEndpoints {
                login_url: "https://www.bricklink.com/ajax/renovate/loginandout.ajax".into(),
                logout_url: "https://www.bricklink.com/ajax/renovate/loginandout.ajax?do_logout=true".into(),
                login_page_marker: "login.page".into(),
            },
            price_guide_url: "https://www.bricklink.com/priceGuideSummary.asp".into(),
            picture_url: "https://img.bricklink.com/ItemImage".into(),
        }
    }

    /// Picture cache budget in KiB: half the physical memory, clamped to
    /// [1 GiB, 4 GiB].
    fn picture_cache_budget_kib(&self) -> u64 {
        let bytes = self
            .physical_memory
            .map_or(GIB, |mem| (mem / 2).clamp(GIB, 4 * GIB));
        bytes / KIB
    }

    /// Price guide cache budget in entries, doubled on machines with 3 GB
    /// of RAM or more.
    fn price_guide_cache_budget(&self) -> u64 {
        match self.physical_memory {
            Some(mem) if mem >= 3 * 1_000_000_000 => PRICE_GUIDE_CACHE_ENTRIES * 2,
            _ => PRICE_GUIDE_CACHE_ENTRIES,
        }
    }
}

/// Notifications fanned out to subscribers; exactly one terminal event per
/// request outcome.
#[derive(Debug, Clone)]
pub enum Event {
    PriceGuideUpdated(CacheKey),
    PictureUpdated(CacheKey),
    AuthenticationChanged(bool),
    AuthenticationFailed { user: String, error: String },
    /// terminal result of a pass-through authenticated job
    TransferFinished(TransferResult),
}

enum DiskCompletion {
    PriceGuide {
        handle: PriceGuideHandle,
        loaded: Option<(DateTime<Utc>, PriceGuideData)>,
    },
    Picture {
        handle: PictureHandle,
        loaded: Option<(DateTime<Utc>, Vec<u8>)>,
    },
}

enum PendingTransfer {
    PriceGuide {
        handle: PriceGuideHandle,
    },
    Picture {
        handle: PictureHandle,
        /// a large `.jpg` that 404s gets one `.gif` retry
        retried_gif: bool,
    },
}

pub struct Core {
    config: CoreConfig,
    catalog: Catalog,
    changelog: ChangeLog,
    pictures: ObjectCache<PictureData>,
    price_guides: ObjectCache<PriceGuideData>,
    pool: DiskLoadPool,
    coordinator: TransferCoordinator,
    online: bool,
    /// true while cancel_transfers reconciles; disk-load completions applied
    /// in that window must not schedule refreshes
    suppress_updates: bool,
    disk_tx: Sender<DiskCompletion>,
    disk_rx: Receiver<DiskCompletion>,
    pending: HashMap<JobId, PendingTransfer>,
    subscribers: Vec<Sender<Event>>,
}

impl Core {
    pub fn new(config: CoreConfig, transport: Arc<dyn Transport>) -> Result<Core> {
        std::fs::create_dir_all(&config.data_dir)?;
        let pool = match config.disk_load_workers {
            Some(n) => DiskLoadPool::new(n)?,
            None => DiskLoadPool::with_default_size()?,
        };
        let coordinator = TransferCoordinator::new(transport, config.endpoints.clone());
        let (disk_tx, disk_rx) = unbounded();

        info!(
            data_dir = %config.data_dir.display(),
            picture_budget_kib = config.picture_cache_budget_kib(),
            price_guide_budget = config.price_guide_cache_budget(),
            "engine started"
        );

        Ok(Core {
            pictures: ObjectCache::new(config.picture_cache_budget_kib()),
            price_guides: ObjectCache::new(config.price_guide_cache_budget()),
            catalog: Catalog::new(),
            changelog: ChangeLog::new(),
            pool,
            coordinator,
            online: true,
            suppress_updates: false,
            disk_tx,
            disk_rx,
            pending: HashMap::new(),
            subscribers: Vec::new(),
            config,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.changelog
    }

    pub fn set_change_log(&mut self, changelog: ChangeLog) {
        self.changelog = changelog;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Going offline cancels all transfers and drains the disk-load pool.
    pub fn set_online(&mut self, online: bool) {
        if self.online && !online {
            self.cancel_transfers();
        }
        self.online = online;
    }

    pub fn is_authenticated(&self) -> bool {
        self.coordinator.is_authenticated()
    }

    pub fn set_credentials(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.coordinator.set_credentials(user, password);
    }

    /// Session-gated pass-through; the terminal result arrives as
    /// [`Event::TransferFinished`].
    pub fn retrieve_authenticated(&mut self, job: TransferJob) -> JobId {
        self.coordinator.retrieve_authenticated(job)
    }

    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn set_update_intervals(&mut self, picture_secs: i64, price_guide_secs: i64) {
        self.config.picture_update_interval_secs = picture_secs;
        self.config.price_guide_update_interval_secs = price_guide_secs;
    }

    /// Abort all network jobs and discard queued disk loads, waiting for
    /// in-flight ones. Completions from loads that did run are applied
    /// immediately (without scheduling refreshes); entries whose load was
    /// discarded are reset to `Ready` and their load reference released.
    pub fn cancel_transfers(&mut self) {
        self.pool.drain();
        self.suppress_updates = true;
        self.process_disk_completions();
        self.suppress_updates = false;
        self.reset_discarded_loads();
        self.coordinator.abort_all();
    }

    fn reset_discarded_loads(&mut self) {
        let mut events = Vec::new();
        for handle in self.price_guides.handles() {
            let mut cached = handle.lock();
            if cached.status == crate::cache::UpdateStatus::Loading {
                cached.status = crate::cache::UpdateStatus::Ready;
                cached.update_after_load = false;
                cached.refs = cached.refs.saturating_sub(1);
                events.push(Event::PriceGuideUpdated(cached.key.clone()));
            }
        }
        for handle in self.pictures.handles() {
            let mut cached = handle.lock();
            if cached.status == crate::cache::UpdateStatus::Loading {
                cached.status = crate::cache::UpdateStatus::Ready;
                cached.update_after_load = false;
                cached.refs = cached.refs.saturating_sub(1);
                events.push(Event::PictureUpdated(cached.key.clone()));
            }
        }
        for event in events {
            self.notify(event);
        }
    }

    /// Load (or reload) the catalog; `None` means the default location
    /// inside the data directory. Replacement cancels in-flight activity
    /// and clears both caches; a failed load leaves everything as it was.
    pub fn load_catalog(&mut self, path: Option<&std::path::Path>) -> Result<()> {
        self.cancel_transfers();
        self.process_events();

        let default = self.config.data_dir.join("database");
        self.catalog.load(path.unwrap_or(&default))?;

        self.pictures.clear();
        self.price_guides.clear();
        Ok(())
    }

    pub fn save_catalog(&self, path: &std::path::Path, version: FormatVersion) -> Result<()> {
        self.catalog.save(path, version)
    }

    /// Change-log resolution for a reference that failed direct lookup.
    /// Color falls back to a name scan when the id is unknown.
    pub fn resolve_incomplete(
        &self,
        incomplete: &Incomplete,
    ) -> (Resolution<&Item>, Resolution<&Color>) {
        let type_ids: Vec<char> = match incomplete.item_type_id {
            Some(id) => vec![id],
            None => self.catalog.item_types().iter().map(|t| t.id).collect(),
        };
        let item = self
            .changelog
            .resolve_item(&self.catalog, &type_ids, &incomplete.item_id);

        let color = match incomplete.color_id {
            Some(id) => {
                let by_id = self.changelog.resolve_color(&self.catalog, id);
                match by_id {
                    Resolution::Fail => match self.catalog.color_by_name(&incomplete.color_name) {
                        Some(c) => Resolution::ChangeLog(c),
                        None => Resolution::Fail,
                    },
                    resolved => resolved,
                }
            }
            None => match self.catalog.color_by_name(&incomplete.color_name) {
                Some(c) => Resolution::Direct(c),
                None => Resolution::Fail,
            },
        };
        (item, color)
    }

    /// Fetch a price guide handle; the caller holds one reference until
    /// [`Core::release_price_guide`].
    pub fn price_guide(
        &mut self,
        item: ItemKey,
        color_id: u32,
        high_priority: bool,
    ) -> Option<PriceGuideHandle> {
        let key = CacheKey::new(item, Some(color_id));

        if let Some(handle) = self.price_guides.get(&key) {
            handle.lock().refs += 1;
            self.maybe_update_price_guide(&handle);
            return Some(handle);
        }

        let handle: PriceGuideHandle = Arc::new(Mutex::new(Cached::new(
            key.clone(),
            PriceGuideData::default(),
        )));
        handle.lock().refs = 1;
        if let Err(e) = self
            .price_guides
            .insert(key.clone(), Arc::clone(&handle), PRICE_GUIDE_COST)
        {
            warn!(?key, error = %e, "price guide not cached");
        }

        self.start_price_guide_load(&handle, high_priority);
        Some(handle)
    }

    /// Fetch a picture handle; `None` color means the large colorless
    /// picture. The caller holds one reference until [`Core::release_picture`].
    pub fn picture(
        &mut self,
        item: ItemKey,
        color_id: Option<u32>,
        high_priority: bool,
    ) -> Option<PictureHandle> {
        let key = CacheKey::new(item, color_id);

        if let Some(handle) = self.pictures.get(&key) {
            handle.lock().refs += 1;
            self.maybe_update_picture(&handle);
            return Some(handle);
        }

        let handle: PictureHandle =
            Arc::new(Mutex::new(Cached::new(key.clone(), PictureData::default())));
        handle.lock().refs = 1;
        let cost = picture::cost(&handle.lock().payload);
        if let Err(e) = self.pictures.insert(key.clone(), Arc::clone(&handle), cost) {
            warn!(?key, error = %e, "picture not cached");
        }

        self.start_picture_load(&handle, high_priority);
        Some(handle)
    }

    pub fn release_price_guide(&mut self, handle: &PriceGuideHandle) {
        let mut cached = handle.lock();
        cached.refs = cached.refs.saturating_sub(1);
    }

    pub fn release_picture(&mut self, handle: &PictureHandle) {
        let mut cached = handle.lock();
        cached.refs = cached.refs.saturating_sub(1);
    }

    pub fn cancel_price_guide_update(&mut self, handle: &PriceGuideHandle) {
        let key = handle.lock().key.clone();
        self.cancel_pending(&key);
    }

    pub fn cancel_picture_update(&mut self, handle: &PictureHandle) {
        let key = handle.lock().key.clone();
        self.cancel_pending(&key);
    }

    fn cancel_pending(&mut self, key: &CacheKey) {
        let ids: Vec<JobId> = self
            .pending
            .iter()
            .filter(|(_, p)| pending_key(p) == *key)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.coordinator.abort(id);
        }
    }

    /// The control-thread pump: applies every queued disk-load and transfer
    /// completion. Call regularly (or after waiting on a subscription).
    pub fn process_events(&mut self) {
        self.process_disk_completions();
        while let Some(event) = self.coordinator.poll() {
            match event {
                CoordinatorEvent::Auth(AuthEvent::Changed(on)) => {
                    self.notify(Event::AuthenticationChanged(on))
                }
                CoordinatorEvent::Auth(AuthEvent::Failed { user, error }) => {
                    self.notify(Event::AuthenticationFailed { user, error })
                }
                CoordinatorEvent::Result(result) => self.finish_transfer(result),
            }
        }
    }

    fn process_disk_completions(&mut self) {
        while let Ok(completion) = self.disk_rx.try_recv() {
            match completion {
                DiskCompletion::PriceGuide { handle, loaded } => {
                    self.finish_price_guide_load(&handle, loaded)
                }
                DiskCompletion::Picture { handle, loaded } => {
                    self.finish_picture_load(&handle, loaded)
                }
            }
        }
    }

    fn notify(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ---- price guide state machine ----

    fn start_price_guide_load(&mut self, handle: &PriceGuideHandle, high_priority: bool) {
        let path = {
            let mut cached = handle.lock();
            cached.status = crate::cache::UpdateStatus::Loading;
            cached.refs += 1; // held by the in-flight load
            data_file_path(
                &self.config.data_dir,
                &cached.key,
                priceguide::PRICE_GUIDE_FILE,
            )
        };

        if high_priority {
            let loaded = load_price_guide_file(&path);
            self.finish_price_guide_load(handle, loaded);
        } else {
            let handle = Arc::clone(handle);
            let tx = self.disk_tx.clone();
            self.pool.spawn(move || {
                let loaded = load_price_guide_file(&path);
                let _ = tx.send(DiskCompletion::PriceGuide { handle, loaded });
            });
        }
    }

    fn finish_price_guide_load(
        &mut self,
        handle: &PriceGuideHandle,
        loaded: Option<(DateTime<Utc>, PriceGuideData)>,
    ) {
        let (key, wants_update) = {
            let mut cached = handle.lock();
            if let Some((fetched, data)) = loaded {
                cached.payload = data;
                cached.fetched = Some(fetched);
                cached.valid = true;
            }
            cached.status = crate::cache::UpdateStatus::Ok;
            cached.refs = cached.refs.saturating_sub(1);
            let deferred = std::mem::take(&mut cached.update_after_load);
            let wants = !self.suppress_updates
                && (deferred
                    || !cached.valid
                    || cached.is_stale(self.config.price_guide_update_interval_secs));
            (cached.key.clone(), wants)
        };
        if wants_update {
            // update_price_guide notifies on its own failure paths; a
            // submitted job notifies at transfer completion
            self.update_price_guide(handle);
        } else {
            self.notify(Event::PriceGuideUpdated(key));
        }
    }

    fn maybe_update_price_guide(&mut self, handle: &PriceGuideHandle) {
        let wants_update = {
            let cached = handle.lock();
            match cached.status {
                crate::cache::UpdateStatus::Updating => false,
                crate::cache::UpdateStatus::Loading => false,
                _ => !cached.valid || cached.is_stale(self.config.price_guide_update_interval_secs),
            }
        };
        if wants_update {
            self.update_price_guide(handle);
        }
    }

    /// Request a network refresh, honoring the coalescing rules.
    pub fn update_price_guide(&mut self, handle: &PriceGuideHandle) {
        let (key, action) = {
            let mut cached = handle.lock();
            let action = match cached.status {
                crate::cache::UpdateStatus::Updating => UpdateAction::Coalesce,
                crate::cache::UpdateStatus::Loading => {
                    cached.update_after_load = true;
                    UpdateAction::Coalesce
                }
                _ if !self.online => {
                    cached.status = crate::cache::UpdateStatus::UpdateFailed;
                    UpdateAction::FailOffline
                }
                _ => {
                    cached.status = crate::cache::UpdateStatus::Updating;
                    cached.refs += 1; // held by the in-flight update
                    UpdateAction::Submit
                }
            };
            (cached.key.clone(), action)
        };

        match action {
            UpdateAction::Coalesce => {}
            UpdateAction::FailOffline => self.notify(Event::PriceGuideUpdated(key)),
            UpdateAction::Submit => {
                let url = self.price_guide_request_url(&key);
                let id = self.coordinator.retrieve(TransferJob::get(url));
                self.pending.insert(
                    id,
                    PendingTransfer::PriceGuide {
                        handle: Arc::clone(handle),
                    },
                );
            }
        }
    }

    fn price_guide_request_url(&self, key: &CacheKey) -> String {
        format!(
            "{}?a={}&vcID=1&colorID={}&itemID={}",
            self.config.price_guide_url,
            key.item.type_id.to_ascii_lowercase(),
            key.color.unwrap_or(0),
            key.item.id
        )
    }

    fn finish_price_guide_transfer(&mut self, handle: PriceGuideHandle, result: TransferResult) {
        let key = handle.lock().key.clone();
        match result.outcome {
            Outcome::Completed { code: 200, body } => match priceguide::decode_summary(&body) {
                Ok(data) => {
                    let fetched = Utc::now();
                    let path = data_file_path(
                        &self.config.data_dir,
                        &key,
                        priceguide::PRICE_GUIDE_FILE,
                    );
                    if let Err(e) = priceguide::save_to_disk(&path, fetched, &data) {
                        warn!(?key, error = %e, "price guide not persisted");
                    }
                    let mut cached = handle.lock();
                    cached.payload = data;
                    cached.fetched = Some(fetched);
                    cached.valid = true;
                    cached.status = crate::cache::UpdateStatus::Ok;
                }
                Err(e) => {
                    warn!(?key, error = %e, "price guide response undecodable");
                    handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
                }
            },
            Outcome::Completed { code, .. } => {
                warn!(?key, code, "price guide fetch failed");
                handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
            }
            Outcome::Failed { code, error } => {
                warn!(?key, code, error, "price guide fetch failed");
                handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
            }
            Outcome::Aborted => {
                // an aborted refresh is a failed refresh; any previously
                // cached payload stays visible through `valid`
                handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
            }
        }
        {
            let mut cached = handle.lock();
            cached.refs = cached.refs.saturating_sub(1);
        }
        self.notify(Event::PriceGuideUpdated(key));
    }

    // ---- picture state machine ----

    fn start_picture_load(&mut self, handle: &PictureHandle, high_priority: bool) {
        let path = {
            let mut cached = handle.lock();
            cached.status = crate::cache::UpdateStatus::Loading;
            cached.refs += 1;
            data_file_path(
                &self.config.data_dir,
                &cached.key,
                picture::cache_file_name(&cached.key),
            )
        };

        if high_priority {
            let loaded = load_picture_file(&path);
            self.finish_picture_load(handle, loaded);
        } else {
            let handle = Arc::clone(handle);
            let tx = self.disk_tx.clone();
            self.pool.spawn(move || {
                let loaded = load_picture_file(&path);
                let _ = tx.send(DiskCompletion::Picture { handle, loaded });
            });
        }
    }

    fn finish_picture_load(
        &mut self,
        handle: &PictureHandle,
        loaded: Option<(DateTime<Utc>, Vec<u8>)>,
    ) {
        let (key, cost, wants_update) = {
            let mut cached = handle.lock();
            if let Some((fetched, image)) = loaded {
                cached.payload = PictureData {
                    image,
                    extension: extension_of(picture::cache_file_name(&cached.key)),
                };
                cached.fetched = Some(fetched);
                cached.valid = true;
            }
            cached.status = crate::cache::UpdateStatus::Ok;
            cached.refs = cached.refs.saturating_sub(1);
            let deferred = std::mem::take(&mut cached.update_after_load);
            let wants = !self.suppress_updates
                && (deferred
                    || !cached.valid
                    || cached.is_stale(self.config.picture_update_interval_secs));
            (cached.key.clone(), picture::cost(&cached.payload), wants)
        };
        if let Err(e) = self.pictures.set_cost(&key, cost) {
            warn!(?key, error = %e, "picture over cache budget");
        }
        if wants_update {
            self.update_picture(handle);
        } else {
            self.notify(Event::PictureUpdated(key));
        }
    }

    fn maybe_update_picture(&mut self, handle: &PictureHandle) {
        let wants_update = {
            let cached = handle.lock();
            match cached.status {
                crate::cache::UpdateStatus::Updating => false,
                crate::cache::UpdateStatus::Loading => false,
                _ => !cached.valid || cached.is_stale(self.config.picture_update_interval_secs),
            }
        };
        if wants_update {
            self.update_picture(handle);
        }
    }

    /// Request a network refresh, honoring the coalescing rules.
    pub fn update_picture(&mut self, handle: &PictureHandle) {
        let (key, action) = {
            let mut cached = handle.lock();
            let action = match cached.status {
                crate::cache::UpdateStatus::Updating => UpdateAction::Coalesce,
                crate::cache::UpdateStatus::Loading => {
                    cached.update_after_load = true;
                    UpdateAction::Coalesce
                }
                _ if !self.online => {
                    cached.status = crate::cache::UpdateStatus::UpdateFailed;
                    UpdateAction::FailOffline
                }
                _ => {
                    cached.status = crate::cache::UpdateStatus::Updating;
                    cached.refs += 1;
                    UpdateAction::Submit
                }
            };
            (cached.key.clone(), action)
        };

        match action {
            UpdateAction::Coalesce => {}
            UpdateAction::FailOffline => self.notify(Event::PictureUpdated(key)),
            UpdateAction::Submit => {
                let extension = if key.color.is_some() { "png" } else { "jpg" };
                let url = self.picture_request_url(&key, extension);
                let id = self.coordinator.retrieve(TransferJob::get(url));
                self.pending.insert(
                    id,
                    PendingTransfer::Picture {
                        handle: Arc::clone(handle),
                        retried_gif: false,
                    },
                );
            }
        }
    }

    fn picture_request_url(&self, key: &CacheKey, extension: &str) -> String {
        let picture_type = self
            .catalog
            .item_type(key.item.type_id)
            .map_or(key.item.type_id, |t| t.picture_id);
        match key.color {
            Some(color) => format!(
                "{}/{}N/{}/{}.{}",
                self.config.picture_url, picture_type, color, key.item.id, extension
            ),
            None => format!(
                "{}/{}L/{}.{}",
                self.config.picture_url, picture_type, key.item.id, extension
            ),
        }
    }

    fn finish_picture_transfer(
        &mut self,
        handle: PictureHandle,
        retried_gif: bool,
        result: TransferResult,
    ) {
        let key = handle.lock().key.clone();
        match result.outcome {
            Outcome::Completed { code: 200, body } => {
                let path = data_file_path(
                    &self.config.data_dir,
                    &key,
                    picture::cache_file_name(&key),
                );
                if let Err(e) = picture::save_to_disk(&path, &body) {
                    warn!(?key, error = %e, "picture not persisted");
                }
                let cost = {
                    let mut cached = handle.lock();
                    cached.payload = PictureData {
                        image: body,
                        extension: if retried_gif {
                            "gif".into()
                        } else {
                            extension_of(picture::cache_file_name(&key))
                        },
                    };
                    cached.fetched = Some(Utc::now());
                    cached.valid = true;
                    cached.status = crate::cache::UpdateStatus::Ok;
                    picture::cost(&cached.payload)
                };
                if let Err(e) = self.pictures.set_cost(&key, cost) {
                    warn!(?key, error = %e, "picture over cache budget");
                }
            }
            Outcome::Completed { code: 404, .. } | Outcome::Failed { code: 404, .. }
                if key.color.is_none() && !retried_gif =>
            {
                // large images occasionally exist only as gif
                debug!(?key, "large picture 404 as jpg, retrying as gif");
                let url = self.picture_request_url(&key, "gif");
                let id = self.coordinator.retrieve(TransferJob::get(url));
                self.pending.insert(
                    id,
                    PendingTransfer::Picture {
                        handle,
                        retried_gif: true,
                    },
                );
                return; // still updating, ref still held, no notification
            }
            Outcome::Completed { code, .. } => {
                warn!(?key, code, "picture fetch failed");
                handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
            }
            Outcome::Failed { code, error } => {
                warn!(?key, code, error, "picture fetch failed");
                handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
            }
            Outcome::Aborted => {
                handle.lock().status = crate::cache::UpdateStatus::UpdateFailed;
            }
        }
        {
            let mut cached = handle.lock();
            cached.refs = cached.refs.saturating_sub(1);
        }
        self.notify(Event::PictureUpdated(key));
    }

    fn finish_transfer(&mut self, result: TransferResult) {
        match self.pending.remove(&result.id) {
            Some(PendingTransfer::PriceGuide { handle }) => {
                self.finish_price_guide_transfer(handle, result)
            }
            Some(PendingTransfer::Picture {
                handle,
                retried_gif,
            }) => self.finish_picture_transfer(handle, retried_gif, result),
            None => self.notify(Event::TransferFinished(result)),
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.coordinator.abort_all();
        self.pool.drain();
    }
}

enum UpdateAction {
    Coalesce,
    FailOffline,
    Submit,
}

fn pending_key(pending: &PendingTransfer) -> CacheKey {
    match pending {
        PendingTransfer::PriceGuide { handle } => handle.lock().key.clone(),
        PendingTransfer::Picture { handle, .. } => handle.lock().key.clone(),
    }
}

fn extension_of(file_name: &str) -> String {
    file_name.rsplit('.').next().unwrap_or_default().to_string()
}

fn load_price_guide_file(path: &std::path::Path) -> Option<(DateTime<Utc>, PriceGuideData)> {
    match priceguide::load_from_disk(path) {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "price guide disk load failed");
            None
        }
    }
}

fn load_picture_file(path: &std::path::Path) -> Option<(DateTime<Utc>, Vec<u8>)> {
    match picture::load_from_disk(path) {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "picture disk load failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UpdateStatus;
    use crate::priceguide::{Condition, TimeBand};
    use std::time::Duration;
    use tempfile::TempDir;

    const SUMMARY: &str = "12\t340\t0.05\t0.21\t0.19\t1.10\n\
                           7\t99\t0.02\t0.11\t0.10\t0.55\n\
                           40\t1200\t0.04\t0.25\t0.22\t2.00\n\
                           15\t300\t0.01\t0.09\t0.08\t0.40\n";

    /// Scripted transport: each rule matches a url substring once, in order;
    /// unscripted urls fail with a 404.
    #[derive(Default)]
    struct ScriptedTransport {
        rules: Mutex<Vec<(String, Outcome)>>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn respond(&self, url_part: &str, outcome: Outcome) {
            self.rules.lock().push((url_part.to_string(), outcome));
        }

        fn requests(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn retrieve(&self, job: &TransferJob, results: &Sender<TransferResult>) {
            self.log.lock().push(job.url.clone());
            let mut rules = self.rules.lock();
            let pos = rules.iter().position(|(part, _)| job.url.contains(part));
            let outcome = match pos {
                Some(i) => rules.remove(i).1,
                None => Outcome::Failed {
                    code: 404,
                    error: "unscripted".into(),
                },
            };
            let _ = results.send(TransferResult {
                id: job.id,
                outcome,
                redirect_url: None,
            });
        }

        fn abort(&self, id: JobId, results: &Sender<TransferResult>) {
            let _ = results.send(TransferResult {
                id,
                outcome: Outcome::Aborted,
                redirect_url: None,
            });
        }

        fn abort_all(&self, _results: &Sender<TransferResult>) {}
    }

    fn engine(dir: &TempDir) -> (Arc<ScriptedTransport>, Core) {
        let transport = Arc::new(ScriptedTransport::default());
        let mut config = CoreConfig::new(dir.path());
        config.disk_load_workers = Some(2);
        let core = Core::new(config, Arc::clone(&transport) as Arc<dyn Transport>).unwrap();
        (transport, core)
    }

    fn pump_until_event(core: &mut Core, rx: &Receiver<Event>) -> Event {
        for _ in 0..500 {
            core.process_events();
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("no event arrived");
    }

    #[test]
    fn test_picture_high_priority_miss_fetches_once() {
        let dir = TempDir::new().unwrap();
        let (transport, mut core) = engine(&dir);
        let rx = core.subscribe();
        transport.respond(
            "/PN/4/3001.png",
            Outcome::Completed {
                code: 200,
                body: b"png bytes".to_vec(),
            },
        );

        let handle = core
            .picture(ItemKey::new('P', "3001"), Some(4), true)
            .unwrap();
        core.process_events();

        assert!(matches!(rx.try_recv(), Ok(Event::PictureUpdated(_))));
        assert!(rx.try_recv().is_err(), "exactly one terminal notification");
        {
            let cached = handle.lock();
            assert_eq!(cached.status, UpdateStatus::Ok);
            assert!(cached.valid);
            assert_eq!(cached.payload.image, b"png bytes");
        }
        let on_disk = data_file_path(
            dir.path(),
            &CacheKey::new(ItemKey::new('P', "3001"), Some(4)),
            picture::PICTURE_FILE,
        );
        assert_eq!(std::fs::read(on_disk).unwrap(), b"png bytes");

        // a second access is served from the cache, no new network job
        let again = core
            .picture(ItemKey::new('P', "3001"), Some(4), true)
            .unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_offline_access_fails_update_with_notification() {
        let dir = TempDir::new().unwrap();
        let (transport, mut core) = engine(&dir);
        let rx = core.subscribe();
        core.set_online(false);

        let handle = core
            .picture(ItemKey::new('P', "3001"), Some(4), true)
            .unwrap();
        core.process_events();

        assert_eq!(handle.lock().status, UpdateStatus::UpdateFailed);
        assert!(matches!(rx.try_recv(), Ok(Event::PictureUpdated(_))));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_large_picture_gif_fallback() {
        let dir = TempDir::new().unwrap();
        let (transport, mut core) = engine(&dir);
        let rx = core.subscribe();
        transport.respond(
            "/SL/7190-1.jpg",
            Outcome::Failed {
                code: 404,
                error: "not found".into(),
            },
        );
        transport.respond(
            "/SL/7190-1.gif",
            Outcome::Completed {
                code: 200,
                body: b"gif bytes".to_vec(),
            },
        );

        let handle = core.picture(ItemKey::new('S', "7190-1"), None, true).unwrap();
        core.process_events();

        {
            let cached = handle.lock();
            assert_eq!(cached.status, UpdateStatus::Ok);
            assert_eq!(cached.payload.image, b"gif bytes");
            assert_eq!(cached.payload.extension, "gif");
        }
        // saved under the jpg name regardless of the actual format
        let on_disk = data_file_path(
            dir.path(),
            &CacheKey::new(ItemKey::new('S', "7190-1"), None),
            picture::LARGE_PICTURE_FILE,
        );
        assert_eq!(std::fs::read(on_disk).unwrap(), b"gif bytes");

        assert!(matches!(rx.try_recv(), Ok(Event::PictureUpdated(_))));
        assert!(rx.try_recv().is_err(), "the retry must not notify twice");
    }

    #[test]
    fn test_price_guide_low_priority_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (transport, mut core) = engine(&dir);
        let rx = core.subscribe();
        transport.respond(
            "priceGuideSummary",
            Outcome::Completed {
                code: 200,
                body: SUMMARY.as_bytes().to_vec(),
            },
        );

        let handle = core
            .price_guide(ItemKey::new('P', "3001"), 4, false)
            .unwrap();
        let event = pump_until_event(&mut core, &rx);

        assert!(matches!(event, Event::PriceGuideUpdated(_)));
        {
            let cached = handle.lock();
            assert_eq!(cached.status, UpdateStatus::Ok);
            assert_eq!(
                cached.payload.band(TimeBand::PastSales, Condition::New).lots,
                12
            );
        }
        // the sidecar is now on disk; a fresh engine serves it without a fetch
        drop(core);
        let (transport2, mut core2) = engine(&dir);
        let handle2 = core2
            .price_guide(ItemKey::new('P', "3001"), 4, true)
            .unwrap();
        assert!(handle2.lock().valid);
        assert!(transport2.requests().is_empty());
    }

    #[test]
    fn test_refs_follow_handles() {
        let dir = TempDir::new().unwrap();
        let (transport, mut core) = engine(&dir);
        transport.respond(
            "priceGuideSummary",
            Outcome::Completed {
                code: 200,
                body: SUMMARY.as_bytes().to_vec(),
            },
        );

        let handle = core.price_guide(ItemKey::new('P', "3001"), 4, true).unwrap();
        core.process_events();

        // only the caller's reference remains after load and update settle
        assert_eq!(handle.lock().refs, 1);
        core.release_price_guide(&handle);
        assert_eq!(handle.lock().refs, 0);
    }

    #[test]
    fn test_update_requests_coalesce() {
        let dir = TempDir::new().unwrap();
        let (transport, mut core) = engine(&dir);
        transport.respond(
            "priceGuideSummary",
            Outcome::Completed {
                code: 200,
                body: SUMMARY.as_bytes().to_vec(),
            },
        );

        let handle = core.price_guide(ItemKey::new('P', "3001"), 4, true).unwrap();
        // the first access already submitted a refresh; both of these must
        // coalesce into it
        core.update_price_guide(&handle);
        core.update_price_guide(&handle);
        core.process_events();

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(handle.lock().status, UpdateStatus::Ok);
    }

    #[test]
    fn test_resolve_incomplete_via_engine() {
        use crate::changelog::{ColorChange, ItemChange};
        use crate::types::{Category, ItemType};

        let dir = TempDir::new().unwrap();
        let (_transport, mut core) = engine(&dir);

        core.catalog.replace(
            vec![Color::new(80, "Metallic Silver")],
            vec![Category::new(5, "Brick")],
            vec![ItemType::new('P', "Part")],
            vec![Item::new('P', "3001b", "Brick 2 x 4")],
            Vec::new(),
        );
        let mut log = ChangeLog::new();
        log.replace(
            vec![ItemChange {
                from_type_id: 'P',
                from_id: "3001".into(),
                to_type_id: 'P',
                to_id: "3001b".into(),
            }],
            vec![ColorChange { from_id: 22, to_id: 80 }],
        );
        core.set_change_log(log);

        let incomplete = Incomplete {
            item_id: "3001".into(),
            item_type_id: Some('P'),
            color_id: Some(22),
            ..Incomplete::default()
        };
        let (item, color) = core.resolve_incomplete(&incomplete);
        assert_eq!(item.ok().unwrap().id, "3001b");
        assert_eq!(color.ok().unwrap().id, 80);
    }
}

