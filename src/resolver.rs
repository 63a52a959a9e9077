use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{DatasetType, SessionId};
use crate::error::OneError;
use crate::registry::RegistryClient;
use crate::store::CacheStore;
use crate::transfer::FileTransfer;

/// Upper bound on simultaneous fetches within one resolution.
const MAX_PARALLEL_FETCHES: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Answer from the local cache only; misses become absent slots
    /// instead of triggering network I/O.
    pub cache_only: bool,
}

/// Outcome for one requested dataset type. Slot *i* of a resolution always
/// corresponds to requested name *i*.
#[derive(Debug, Clone, Serialize)]
pub enum ResolvedSlot {
    Loaded {
        path: Utf8PathBuf,
        dataset_type: DatasetType,
    },
    /// The session has no dataset of this type. A normal outcome of
    /// exploratory use, never an error.
    Absent,
    /// The dataset exists remotely but its transfer failed, or the
    /// existence query it needed could not reach the registry.
    Failed,
}

impl ResolvedSlot {
    pub fn path(&self) -> Option<&Utf8Path> {
        match self {
            ResolvedSlot::Loaded { path, .. } => Some(path),
            ResolvedSlot::Absent | ResolvedSlot::Failed => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ResolvedSlot::Loaded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum ResolveWarning {
    Missing {
        dataset_type: DatasetType,
    },
    FetchFailed {
        dataset_type: DatasetType,
        message: String,
    },
}

/// Positionally aligned resolution result: `slots.len()` equals the number
/// of requested dataset types, regardless of hits, misses and failures.
#[derive(Debug, Serialize)]
pub struct Resolution {
    pub slots: Vec<ResolvedSlot>,
    pub warnings: Vec<ResolveWarning>,
}

impl Resolution {
    pub fn paths(&self) -> Vec<Option<Utf8PathBuf>> {
        self.slots
            .iter()
            .map(|slot| slot.path().map(Utf8Path::to_path_buf))
            .collect()
    }
}

/// Lazily fetched map of the session's existing dataset types to their
/// remote locators. Nothing is fetched until the first cache miss asks,
/// so a fully warm load performs zero network I/O; concurrent first
/// askers block on the same single bulk query.
struct RemoteCatalog<'a, R: RegistryClient> {
    registry: &'a R,
    session: &'a SessionId,
    entries: OnceLock<Result<HashMap<DatasetType, String>, OneError>>,
}

impl<'a, R: RegistryClient> RemoteCatalog<'a, R> {
    fn new(registry: &'a R, session: &'a SessionId) -> Self {
        Self {
            registry,
            session,
            entries: OnceLock::new(),
        }
    }

    fn url_for(&self, dataset_type: &DatasetType) -> Result<Option<&str>, &OneError> {
        let entries = self.entries.get_or_init(|| {
            debug!(session = %self.session, "fetching dataset catalogue");
            self.registry.session_datasets(self.session).map(|records| {
                records
                    .into_iter()
                    .filter_map(|record| {
                        let url = record.url?;
                        Some((record.dataset_type, url))
                    })
                    .collect()
            })
        });
        match entries {
            Ok(map) => Ok(map.get(dataset_type).map(String::as_str)),
            Err(err) => Err(err),
        }
    }
}

pub struct Resolver<'a, R: RegistryClient, T: FileTransfer> {
    store: &'a CacheStore,
    registry: &'a R,
    transfer: &'a T,
}

impl<'a, R: RegistryClient, T: FileTransfer> Resolver<'a, R, T> {
    pub fn new(store: &'a CacheStore, registry: &'a R, transfer: &'a T) -> Self {
        Self {
            store,
            registry,
            transfer,
        }
    }

    /// Turns requested dataset-type names into local paths. Requested names
    /// are matched exactly against the session's remote dataset records;
    /// the existence query is deferred until the first cache miss, so a
    /// warm cache is served without touching the registry. Fetches run on
    /// a bounded worker pool; a failing transfer only empties its own slot
    /// and lands in the warning list.
    pub fn resolve(
        &self,
        session: &SessionId,
        requested: &[DatasetType],
        options: ResolveOptions,
    ) -> Resolution {
        if requested.is_empty() {
            return Resolution {
                slots: Vec::new(),
                warnings: Vec::new(),
            };
        }

        let catalog = (!options.cache_only).then(|| RemoteCatalog::new(self.registry, session));
        let catalog = catalog.as_ref();

        let next = AtomicUsize::new(0);
        let workers = requested.len().min(MAX_PARALLEL_FETCHES);
        let mut outcomes = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let next = &next;
                    scope.spawn(move || {
                        let mut local = Vec::new();
                        loop {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            if index >= requested.len() {
                                break;
                            }
                            local.push((
                                index,
                                self.resolve_one(session, &requested[index], catalog),
                            ));
                        }
                        local
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().expect("resolver worker panicked"))
                .collect::<Vec<_>>()
        });
        outcomes.sort_by_key(|(index, _)| *index);

        let mut slots = Vec::with_capacity(requested.len());
        let mut warnings = Vec::new();
        for (_, (slot, warning)) in outcomes {
            slots.push(slot);
            warnings.extend(warning);
        }
        Resolution { slots, warnings }
    }

    fn resolve_one(
        &self,
        session: &SessionId,
        dataset_type: &DatasetType,
        catalog: Option<&RemoteCatalog<'_, R>>,
    ) -> (ResolvedSlot, Option<ResolveWarning>) {
        // Held across lookup-fetch-put: a concurrent request for the same
        // key blocks here and finds the cache warm on re-check.
        let lock = self.store.key_lock(session, dataset_type);
        let _guard = lock.lock();

        match self.store.lookup(session, dataset_type) {
            Ok(Some(entry)) => {
                debug!(session = %session, dataset_type = %dataset_type, "cache hit");
                return (
                    ResolvedSlot::Loaded {
                        path: entry.local_path,
                        dataset_type: dataset_type.clone(),
                    },
                    None,
                );
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session = %session, dataset_type = %dataset_type, %err, "cache lookup failed");
                return (
                    ResolvedSlot::Failed,
                    Some(ResolveWarning::FetchFailed {
                        dataset_type: dataset_type.clone(),
                        message: err.to_string(),
                    }),
                );
            }
        }

        // cache_only: a miss is reported as missing, no network.
        let Some(catalog) = catalog else {
            return (
                ResolvedSlot::Absent,
                Some(ResolveWarning::Missing {
                    dataset_type: dataset_type.clone(),
                }),
            );
        };

        let url = match catalog.url_for(dataset_type) {
            Ok(Some(url)) => url,
            Ok(None) => {
                return (
                    ResolvedSlot::Absent,
                    Some(ResolveWarning::Missing {
                        dataset_type: dataset_type.clone(),
                    }),
                );
            }
            Err(err) => {
                warn!(session = %session, dataset_type = %dataset_type, %err, "existence query failed");
                return (
                    ResolvedSlot::Failed,
                    Some(ResolveWarning::FetchFailed {
                        dataset_type: dataset_type.clone(),
                        message: err.to_string(),
                    }),
                );
            }
        };

        match self.fetch(session, dataset_type, url) {
            Ok(path) => (
                ResolvedSlot::Loaded {
                    path,
                    dataset_type: dataset_type.clone(),
                },
                None,
            ),
            Err(err) => {
                warn!(session = %session, dataset_type = %dataset_type, %err, "transfer failed");
                (
                    ResolvedSlot::Failed,
                    Some(ResolveWarning::FetchFailed {
                        dataset_type: dataset_type.clone(),
                        message: err.to_string(),
                    }),
                )
            }
        }
    }

    fn fetch(
        &self,
        session: &SessionId,
        dataset_type: &DatasetType,
        url: &str,
    ) -> Result<Utf8PathBuf, OneError> {
        let staging = self.store.staging_dir(session)?;
        // Staged next to the final location so the publish rename is
        // atomic; dropped on failure, so no partial file outlives a fetch.
        let temp = tempfile::Builder::new()
            .prefix("one-client-dl")
            .tempfile_in(staging.as_std_path())
            .map_err(|err| OneError::Filesystem(err.to_string()))?;

        self.transfer.download(url, temp.path())?;

        let temp_path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .map_err(|_| OneError::Filesystem("non-utf8 staging path".to_string()))?;
        let entry = self.store.put(session, dataset_type, &temp_path)?;
        Ok(entry.local_path)
    }
}
