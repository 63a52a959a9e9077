use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::info;

use crate::domain::{DatasetRecord, DatasetType, ListCategory, SessionId};
use crate::error::OneError;
use crate::query::{SearchFilters, SearchResult};
use crate::registry::RegistryClient;
use crate::resolver::{ResolveOptions, ResolveWarning, ResolvedSlot, Resolver};
use crate::store::CacheStore;
use crate::transfer::FileTransfer;

/// What a load call is aimed at: a known session, or search filters that
/// must resolve to exactly one session.
#[derive(Debug, Clone)]
pub enum LoadTarget {
    Session(SessionId),
    Filters(SearchFilters),
}

impl From<SessionId> for LoadTarget {
    fn from(value: SessionId) -> Self {
        LoadTarget::Session(value)
    }
}

impl From<SearchFilters> for LoadTarget {
    fn from(value: SearchFilters) -> Self {
        LoadTarget::Filters(value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Return the structured record shape instead of the flat path list.
    /// Both shapes carry the same underlying data.
    pub dclass_output: bool,
    pub cache_only: bool,
}

/// Structured load output: parallel sequences, slot *i* of each belonging
/// to requested dataset type *i*.
#[derive(Debug, Serialize)]
pub struct LoadRecord {
    pub session: SessionId,
    pub paths: Vec<Option<Utf8PathBuf>>,
    pub dataset_types: Vec<Option<DatasetType>>,
    pub warnings: Vec<ResolveWarning>,
}

#[derive(Debug, Serialize)]
pub enum LoadResult {
    Flat {
        session: SessionId,
        paths: Vec<Option<Utf8PathBuf>>,
        warnings: Vec<ResolveWarning>,
    },
    Detailed(LoadRecord),
}

impl LoadResult {
    pub fn session(&self) -> &SessionId {
        match self {
            LoadResult::Flat { session, .. } => session,
            LoadResult::Detailed(record) => &record.session,
        }
    }

    pub fn paths(&self) -> &[Option<Utf8PathBuf>] {
        match self {
            LoadResult::Flat { paths, .. } => paths,
            LoadResult::Detailed(record) => &record.paths,
        }
    }

    pub fn warnings(&self) -> &[ResolveWarning] {
        match self {
            LoadResult::Flat { warnings, .. } => warnings,
            LoadResult::Detailed(record) => &record.warnings,
        }
    }
}

/// Catalogue or per-session listing output.
#[derive(Debug, Serialize)]
pub enum ListResult {
    Names(Vec<String>),
    Datasets(Vec<DatasetRecord>),
}

/// The user-facing client: search sessions, enumerate their dataset types
/// and load datasets through the local cache.
pub struct One<R: RegistryClient, T: FileTransfer> {
    store: CacheStore,
    registry: R,
    transfer: T,
}

impl<R: RegistryClient, T: FileTransfer> One<R, T> {
    pub fn new(store: CacheStore, registry: R, transfer: T) -> Self {
        Self {
            store,
            registry,
            transfer,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    /// Recognized search filter key names.
    pub fn search_terms(&self) -> Vec<&'static str> {
        crate::query::search_terms()
    }

    /// Session discovery. Ordering is the registry's; with `details` the
    /// record list is positionally aligned with the id list.
    pub fn search(&self, filters: &SearchFilters, details: bool) -> Result<SearchResult, OneError> {
        filters.validate()?;
        let records = self.registry.search_sessions(filters, details)?;
        info!(matched = records.len(), "session search");
        Ok(SearchResult::from_records(records, details))
    }

    /// With a session: that session's dataset types (`All` keeps the full
    /// records, other categories reduce to existing type names). Without:
    /// the registry-wide catalogue for the category.
    pub fn list(
        &self,
        session: Option<&SessionId>,
        category: ListCategory,
    ) -> Result<ListResult, OneError> {
        match session {
            Some(session) => {
                let records = self.registry.session_datasets(session)?;
                match category {
                    ListCategory::All => Ok(ListResult::Datasets(records)),
                    ListCategory::DatasetTypes => Ok(ListResult::Names(
                        records
                            .iter()
                            .filter(|record| record.exists())
                            .map(|record| record.dataset_type.as_str().to_string())
                            .collect(),
                    )),
                    ListCategory::Users | ListCategory::Subjects => Err(OneError::InvalidQuery(
                        format!("category {category} does not apply to a single session"),
                    )),
                }
            }
            None => Ok(ListResult::Names(self.registry.list_catalog(category)?)),
        }
    }

    /// Loads the requested dataset types of one session into the local
    /// cache and returns their paths, positionally aligned with the
    /// request. An empty request loads everything the session has. Only a
    /// failure to establish the session itself is fatal; everything else
    /// degrades to empty slots plus warnings.
    pub fn load(
        &self,
        target: LoadTarget,
        dataset_types: &[DatasetType],
        options: LoadOptions,
    ) -> Result<LoadResult, OneError> {
        let session = self.establish_session(target)?;

        let requested: Vec<DatasetType> = if dataset_types.is_empty() {
            if options.cache_only {
                return Err(OneError::InvalidQuery(
                    "cache-only load requires explicit dataset types".to_string(),
                ));
            }
            self.registry
                .session_datasets(&session)?
                .into_iter()
                .filter(|record| record.exists())
                .map(|record| record.dataset_type)
                .collect()
        } else {
            dataset_types.to_vec()
        };

        let resolver = Resolver::new(&self.store, &self.registry, &self.transfer);
        let resolution = resolver.resolve(
            &session,
            &requested,
            ResolveOptions {
                cache_only: options.cache_only,
            },
        );
        info!(
            session = %session,
            requested = requested.len(),
            loaded = resolution.slots.iter().filter(|s| s.is_loaded()).count(),
            "load complete"
        );

        let paths = resolution.paths();
        if options.dclass_output {
            let dataset_types = resolution
                .slots
                .iter()
                .map(|slot| match slot {
                    ResolvedSlot::Loaded { dataset_type, .. } => Some(dataset_type.clone()),
                    ResolvedSlot::Absent | ResolvedSlot::Failed => None,
                })
                .collect();
            Ok(LoadResult::Detailed(LoadRecord {
                session,
                paths,
                dataset_types,
                warnings: resolution.warnings,
            }))
        } else {
            Ok(LoadResult::Flat {
                session,
                paths,
                warnings: resolution.warnings,
            })
        }
    }

    /// A filter target must resolve to exactly one session; zero or many
    /// matches are surfaced instead of silently picking one.
    fn establish_session(&self, target: LoadTarget) -> Result<SessionId, OneError> {
        match target {
            LoadTarget::Session(id) => Ok(id),
            LoadTarget::Filters(filters) => {
                let result = self.search(&filters, false)?;
                match result.eids.as_slice() {
                    [only] => Ok(only.clone()),
                    others => Err(OneError::AmbiguousSession {
                        matched: others.len(),
                    }),
                }
            }
        }
    }
}
