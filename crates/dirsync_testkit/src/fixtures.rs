//! Changelog fixtures and tracing setup.

use dirsync_core::{ChangeRecord, ChangelogConfig, ChangelogDb, Csn, DomainId};
use dirsync_storage::{FileSegmentStore, MemorySegmentStore, SegmentStore};
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Installs a test tracing subscriber once per process.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes through the test
/// harness so it only shows for failing tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer().with_target(true))
            .with(filter)
            .try_init();
    });
}

/// A changelog with automatic cleanup.
pub struct TestChangelog {
    /// The changelog.
    pub changelog: Arc<ChangelogDb>,
    /// The segment store under it.
    pub store: Arc<dyn SegmentStore>,
    config: ChangelogConfig,
    /// Kept alive to prevent cleanup.
    _temp_dir: Option<TempDir>,
}

impl TestChangelog {
    /// Creates an in-memory changelog.
    pub fn memory() -> Self {
        Self::memory_with(ChangelogConfig::default())
    }

    /// Creates an in-memory changelog with `config`.
    pub fn memory_with(config: ChangelogConfig) -> Self {
        let store: Arc<dyn SegmentStore> = Arc::new(MemorySegmentStore::new());
        let changelog = ChangelogDb::open(Arc::clone(&store), config.clone())
            .expect("Failed to open in-memory changelog");
        Self {
            changelog: Arc::new(changelog),
            store,
            config,
            _temp_dir: None,
        }
    }

    /// Creates a changelog in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(ChangelogConfig::default())
    }

    /// Creates a changelog in a temporary directory with `config`.
    pub fn file_with(config: ChangelogConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let (changelog, store) = open_file(temp_dir.path(), &config);
        Self {
            changelog,
            store,
            config,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Closes the changelog and opens it again on the same storage, as after
    /// a restart.
    pub fn reopen(self) -> Self {
        self.changelog.close().expect("Failed to close changelog");
        let Self {
            changelog,
            store,
            config,
            _temp_dir,
        } = self;
        drop(changelog);

        match _temp_dir {
            Some(temp_dir) => {
                drop(store);
                let (changelog, store) = open_file(temp_dir.path(), &config);
                Self {
                    changelog,
                    store,
                    config,
                    _temp_dir: Some(temp_dir),
                }
            }
            None => {
                let changelog = ChangelogDb::open(Arc::clone(&store), config.clone())
                    .expect("Failed to reopen in-memory changelog");
                Self {
                    changelog: Arc::new(changelog),
                    store,
                    config,
                    _temp_dir: None,
                }
            }
        }
    }

    /// Directory of a file-backed changelog.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Publishes an empty change for every CSN, in order.
    pub fn publish_all(&self, domain: &DomainId, csns: &[Csn]) {
        for csn in csns {
            self.changelog
                .publish(&ChangeRecord::new(*csn, domain.clone(), csn.to_string()))
                .expect("Failed to publish change");
        }
    }
}

impl std::ops::Deref for TestChangelog {
    type Target = ChangelogDb;

    fn deref(&self) -> &Self::Target {
        &self.changelog
    }
}

fn open_file(root: &Path, config: &ChangelogConfig) -> (Arc<ChangelogDb>, Arc<dyn SegmentStore>) {
    let store: Arc<dyn SegmentStore> =
        Arc::new(FileSegmentStore::open(root).expect("Failed to open segment store"));
    let changelog =
        ChangelogDb::open(Arc::clone(&store), config.clone()).expect("Failed to open changelog");
    (Arc::new(changelog), store)
}

/// Creates an in-memory changelog.
pub fn memory_changelog() -> TestChangelog {
    TestChangelog::memory()
}

/// Creates a changelog in a temporary directory.
pub fn file_changelog() -> TestChangelog {
    TestChangelog::file()
}
