mod app;
mod web;

use std::sync::Arc;

use crate::app::{App, AppFactory};
use crate::catalog::{CatalogSnapshot, CatalogStore};
use crate::config::Config;
use crate::semantic::VectorIndexHandle;
use fakes::{retry_policy, FakeChat, FakeEmbedder, RecordingSleeper};

pub const CATALOG: &[&str] = &[
    "PAPEL TOALHA INTERFOLHADO 2 DOBRAS 1000 FOLHAS",
    "PAPEL TOALHA BOBINA 200M",
    "PAPEL HIGIENICO ROLAO 300M",
    "DETERGENTE NEUTRO 5L",
    "SABONETE LIQUIDO 5L",
    "LUVA NITRILICA AZUL TAMANHO M",
    "SACO DE LIXO 100L PRETO",
];

/// An isolated base directory with a catalog, fake providers and a config
/// pointing at both. Each test gets its own directory.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: Config,
    pub embedder: Arc<FakeEmbedder>,
    pub chat: Arc<FakeChat>,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(FakeEmbedder::new(), FakeChat::new())
    }

    pub fn with(embedder: FakeEmbedder, chat: FakeChat) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default().with_base_path(dir.path());
        config.embedding.batch_size = 4;
        config.index.chunk_size = 40;
        config.index.chunk_overlap = 10;

        let fixture = Self {
            dir,
            config,
            embedder: Arc::new(embedder),
            chat: Arc::new(chat),
            sleeper: Arc::new(RecordingSleeper::default()),
        };
        fixture.write_catalog(CATALOG);
        fixture
    }

    pub fn catalog(&self) -> CatalogStore {
        CatalogStore::new(self.config.catalog_path())
    }

    pub fn write_catalog(&self, names: &[&str]) {
        self.catalog()
            .save(&CatalogSnapshot::from_names(names.iter().copied()))
            .expect("failed to write catalog");
    }

    pub fn handle(&self) -> Arc<VectorIndexHandle> {
        AppFactory::create_index_handle(
            &self.config,
            self.embedder.clone(),
            retry_policy(self.sleeper.clone()),
        )
    }

    pub fn app(&self) -> App {
        AppFactory::build_app(
            &self.config,
            self.embedder.clone(),
            self.chat.clone(),
            retry_policy(self.sleeper.clone()),
        )
    }
}
