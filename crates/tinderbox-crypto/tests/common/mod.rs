use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tinderbox_crypto::{
    Cryptobox, CryptoboxConfig, CryptoboxStore, MemoryStore, PreKeyId, StoreError, StoredPreKey,
    X3dhEngine,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A [`MemoryStore`] that records every call and can be told to fail or to
/// yield to the scheduler.
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: MemoryStore,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
    fail_prekey_saves: AtomicBool,
    yield_on_create: AtomicBool,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls in order, as `"operation:key"`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log.lock().iter().position(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prekey_saves(&self, fail: bool) {
        self.fail_prekey_saves.store(fail, Ordering::SeqCst);
    }

    pub fn yield_on_create(&self, enabled: bool) {
        self.yield_on_create.store(enabled, Ordering::SeqCst);
    }

    fn record(&self, entry: String) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(entry);
    }

    fn check_prekey_save(&self) -> Result<(), StoreError> {
        if self.fail_prekey_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("prekey save rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CryptoboxStore for InstrumentedStore {
    async fn delete_all(&self) -> Result<bool, StoreError> {
        self.record("delete_all".into());
        self.inner.delete_all().await
    }

    async fn load_identity(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.record("load_identity".into());
        self.inner.load_identity().await
    }

    async fn save_identity(&self, identity: &[u8]) -> Result<(), StoreError> {
        self.record("save_identity".into());
        self.inner.save_identity(identity).await
    }

    async fn load_prekey(&self, id: PreKeyId) -> Result<Option<Vec<u8>>, StoreError> {
        self.record(format!("load_prekey:{id}"));
        self.inner.load_prekey(id).await
    }

    async fn load_prekeys(&self) -> Result<Vec<StoredPreKey>, StoreError> {
        self.record("load_prekeys".into());
        self.inner.load_prekeys().await
    }

    async fn save_prekey(&self, prekey: &StoredPreKey) -> Result<(), StoreError> {
        self.record(format!("save_prekey:{}", prekey.id));
        self.check_prekey_save()?;
        self.inner.save_prekey(prekey).await
    }

    async fn save_prekeys(&self, prekeys: &[StoredPreKey]) -> Result<(), StoreError> {
        self.record(format!("save_prekeys:{}", prekeys.len()));
        self.check_prekey_save()?;
        self.inner.save_prekeys(prekeys).await
    }

    async fn delete_prekey(&self, id: PreKeyId) -> Result<PreKeyId, StoreError> {
        self.record(format!("delete_prekey:{id}"));
        self.inner.delete_prekey(id).await
    }

    async fn create_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError> {
        if self.yield_on_create.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.record(format!("create_session:{id}"));
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("create rejected".into()));
        }
        self.inner.create_session(id, state).await
    }

    async fn update_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.record(format!("update_session:{id}"));
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("update rejected".into()));
        }
        self.inner.update_session(id, state).await
    }

    async fn read_session(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.record(format!("read_session:{id}"));
        self.inner.read_session(id).await
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.record(format!("delete_session:{id}"));
        self.inner.delete_session(id).await
    }
}

pub type TestBox = Cryptobox<InstrumentedStore, X3dhEngine>;

pub async fn new_box(minimum_prekeys: u32) -> TestBox {
    init_tracing();
    let config = CryptoboxConfig::default().with_minimum_prekeys(minimum_prekeys);
    Cryptobox::create(InstrumentedStore::new(), X3dhEngine, config)
        .await
        .unwrap()
}
