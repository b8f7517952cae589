//! Explicit block-engine registry.
//!
//! The server receives this at construction and owns the lifecycle of
//! every engine inside: no process-wide globals. Today VSB is the only
//! engine kind; the registry keeps the resolve-by-kind seam the rest of
//! the code programs against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use eventflow_vsb::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Vsb,
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<HashMap<EngineKind, Arc<Engine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: EngineKind, engine: Arc<Engine>) {
        self.engines.lock().unwrap().insert(kind, engine);
    }

    pub fn resolve(&self, kind: EngineKind) -> Option<Arc<Engine>> {
        self.engines.lock().unwrap().get(&kind).cloned()
    }

    /// Close every registered engine. Idempotent: engines are drained from
    /// the registry on the first call.
    pub async fn close_all(&self) {
        let engines: Vec<Arc<Engine>> = {
            let mut map = self.engines.lock().unwrap();
            map.drain().map(|(_, e)| e).collect()
        };
        for engine in engines {
            engine.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_vsb::VsbConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_insert_resolve_close() {
        let dir = tempdir().unwrap();
        let registry = EngineRegistry::new();
        assert!(registry.resolve(EngineKind::Vsb).is_none());

        let engine = Arc::new(
            Engine::load(dir.path(), VsbConfig::default(), None)
                .await
                .unwrap(),
        );
        registry.insert(EngineKind::Vsb, engine);
        assert!(registry.resolve(EngineKind::Vsb).is_some());

        registry.close_all().await;
        assert!(registry.resolve(EngineKind::Vsb).is_none());
        // Second close is a no-op.
        registry.close_all().await;
    }
}
