// master/src/state.rs

use common::{EntityStore, InsightConfig};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub config: Arc<InsightConfig>,
    // rutas absolutas que algún worker está parseando ahora mismo
    pub in_flight: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    pub fn new(store: Arc<dyn EntityStore>, config: InsightConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Reserva todas las rutas o ninguna. `None` si alguna ya está en vuelo.
    pub fn try_claim(&self, paths: Vec<String>) -> Option<InFlightGuard> {
        let mut set = lock_set(&self.in_flight);
        if paths.iter().any(|p| set.contains(p)) {
            return None;
        }
        set.extend(paths.iter().cloned());
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            paths,
        })
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        lock_set(&self.in_flight).contains(path)
    }
}

// Un panic con el lock tomado no debe dejar rutas reservadas para siempre.
fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Libera las rutas reservadas al salir de scope, termine como termine el parseo.
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    paths: Vec<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = lock_set(&self.set);
        for p in &self.paths {
            set.remove(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MemoryStore;

    fn state() -> AppState {
        AppState::new(Arc::new(MemoryStore::new()), InsightConfig::default())
    }

    #[test]
    fn claim_es_todo_o_nada() {
        let st = state();
        let g1 = st.try_claim(vec!["/a".into(), "/b".into()]).unwrap();
        assert!(st.try_claim(vec!["/b".into(), "/c".into()]).is_none());
        assert!(!st.is_in_flight("/c"));

        drop(g1);
        assert!(!st.is_in_flight("/a"));
        assert!(st.try_claim(vec!["/b".into(), "/c".into()]).is_some());
    }
}
