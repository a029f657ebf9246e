//! Per-story link bookkeeping
//!
//! A story owns at most one Link instance per LinkPath; every module
//! connecting to the same path gets a connection to the same instance. A
//! link whose last connection has gone reports itself orphaned, and the
//! directory drops it so a later connect starts from persisted state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::link::{Link, LinkConfig, LinkConnection, LinkPath};
use crate::storage::Ledger;

pub struct LinkDirectory {
    store: Arc<dyn Ledger>,
    links: Arc<Mutex<HashMap<LinkPath, Arc<Link>>>>,
}

impl LinkDirectory {
    pub fn new(store: Arc<dyn Ledger>) -> Arc<Self> {
        Arc::new(Self {
            store,
            links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Connect to the link at `path`, instantiating it on first use.
    /// `config` only takes effect for the instantiating caller; later
    /// callers join the existing instance as it is.
    pub async fn connect(
        self: &Arc<Self>,
        path: &LinkPath,
        config: LinkConfig,
        primary: bool,
    ) -> Option<LinkConnection> {
        let link = {
            let Ok(mut links) = self.links.lock() else {
                log::error!("link directory poisoned");
                return None;
            };
            match links.get(path) {
                Some(link) => link.clone(),
                None => {
                    let link = Arc::new(Link::new(
                        path.clone(),
                        config,
                        self.store.clone(),
                    ));
                    self.install_orphan_handler(&link, path.clone());
                    links.insert(path.clone(), link.clone());
                    link
                }
            }
        };
        link.connect(primary).await
    }

    /// Number of live link instances; for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.links.lock().map(|links| links.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install_orphan_handler(self: &Arc<Self>, link: &Arc<Link>, path: LinkPath) {
        let weak: Weak<Self> = Arc::downgrade(self);
        link.set_orphaned_handler(move || {
            let Some(directory) = weak.upgrade() else {
                return;
            };
            // Bound so the guard drops before `directory` at closure end.
            let Ok(mut links) = directory.links.lock() else {
                return;
            };
            if links.remove(&path).is_some() {
                log::info!("{}: orphaned, dropping instance", path);
            }
        });
    }
}
