//! Shared JSON documents synchronized through the story's store

pub mod change;
pub mod document;
pub mod entity;
pub mod schema;
pub mod watcher;

#[allow(clippy::module_inception)]
mod link;

pub use change::{ChangeRecord, KeyGenerator, OrderedKey, PatchOp};
pub use link::{Link, LinkConfig, LinkConnection};
pub use schema::SchemaValidator;
pub use watcher::{
    ConnectionId, LinkWatcher, ON_CHANGE_CONNECTION_ID, WATCH_ALL_CONNECTION_ID,
};

/// Identity of a link within a story: the path of the module that created
/// it plus the name the module gave it. Two modules connecting with the
/// same path share the same document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkPath {
    pub module_path: Vec<String>,
    pub link_name: String,
}

impl LinkPath {
    pub fn new(module_path: &[&str], link_name: &str) -> Self {
        Self {
            module_path: module_path.iter().map(|s| s.to_string()).collect(),
            link_name: link_name.to_string(),
        }
    }

    /// Store namespace for this link. Segment separators are chosen to not
    /// collide with the `/` separating the namespace from record keys.
    pub fn link_key(&self) -> String {
        format!("link|{}|{}", self.module_path.join(":"), self.link_name)
    }

    /// Store prefix under which this link's change records live.
    pub fn record_prefix(&self) -> String {
        format!("{}/", self.link_key())
    }

    /// Full store key for one change record.
    pub fn record_key(&self, key: &OrderedKey) -> String {
        format!("{}/{}", self.link_key(), key)
    }
}

impl std::fmt::Display for LinkPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.link_key())
    }
}
