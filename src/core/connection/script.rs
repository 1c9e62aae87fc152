// src/core/connection/script.rs

//! The server-side bulk-delete script and its cached handle.

use lazy_static::lazy_static;
use parking_lot::RwLock;

/// Maximum number of keys passed to a single `DEL` by the bulk-delete script.
pub const DELETE_BATCH_SIZE: usize = 5000;

lazy_static! {
    /// Deletes every key matching `ARGV[1]` in batches of at most
    /// `DELETE_BATCH_SIZE` keys and returns how many keys matched.
    pub static ref BULK_DELETE_SCRIPT: String = format!(
        "local keys = redis.call('keys', ARGV[1])\n\
         for i = 1, #keys, {batch} do\n\
         \x20   redis.call('del', unpack(keys, i, math.min(i + {last}, #keys)))\n\
         end\n\
         return #keys",
        batch = DELETE_BATCH_SIZE,
        last = DELETE_BATCH_SIZE - 1,
    );
}

/// The SHA1 handle of a loaded script, filled lazily on first use.
///
/// Racing loads are harmless: the broker derives the handle from the script body,
/// so every loader stores the same value.
#[derive(Debug)]
pub struct ScriptHandle {
    source: &'static str,
    sha1: RwLock<Option<String>>,
}

impl ScriptHandle {
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            sha1: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn cached(&self) -> Option<String> {
        self.sha1.read().clone()
    }

    pub fn store(&self, sha1: String) {
        *self.sha1.write() = Some(sha1);
    }

    /// Forgets the handle after the broker reported it unknown.
    pub fn invalidate(&self) {
        self.sha1.write().take();
    }
}
