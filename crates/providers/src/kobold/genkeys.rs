use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

const GENKEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const GENKEY_LEN: usize = 10;

/// Fresh key identifying one generation job on the server.
pub fn generate_genkey() -> String {
    let mut rng = thread_rng();
    (0..GENKEY_LEN)
        .map(|_| GENKEY_CHARSET[rng.gen_range(0..GENKEY_CHARSET.len())] as char)
        .collect()
}

/// Latest genkey per channel.
///
/// Entries are overwritten by each new generation on the channel and live as
/// long as the registry. Two generations racing on the same channel leave
/// whichever registered last; an abort then targets that one.
#[derive(Debug, Default)]
pub struct GenKeyRegistry {
    keys: Mutex<HashMap<String, String>>,
}

impl GenKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // The map stays consistent even if a holder panicked.
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a key for `channel`, replacing any previous one, and returns it.
    pub fn register(&self, channel: &str) -> String {
        let key = generate_genkey();
        self.insert(channel, key.clone());
        key
    }

    pub fn insert(&self, channel: &str, genkey: String) -> Option<String> {
        self.lock().insert(channel.to_string(), genkey)
    }

    pub fn get(&self, channel: &str) -> Option<String> {
        self.lock().get(channel).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
