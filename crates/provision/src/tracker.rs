//! Challenge record tracker
//!
//! Correlates a `present` call with its later `clean_up` by ACME challenge
//! token. One tracker belongs to one provider instance; the lock is never
//! held across an await.

use crate::error::{ProvisionError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Token-keyed map of provider record handles
#[derive(Debug)]
pub struct RecordTracker<H> {
    entries: Mutex<HashMap<String, H>>,
}

impl<H: Clone> RecordTracker<H> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store the handle for `token`; fails if the token already has one
    pub fn track(&self, token: &str, handle: H) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(token) {
            return Err(ProvisionError::TokenInUse {
                token: token.to_string(),
            });
        }
        entries.insert(token.to_string(), handle);
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<H> {
        self.entries.lock().get(token).cloned()
    }

    /// Like [`get`](Self::get) but an untracked token is an error
    pub fn handle(&self, token: &str) -> Result<H> {
        self.get(token).ok_or_else(|| ProvisionError::UnknownRecord {
            token: token.to_string(),
        })
    }

    /// Drop the entry for `token`, returning its handle
    pub fn release(&self, token: &str) -> Option<H> {
        self.entries.lock().remove(token)
    }

    pub fn is_tracked(&self, token: &str) -> bool {
        self.entries.lock().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<H: Clone> Default for RecordTracker<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_track_and_release() {
        let tracker = RecordTracker::new();
        tracker.track("tok-1", "record-1".to_string()).unwrap();

        assert!(tracker.is_tracked("tok-1"));
        assert_eq!(tracker.handle("tok-1").unwrap(), "record-1");
        assert_eq!(tracker.release("tok-1").as_deref(), Some("record-1"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let tracker = RecordTracker::new();
        tracker.track("tok", 1u32).unwrap();

        let err = tracker.track("tok", 2u32).unwrap_err();
        assert!(matches!(err, ProvisionError::TokenInUse { ref token } if token == "tok"));
        assert_eq!(tracker.get("tok"), Some(1));
    }

    #[test]
    fn test_unknown_token() {
        let tracker: RecordTracker<u32> = RecordTracker::new();
        assert!(matches!(
            tracker.handle("missing"),
            Err(ProvisionError::UnknownRecord { .. })
        ));
        assert_eq!(tracker.release("missing"), None);
    }

    #[test]
    fn test_concurrent_tracking() {
        let tracker = Arc::new(RecordTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        tracker.track(&format!("tok-{}-{}", i, j), j).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.len(), 400);
    }
}
