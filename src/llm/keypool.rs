use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};

/// Round-robin pool of API keys shared by concurrent sessions. The only
/// shared state is the cursor, so a single atomic covers it.
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<String>,
    next: AtomicUsize,
}

impl KeyPool {
    pub fn new(keys: Vec<String>) -> Result<Self> {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(anyhow!("at least one API key is required"));
        }
        Ok(KeyPool {
            keys,
            next: AtomicUsize::new(0),
        })
    }

    pub fn next_key(&self) -> &str {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[index]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_keys_in_order() {
        let pool = KeyPool::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let picks: Vec<&str> = (0..6).map(|_| pool.next_key()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn skips_blank_entries() {
        let pool = KeyPool::new(vec!["  ".into(), "real".into(), "".into()]).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.next_key(), "real");
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(KeyPool::new(vec!["".into()]).is_err());
    }

    #[test]
    fn distributes_across_threads() {
        use std::sync::Arc;

        let pool = Arc::new(KeyPool::new(vec!["a".into(), "b".into()]).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        pool.next_key();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // 1000 draws across 2 keys leaves the cursor back at an even offset.
        assert_eq!(pool.next.load(std::sync::atomic::Ordering::Relaxed) % 2, 0);
    }
}
