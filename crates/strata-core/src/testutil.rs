use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;

use crate::error::Result;
use crate::storage::Backend;

/// In-memory storage backend for unit tests. Thread-safe via Mutex, and
/// counts `get` calls per object so tests can assert download behavior.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
    gets: Mutex<HashMap<String, u64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            gets: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.data.lock().unwrap().insert(name.to_string(), data);
    }

    /// How many times `get` was called for `name`.
    pub fn get_count(&self, name: &str) -> u64 {
        self.gets.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl Backend for MemoryBackend {
    fn list(&self) -> Result<Vec<(String, u64)>> {
        let map = self.data.lock().unwrap();
        let mut out: Vec<(String, u64)> = map
            .iter()
            .map(|(k, v)| (k.clone(), v.len() as u64))
            .collect();
        out.sort();
        Ok(out)
    }

    fn get(&self, name: &str, out: &mut dyn Write) -> Result<Option<u64>> {
        *self
            .gets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
        let map = self.data.lock().unwrap();
        match map.get(name) {
            Some(data) => {
                out.write_all(data)?;
                Ok(Some(data.len() as u64))
            }
            None => Ok(None),
        }
    }

    fn put(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let n = buf.len() as u64;
        self.data.lock().unwrap().insert(name.to_string(), buf);
        Ok(n)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.data.lock().unwrap().remove(name);
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        if let Some(v) = map.remove(old) {
            map.insert(new.to_string(), v);
        }
        Ok(())
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(name).map(|v| v.len() as u64))
    }
}
