//! In-memory transport for tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Transport;
use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    fail_writes: bool,
    writes: Vec<Vec<u8>>,
}

/// Mock transport recording every write
///
/// Clones share state, so a test can keep one handle while the session owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a closed mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with `ConnectionLost`
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// All writes so far, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Number of writes so far
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// All written bytes concatenated
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock().writes.concat()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        self.lock().open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().open = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(CoreError::NotConnected);
        }
        if state.fail_writes {
            return Err(CoreError::ConnectionLost("mock write failure".into()));
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}
