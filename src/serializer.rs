//! Single-writer discipline over the Transport Adapter, with bounded
//! retry on transient "operation in progress" busyness. Many host GATT
//! stacks reject overlapping writes, so every write, control or packet,
//! on either characteristic, funnels through one queue here.

use crate::error::{DfuError, Result};
use crate::transport::{CharacteristicKind, DfuTransport, is_busy};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_ATTEMPTS: u32 = 15;
const RETRY_DELAY: Duration = Duration::from_millis(150);

/// Serializes GATT writes across both Control and Packet characteristics
/// so that at most one is ever outstanding.
pub struct WriteSerializer {
    lock: StdRwLock<Arc<Mutex<()>>>,
    disconnected: AtomicBool,
}

impl Default for WriteSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteSerializer {
    pub fn new() -> Self {
        Self { lock: StdRwLock::new(Arc::new(Mutex::new(()))), disconnected: AtomicBool::new(false) }
    }

    /// Submit `bytes` for `characteristic`, retrying transparently on busy
    /// signals. Resolves once a previous submission (on either
    /// characteristic) has completed.
    pub async fn submit<T: DfuTransport>(&self, transport: &T, characteristic: CharacteristicKind, bytes: &[u8]) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DfuError::Disconnected);
        }

        let queue = self.lock.read().unwrap().clone();
        let _guard = queue.lock().await;

        for attempt in 0..MAX_ATTEMPTS {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(DfuError::Disconnected);
            }

            match transport.write(characteristic, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) => {
                    if attempt + 1 == MAX_ATTEMPTS {
                        return Err(DfuError::TransportBusy);
                    }
                    log::debug!("transport busy, retrying write (attempt {}/{MAX_ATTEMPTS})", attempt + 1);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(DfuError::Transport(e)),
            }
        }

        Err(DfuError::TransportBusy)
    }

    /// Reset the queue to an empty, resolved state. Called when the peer
    /// disconnects; outstanding and future `submit` calls fail with
    /// [`DfuError::Disconnected`] until [`Self::reconnect`] is called.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Clear the disconnected flag ahead of a fresh connection.
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    /// Swap in a fresh, uncontended queue. Called by the Smart Speed
    /// Controller before each same-speed or degraded retry, so a retried
    /// window never joins behind whatever the failed attempt left queued.
    pub fn reset(&self) {
        *self.lock.write().unwrap() = Arc::new(Mutex::new(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CharacteristicSet;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU32;

    struct FlakyTransport {
        busy_until: u32,
        calls: AtomicU32,
    }

    impl DfuTransport for FlakyTransport {
        fn is_connected(&self) -> bool {
            true
        }
        fn characteristics(&self) -> CharacteristicSet {
            CharacteristicSet { control: true, packet: true, buttonless: false }
        }
        async fn write(&self, _characteristic: CharacteristicKind, _bytes: &[u8]) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.busy_until {
                Err(anyhow!("operation in progress"))
            } else {
                Ok(())
            }
        }
        async fn subscribe(&self, _characteristic: CharacteristicKind) -> anyhow::Result<()> {
            Ok(())
        }
        async fn next_notification(&self) -> Option<(CharacteristicKind, Vec<u8>)> {
            None
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_busy_writes_transparently() {
        let transport = FlakyTransport { busy_until: 3, calls: AtomicU32::new(0) };
        let serializer = WriteSerializer::new();
        serializer.submit(&transport, CharacteristicKind::Packet, b"abc").await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_fifteen_busy_responses() {
        let transport = FlakyTransport { busy_until: u32::MAX, calls: AtomicU32::new(0) };
        let serializer = WriteSerializer::new();
        let err = serializer.submit(&transport, CharacteristicKind::Packet, b"abc").await.unwrap_err();
        assert!(matches!(err, DfuError::TransportBusy));
        assert_eq!(transport.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_busy_errors_propagate_immediately() {
        struct AlwaysFails;
        impl DfuTransport for AlwaysFails {
            fn is_connected(&self) -> bool {
                true
            }
            fn characteristics(&self) -> CharacteristicSet {
                CharacteristicSet::default()
            }
            async fn write(&self, _characteristic: CharacteristicKind, _bytes: &[u8]) -> anyhow::Result<()> {
                Err(anyhow!("value too long; longer than maximum length"))
            }
            async fn subscribe(&self, _characteristic: CharacteristicKind) -> anyhow::Result<()> {
                Ok(())
            }
            async fn next_notification(&self) -> Option<(CharacteristicKind, Vec<u8>)> {
                None
            }
            async fn disconnect(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let serializer = WriteSerializer::new();
        let err = serializer.submit(&AlwaysFails, CharacteristicKind::Packet, b"abc").await.unwrap_err();
        assert!(matches!(err, DfuError::Transport(_)));
        assert!(err.to_string().contains("longer than maximum length"));
    }
}
