//! Transport contract and per-interface common state.
//!
//! Every transport driver implements [`Transport`]; the engine wraps the
//! driver in an [`Interface`] carrying the state shared by all drivers:
//! the callback list, the current receive handler and the receive-timeout
//! timer.

use crate::buffer::PacketBuf;
use crate::error::PacketError;
use crate::types::{InterfaceId, Wait};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Header and footer bytes a transport reserves around each frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overhead {
    pub header: usize,
    pub footer: usize,
}

/// Operations every transport driver provides.
///
/// `send` consumes the frame: the driver must transmit (or fail) and
/// return; the pipeline then runs `notify_tx_result` and frees the
/// buffer. A driver must never touch a buffer after returning.
#[async_trait]
pub trait Transport: Send + Sync {
    fn interface_id(&self) -> InterfaceId;

    /// Bytes to reserve around the payload for transport framing.
    fn overhead(&self) -> Overhead {
        Overhead::default()
    }

    /// Amend TX metadata immediately before framing. Periodic flag
    /// contracts (the UDP ACK request) hook in here.
    fn prepare_tx(&self, _buf: &mut PacketBuf) {}

    /// Transmit one fully-framed packet.
    async fn send(&self, buf: &mut PacketBuf) -> Result<(), PacketError>;

    /// Enable or disable raw reception.
    async fn receive_ctrl(&self, _enable: bool) -> Result<(), PacketError> {
        Err(PacketError::NotSupported)
    }

    /// Current usable packet size. `None` when the transport cannot say;
    /// `Some(0)` when not currently connected.
    fn max_packet_size(&self) -> Option<usize> {
        None
    }

    /// Raw decrypt outcome for per-transport accounting (watchdog feeds,
    /// ACK countdown resets).
    fn decrypt_result(&self, _buf: &PacketBuf, _result: &Result<(), PacketError>) {}
}

/// Non-owning reference to a registered interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceHandle(pub(crate) usize);

impl InterfaceHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Callbacks observers can attach to an interface.
#[derive(Default)]
pub struct InterfaceCallbacks {
    /// Runs for every failed transmission on this interface.
    pub tx_failure: Option<Box<dyn Fn(&PacketBuf, &PacketError) + Send + Sync>>,
    /// Runs for every received packet, after decryption. Returning false
    /// consumes the packet: the default receive handler is suppressed and
    /// the buffer is freed.
    pub packet_received: Option<Box<dyn Fn(&PacketBuf, bool) -> bool + Send + Sync>>,
    /// Runs when the driver reports a connectivity change, with the new
    /// maximum payload (0 = disconnected).
    pub interface_state: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

/// Token for removing a registered callback set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// Receive-side dispatch target for an interface.
#[async_trait]
pub trait ReceiveHandler: Send + Sync {
    async fn handle(self: Arc<Self>, engine: &Arc<crate::pipeline::Engine>, buf: PacketBuf);
}

struct ReceiveTimer {
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

/// A registered transport plus the common state every transport shares.
pub struct Interface {
    handle: InterfaceHandle,
    transport: Arc<dyn Transport>,
    callbacks: Mutex<Vec<(u64, Arc<InterfaceCallbacks>)>>,
    next_callback: AtomicU64,
    receive_handler: Mutex<Arc<dyn ReceiveHandler>>,
    receive_timer: Mutex<ReceiveTimer>,
}

impl Interface {
    pub(crate) fn new(
        handle: InterfaceHandle,
        transport: Arc<dyn Transport>,
        default_handler: Arc<dyn ReceiveHandler>,
    ) -> Self {
        Self {
            handle,
            transport,
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            receive_handler: Mutex::new(default_handler),
            receive_timer: Mutex::new(ReceiveTimer {
                deadline: None,
                task: None,
            }),
        }
    }

    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.transport.interface_id()
    }

    /// Attach a callback set; keep the id to detach it later.
    pub fn register_callbacks(&self, callbacks: Arc<InterfaceCallbacks>) -> CallbackId {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().unwrap().push((id, callbacks));
        CallbackId(id)
    }

    pub fn unregister_callbacks(&self, id: CallbackId) {
        self.callbacks.lock().unwrap().retain(|(cb, _)| *cb != id.0);
    }

    /// Snapshot of the callback list, safe against concurrent removal.
    pub(crate) fn callbacks(&self) -> Vec<Arc<InterfaceCallbacks>> {
        self.callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    /// Replace the receive handler (gateway mode installs its own).
    pub fn set_receive_handler(&self, handler: Arc<dyn ReceiveHandler>) {
        *self.receive_handler.lock().unwrap() = handler;
    }

    pub(crate) fn receive_handler(&self) -> Arc<dyn ReceiveHandler> {
        self.receive_handler.lock().unwrap().clone()
    }

    /// Driver-facing: report a connectivity change to all observers.
    pub fn notify_state(&self, max_payload: usize) {
        for cb in self.callbacks() {
            if let Some(f) = &cb.interface_state {
                f(max_payload);
            }
        }
    }

    /// Enable or disable reception.
    ///
    /// `NoWait` disables immediately, `Forever` enables until disabled,
    /// and a finite timeout enables reception and schedules a disable at
    /// `now + timeout`. Repeated finite calls keep the later of the two
    /// deadlines, so requests extend rather than truncate.
    pub async fn receive(self: &Arc<Self>, timeout: Wait) -> Result<(), PacketError> {
        match timeout {
            Wait::NoWait => {
                self.cancel_receive_timer();
                self.transport.receive_ctrl(false).await
            }
            Wait::Forever => {
                self.cancel_receive_timer();
                self.transport.receive_ctrl(true).await
            }
            Wait::For(duration) => {
                self.transport.receive_ctrl(true).await?;
                let new_deadline = Instant::now() + duration;
                let mut timer = self.receive_timer.lock().unwrap();
                timer.deadline = Some(match timer.deadline {
                    Some(current) if current > new_deadline => current,
                    _ => new_deadline,
                });
                let running = timer.task.as_ref().is_some_and(|t| !t.is_finished());
                if !running {
                    let iface = self.clone();
                    timer.task = Some(tokio::spawn(async move {
                        iface.receive_expiry().await;
                    }));
                }
                Ok(())
            }
        }
    }

    /// Sleeper behind finite receive timeouts. Honours deadline
    /// extensions made while it slept.
    async fn receive_expiry(self: Arc<Self>) {
        loop {
            let deadline = match self.receive_timer.lock().unwrap().deadline {
                Some(d) => d,
                None => return,
            };
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
        self.receive_timer.lock().unwrap().deadline = None;
        debug!(interface = %self.interface_id(), "receive window expired");
        let _ = self.transport.receive_ctrl(false).await;
    }

    fn cancel_receive_timer(&self) {
        let mut timer = self.receive_timer.lock().unwrap();
        timer.deadline = None;
        if let Some(task) = timer.task.take() {
            task.abort();
        }
    }

    /// Final step of every transmission: run the buffer's completion
    /// callback, fan failures out to observers, then free the buffer.
    pub fn notify_tx_result(&self, mut buf: PacketBuf, result: Result<(), PacketError>) {
        if let Some(done) = buf.tx_mut().tx_done.take() {
            done(&result);
        }
        if let Err(err) = &result {
            for cb in self.callbacks() {
                if let Some(f) = &cb.tx_failure {
                    f(&buf, err);
                }
            }
        }
        // Dropping the buffer returns it to the pool.
    }
}

/// In-memory transport for tests and loopback use.
///
/// Records every sent frame and lets tests steer connectivity, send
/// failures and the reported packet size.
pub struct DummyTransport {
    interface_id: InterfaceId,
    max_packet: Mutex<Option<usize>>,
    enabled: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    sent_signal: Notify,
    decrypt_results: Mutex<Vec<bool>>,
}

impl DummyTransport {
    pub fn new() -> Self {
        Self::with_id(InterfaceId::Dummy)
    }

    pub fn with_id(interface_id: InterfaceId) -> Self {
        Self {
            interface_id,
            max_packet: Mutex::new(None),
            enabled: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            sent_signal: Notify::new(),
            decrypt_results: Mutex::new(Vec::new()),
        }
    }

    pub fn set_max_packet(&self, size: Option<usize>) {
        *self.max_packet.lock().unwrap() = size;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn decrypt_results(&self) -> Vec<bool> {
        self.decrypt_results.lock().unwrap().clone()
    }

    /// Wait until at least `count` frames have been sent.
    pub async fn wait_for_sends(&self, count: usize) {
        loop {
            let notified = self.sent_signal.notified();
            if self.sent.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Default for DummyTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for DummyTransport {
    fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    async fn send(&self, buf: &mut PacketBuf) -> Result<(), PacketError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(PacketError::NotConnected);
        }
        self.sent.lock().unwrap().push(buf.data().to_vec());
        self.sent_signal.notify_waiters();
        Ok(())
    }

    async fn receive_ctrl(&self, enable: bool) -> Result<(), PacketError> {
        self.enabled.store(enable, Ordering::Relaxed);
        Ok(())
    }

    fn max_packet_size(&self) -> Option<usize> {
        *self.max_packet.lock().unwrap()
    }

    fn decrypt_result(&self, _buf: &PacketBuf, result: &Result<(), PacketError>) {
        self.decrypt_results.lock().unwrap().push(result.is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, PoolKind};
    use crate::pipeline::Engine;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl ReceiveHandler for NoopHandler {
        async fn handle(self: Arc<Self>, _engine: &Arc<Engine>, _buf: PacketBuf) {}
    }

    fn interface(transport: Arc<DummyTransport>) -> Arc<Interface> {
        Arc::new(Interface::new(
            InterfaceHandle(0),
            transport,
            Arc::new(NoopHandler),
        ))
    }

    #[tokio::test]
    async fn test_receive_no_wait_disables() {
        let transport = Arc::new(DummyTransport::new());
        let iface = interface(transport.clone());

        iface.receive(Wait::Forever).await.expect("enable");
        assert!(transport.is_enabled());

        iface.receive(Wait::NoWait).await.expect("disable");
        assert!(!transport.is_enabled());

        // Idempotent in both directions.
        iface.receive(Wait::NoWait).await.expect("disable again");
        assert!(!transport.is_enabled());
        iface.receive(Wait::Forever).await.expect("enable again");
        iface.receive(Wait::Forever).await.expect("still enabled");
        assert!(transport.is_enabled());
    }

    #[tokio::test]
    async fn test_finite_receive_expires() {
        let transport = Arc::new(DummyTransport::new());
        let iface = interface(transport.clone());

        iface
            .receive(Wait::For(Duration::from_millis(30)))
            .await
            .expect("enable");
        assert!(transport.is_enabled());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!transport.is_enabled());
    }

    #[tokio::test]
    async fn test_later_receive_extends_deadline() {
        let transport = Arc::new(DummyTransport::new());
        let iface = interface(transport.clone());

        iface
            .receive(Wait::For(Duration::from_millis(100)))
            .await
            .expect("enable");
        iface
            .receive(Wait::For(Duration::from_millis(30)))
            .await
            .expect("extend");

        // The shorter request must not truncate the earlier deadline.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(transport.is_enabled());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!transport.is_enabled());
    }

    #[tokio::test]
    async fn test_notify_tx_result_runs_tx_done_and_failures() {
        let transport = Arc::new(DummyTransport::new());
        let iface = interface(transport);

        let failures = Arc::new(AtomicUsize::new(0));
        let observed = failures.clone();
        iface.register_callbacks(Arc::new(InterfaceCallbacks {
            tx_failure: Some(Box::new(move |_, _| {
                observed.fetch_add(1, Ordering::Relaxed);
            })),
            ..Default::default()
        }));

        let pool = BufferPool::new(PoolKind::Tx, 2, 64);
        let done = Arc::new(AtomicUsize::new(0));

        // Successful send: tx_done fires, tx_failure does not.
        let mut buf = pool.try_alloc().expect("buffer");
        let counter = done.clone();
        buf.tx_mut().tx_done = Some(Box::new(move |result| {
            assert!(result.is_ok());
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        iface.notify_tx_result(buf, Ok(()));
        assert_eq!(done.load(Ordering::Relaxed), 1);
        assert_eq!(failures.load(Ordering::Relaxed), 0);

        // Failed send: both fire.
        let mut buf = pool.try_alloc().expect("buffer");
        let counter = done.clone();
        buf.tx_mut().tx_done = Some(Box::new(move |result| {
            assert!(result.is_err());
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        iface.notify_tx_result(buf, Err(PacketError::NotConnected));
        assert_eq!(done.load(Ordering::Relaxed), 2);
        assert_eq!(failures.load(Ordering::Relaxed), 1);

        // Buffers returned to the pool in both cases.
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn test_callback_unregistration() {
        let transport = Arc::new(DummyTransport::new());
        let iface = interface(transport);

        let hits = Arc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        let id = iface.register_callbacks(Arc::new(InterfaceCallbacks {
            interface_state: Some(Box::new(move |_| {
                observed.fetch_add(1, Ordering::Relaxed);
            })),
            ..Default::default()
        }));

        iface.notify_state(100);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        iface.unregister_callbacks(id);
        iface.notify_state(100);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
