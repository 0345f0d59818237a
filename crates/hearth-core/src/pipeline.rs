// ── Packet ingestion pipeline ──
//
// One pipeline per physical interface. Transports call `enqueue` from
// their receive path; a single consumer thread drains the ring buffer and
// hands every packet, in receipt order, to the subscribed handlers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::error::CoreError;
use crate::packet::Packet;
use crate::registry::{EventSinkRegistry, HandlerRef, SinkId};

/// Receiver of packets from one or more pipelines.
pub trait PacketHandler: Send + Sync {
    /// Handle one packet. `Ok(true)` means the packet was consumed.
    fn on_packet_received(&self, interface_id: &str, packet: &Packet) -> Result<bool, CoreError>;
}

/// Delivery counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub processed: u64,
    pub handler_failures: u64,
}

// ── Ring buffer ─────────────────────────────────────────────────────

struct Ring {
    slots: Vec<Option<Packet>>,
    head: usize,
    tail: usize,
    available: bool,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            available: false,
        }
    }

    fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
        self.available = false;
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn len(&self) -> usize {
        (self.head + self.capacity() - self.tail) % self.capacity()
    }

    /// Store `packet` at head. Hands it back when the buffer is full.
    fn push(&mut self, packet: Packet) -> Result<(), Packet> {
        let next = (self.head + 1) % self.capacity();
        if next == self.tail {
            return Err(packet);
        }
        if let Some(slot) = self.slots.get_mut(self.head) {
            *slot = Some(packet);
        }
        self.head = next;
        self.available = true;
        Ok(())
    }

    fn pop(&mut self) -> Option<Packet> {
        if self.is_empty() {
            return None;
        }
        let packet = self.slots.get_mut(self.tail).and_then(Option::take);
        self.tail = (self.tail + 1) % self.capacity();
        if self.is_empty() {
            self.available = false;
        }
        packet
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

struct Shared {
    interface_id: String,
    ring: Mutex<Ring>,
    wake: Condvar,
    stop: AtomicBool,
    handlers: EventSinkRegistry<dyn PacketHandler>,
    slow_threshold: Duration,
    last_packet_ms: AtomicI64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    handler_failures: AtomicU64,
}

/// Bounded single-consumer packet queue of one physical interface.
pub struct PacketPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PacketPipeline {
    /// Pipeline with a ring of `capacity` slots (minimum 2).
    pub fn new(interface_id: impl Into<String>, capacity: usize) -> Self {
        Self::with_options(
            interface_id,
            capacity,
            Duration::from_secs(1),
            Duration::from_millis(1),
        )
    }

    pub fn with_options(
        interface_id: impl Into<String>,
        capacity: usize,
        slow_threshold: Duration,
        unsubscribe_poll: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                interface_id: interface_id.into(),
                ring: Mutex::new(Ring::new(capacity.max(2))),
                wake: Condvar::new(),
                stop: AtomicBool::new(true),
                handlers: EventSinkRegistry::with_poll_interval(unsubscribe_poll),
                slow_threshold,
                last_packet_ms: AtomicI64::new(0),
                enqueued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn interface_id(&self) -> &str {
        &self.shared.interface_id
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.lock().capacity()
    }

    /// Packets currently waiting for the consumer.
    pub fn queued(&self) -> usize {
        self.shared.ring.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.shared.stop.load(Ordering::Acquire)
    }

    /// Time the consumer last picked up a packet.
    pub fn last_packet_processed(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_packet_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            handler_failures: self.shared.handler_failures.load(Ordering::Relaxed),
        }
    }

    // ── Subscribers ──────────────────────────────────────────────────

    pub fn subscribe(
        &self,
        id: impl Into<SinkId>,
        handler: Arc<dyn PacketHandler>,
    ) -> HandlerRef<dyn PacketHandler> {
        self.shared.handlers.subscribe(id, handler)
    }

    /// Blocks until no dispatch is inside `handle`.
    pub fn unsubscribe(&self, handle: &HandlerRef<dyn PacketHandler>) {
        self.shared.handlers.unsubscribe(handle);
    }

    pub fn unsubscribe_id(&self, id: &SinkId) -> bool {
        self.shared.handlers.unsubscribe_id(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.handlers.len()
    }

    // ── Producer side ────────────────────────────────────────────────

    /// Queue a packet for processing. Never blocks on the consumer.
    ///
    /// When the ring is full the packet is dropped and `QueueFull` is
    /// returned; the buffer stays usable.
    pub fn enqueue(&self, packet: Packet) -> Result<(), CoreError> {
        let mut ring = self.shared.ring.lock();
        if ring.push(packet).is_err() {
            let capacity = ring.capacity();
            drop(ring);
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                interface = %self.shared.interface_id,
                capacity,
                "more packets queued than the pipeline can hold, packet processing is too slow; dropping packet"
            );
            return Err(CoreError::QueueFull {
                interface: self.shared.interface_id.clone(),
                capacity,
            });
        }
        drop(ring);
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.wake.notify_one();
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start (or restart) the consumer with an empty buffer.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            self.signal_stop();
            join_worker(&self.shared.interface_id, handle);
        }

        self.shared.ring.lock().reset();
        self.shared.stop.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("packets-{}", self.shared.interface_id))
            .spawn(move || consume(&shared))
            .map_err(|e| CoreError::Internal(format!("cannot spawn packet consumer: {e}")))?;
        *worker = Some(handle);
        info!(interface = %self.shared.interface_id, "packet pipeline started");
        Ok(())
    }

    /// Stop the consumer and wait for it. Safe to call repeatedly.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        self.signal_stop();
        if let Some(handle) = handle {
            join_worker(&self.shared.interface_id, handle);
            info!(interface = %self.shared.interface_id, "packet pipeline stopped");
        }
    }

    fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let mut ring = self.shared.ring.lock();
        ring.available = true;
        drop(ring);
        self.shared.wake.notify_all();
    }
}

impl Drop for PacketPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(interface_id: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!(interface = %interface_id, "packet consumer thread panicked");
    }
}

// ── Consumer loop ───────────────────────────────────────────────────

fn consume(shared: &Shared) {
    loop {
        {
            let mut ring = shared.ring.lock();
            while !ring.available && !shared.stop.load(Ordering::Acquire) {
                shared.wake.wait(&mut ring);
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        loop {
            let next = shared.ring.lock().pop();
            let Some(packet) = next else { break };
            let started = Instant::now();
            shared
                .last_packet_ms
                .store(Utc::now().timestamp_millis(), Ordering::Release);

            dispatch(shared, &packet);

            shared.processed.fetch_add(1, Ordering::Relaxed);
            let elapsed = started.elapsed();
            trace!(interface = %shared.interface_id, elapsed_us = elapsed.as_micros(), "packet processed");
            if elapsed > shared.slow_threshold {
                info!(
                    interface = %shared.interface_id,
                    elapsed_ms = elapsed.as_millis(),
                    "packet processing took longer than the slow-packet threshold"
                );
            }
        }
    }
}

fn dispatch(shared: &Shared, packet: &Packet) {
    for entry in shared.handlers.snapshot() {
        let outcome = entry.with_handler(|handler| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_packet_received(&shared.interface_id, packet)
            }))
        });
        match outcome {
            None | Some(Ok(Ok(_))) => {}
            Some(Ok(Err(e))) => {
                shared.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    interface = %shared.interface_id,
                    subscriber = %entry.id(),
                    error = %e,
                    "packet subscriber failed (non-fatal)"
                );
            }
            Some(Err(_)) => {
                shared.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    interface = %shared.interface_id,
                    subscriber = %entry.id(),
                    "packet subscriber panicked"
                );
            }
        }
    }
    debug!(interface = %shared.interface_id, bytes = packet.len(), "packet dispatched");
}
