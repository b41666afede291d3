//! Token-bucket pacer with round-robin RTX padding.
//!
//! Media writes pass through unimpeded and debit the bucket; a worker tick
//! refills it from the target rate and spends any surplus on padding,
//! resending each enrolled stream's last packet as RTX (RFC 4588).

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::macros::log_stat;
use crate::rtp::{Pt, RtpHeader, Ssrc};
use crate::units::Bitrate;
use crate::{Config, Error};

mod budget;
mod round_robin;

use budget::IntervalBudget;
use round_robin::RoundRobin;

/// Destination for paced RTP packets, normally the SRTP/socket layer.
///
/// Returning [`Error::WriterClosed`] stops padding for the stream; any other
/// error is logged and pacing continues.
pub trait RtpWriter: Send {
    fn write(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<usize, Error>;
}

/// Registration data for one outgoing stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub ssrc: Ssrc,
    /// RTX stream SSRC. Streams without RTX are paced but never padded.
    pub rtx_ssrc: Option<Ssrc>,
    /// RTX payload type.
    pub rtx_payload_type: Option<Pt>,
}

struct CachedPacket {
    header: RtpHeader,
    payload: Vec<u8>,
}

struct RtxState {
    ssrc: Ssrc,
    payload_type: Pt,
    next_seq: u16,
}

type SharedWriter = Arc<Mutex<dyn RtpWriter>>;

#[derive(Default)]
struct StreamTable {
    writers: HashMap<Ssrc, SharedWriter>,
    rtx: HashMap<Ssrc, RtxState>,
    last_packet: HashMap<Ssrc, CachedPacket>,
    round_robin: RoundRobin,
}

/// Hook invoked for every padding packet before it is written, so the send
/// side can stamp the transport-wide sequence extension and record the
/// packet for feedback correlation.
pub type SendHook = Box<dyn FnMut(Instant, &mut RtpHeader, usize) -> Result<(), Error> + Send>;

struct Shared {
    budget: Mutex<IntervalBudget>,
    streams: Mutex<StreamTable>,
    send_hook: Mutex<Option<SendHook>>,
}

/// The pacer. Owns the token bucket and, once started, the worker thread
/// that emits padding.
pub struct Pacer {
    shared: Arc<Shared>,
    step: Duration,
    worker: Option<JoinHandle<()>>,
    shutdown: Option<mpsc::Sender<()>>,
}

/// Handle for writing media through the pacer.
///
/// Writes debit the token bucket under a short lock and cache the packet
/// for later RTX padding, then forward to the underlying writer. They are
/// never delayed by a low budget.
#[derive(Clone)]
pub struct PacedWriter {
    shared: Arc<Shared>,
    ssrc: Ssrc,
    writer: SharedWriter,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pacer {
    /// Create a pacer. The worker is not running until
    /// [`Pacer::start`] is called; until then [`Pacer::tick`] drives it.
    pub fn new(config: &Config, now: Instant) -> Self {
        Pacer {
            shared: Arc::new(Shared {
                budget: Mutex::new(IntervalBudget::new(
                    config.initial_bitrate,
                    config.pacer_window,
                    now,
                )),
                streams: Mutex::new(StreamTable::default()),
                send_hook: Mutex::new(None),
            }),
            step: config.pacer_step,
            worker: None,
            shutdown: None,
        }
    }

    /// Spawn the worker thread ticking at the configured interval.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let step = self.step;

        let handle = thread::Builder::new()
            .name("pacer".into())
            .spawn(move || loop {
                match rx.recv_timeout(step) {
                    Err(RecvTimeoutError::Timeout) => shared.tick(Instant::now()),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        self.worker = Some(handle);
        self.shutdown = Some(tx);

        Ok(())
    }

    /// Update the pacing rate. Stored tokens are clipped into the new
    /// window.
    pub fn set_target_bitrate(&self, rate: Bitrate, now: Instant) {
        lock(&self.shared.budget).set_target_rate(rate, now);
    }

    /// Install the hook run for each padding packet before it is written.
    pub fn set_send_hook(
        &self,
        hook: impl FnMut(Instant, &mut RtpHeader, usize) -> Result<(), Error> + Send + 'static,
    ) {
        *lock(&self.shared.send_hook) = Some(Box::new(hook));
    }

    /// Register a stream. The returned [`PacedWriter`] is the send path;
    /// streams with RTX parameters are also enrolled for padding.
    pub fn register_stream(
        &self,
        info: StreamInfo,
        writer: impl RtpWriter + 'static,
    ) -> PacedWriter {
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let mut streams = lock(&self.shared.streams);
        streams.writers.insert(info.ssrc, writer.clone());
        if let (Some(rtx_ssrc), Some(rtx_pt)) = (info.rtx_ssrc, info.rtx_payload_type) {
            streams.round_robin.add(info.ssrc);
            streams.rtx.insert(
                info.ssrc,
                RtxState {
                    ssrc: rtx_ssrc,
                    payload_type: rtx_pt,
                    next_seq: rand::random(),
                },
            );
        }
        drop(streams);

        PacedWriter {
            shared: self.shared.clone(),
            ssrc: info.ssrc,
            writer,
        }
    }

    /// Remove a stream from pacing and padding.
    pub fn unregister_stream(&self, ssrc: Ssrc) {
        lock(&self.shared.streams).remove(ssrc);
    }

    /// Run one pacer step. Called by the worker; tests and simulations can
    /// drive it directly when the worker is not started.
    pub fn tick(&self, now: Instant) {
        self.shared.tick(now);
    }

    /// Stop the worker. The thread exits within one tick interval.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the worker via Disconnected.
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl StreamTable {
    fn remove(&mut self, ssrc: Ssrc) {
        self.writers.remove(&ssrc);
        self.rtx.remove(&ssrc);
        self.last_packet.remove(&ssrc);
        self.round_robin.remove(ssrc);
    }

    /// Pick padding packets worth at most `available` bytes, round-robin
    /// over the enrolled streams.
    ///
    /// Stops when the next candidate would overflow the remaining budget
    /// (cursor stays on it, so it is first next tick) or when a full cycle
    /// finds no packet to resend.
    fn build_padding(&mut self, available: usize) -> Vec<PaddingPacket> {
        let mut result = Vec::new();
        let mut bytes = 0;
        let mut skipped_in_a_row = 0;

        while bytes < available && skipped_in_a_row < self.round_robin.len() {
            let Some(ssrc) = self.round_robin.peek() else {
                break;
            };

            let (Some(last), Some(rtx), Some(writer)) = (
                self.last_packet.get(&ssrc),
                self.rtx.get_mut(&ssrc),
                self.writers.get(&ssrc),
            ) else {
                // Nothing cached yet for this stream.
                self.round_robin.advance();
                skipped_in_a_row += 1;
                continue;
            };

            let header = last.header.to_rtx(rtx.ssrc, rtx.payload_type, rtx.next_seq);

            // Two bytes for the original sequence number prefix.
            let size = header.marshal_size() + 2 + last.payload.len();
            if size >= available - bytes {
                break;
            }
            rtx.next_seq = rtx.next_seq.wrapping_add(1);

            let mut payload = Vec::with_capacity(2 + last.payload.len());
            payload.extend_from_slice(&last.header.sequence_number.to_be_bytes());
            payload.extend_from_slice(&last.payload);

            bytes += size;
            result.push(PaddingPacket {
                ssrc,
                writer: writer.clone(),
                header,
                payload,
            });
            self.round_robin.advance();
            skipped_in_a_row = 0;
        }

        result
    }
}

struct PaddingPacket {
    ssrc: Ssrc,
    writer: SharedWriter,
    header: RtpHeader,
    payload: Vec<u8>,
}

impl Shared {
    fn tick(&self, now: Instant) {
        let available = lock(&self.budget).bytes_remaining(now);
        if available == 0 {
            return;
        }

        let padding = lock(&self.streams).build_padding(available);

        for mut packet in padding {
            if let Some(hook) = lock(&self.send_hook).as_mut() {
                if let Err(e) = hook(now, &mut packet.header, packet.payload.len()) {
                    warn!("Padding send hook failed: {}", e);
                    continue;
                }
            }

            let size = packet.header.marshal_size() + packet.payload.len();
            lock(&self.budget).use_budget(size, now);
            log_stat!("PACER_PADDING", size);

            let result = lock(&packet.writer).write(&packet.header, &packet.payload);
            match result {
                Ok(_) => {}
                Err(Error::WriterClosed) => {
                    debug!("Writer for {} closed, unbinding stream", packet.ssrc);
                    lock(&self.streams).remove(packet.ssrc);
                }
                Err(e) => {
                    warn!("Failed to write padding packet: {}", e);
                }
            }
        }
    }
}

impl PacedWriter {
    /// Send one packet. Debits the pacer budget and caches the packet for
    /// RTX padding, then forwards to the underlying writer.
    pub fn write(
        &self,
        now: Instant,
        header: &RtpHeader,
        payload: &[u8],
    ) -> Result<usize, Error> {
        let size = header.marshal_size() + payload.len();
        lock(&self.shared.budget).use_budget(size, now);

        {
            let mut streams = lock(&self.shared.streams);
            if streams.rtx.contains_key(&self.ssrc) && header.ssrc == self.ssrc {
                streams.last_packet.insert(
                    self.ssrc,
                    CachedPacket {
                        header: header.clone(),
                        payload: payload.to_vec(),
                    },
                );
            }
        }

        lock(&self.writer).write(header, payload)
    }
}
