use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::allocator::{BitrateAllocator, LayerSwitch};
use crate::bwe::BandwidthEstimator;
use crate::feedback::{feedback_rtt, parse_feedback, Feedback, FeedbackAdapter};
use crate::pacer::{Pacer, PacedWriter, RtpWriter, StreamInfo};
use crate::rtp::RtpHeader;
use crate::units::Bitrate;
use crate::{Config, Error};

/// The assembled pipeline: feedback adapter, estimator, pacer and
/// allocator, with the workers that drive the latter two.
///
/// The session is the single owner of every component; the only state
/// shared across threads is the published target bitrate and the pacer's
/// bucket and stream table.
pub struct Session {
    adapter: Arc<Mutex<FeedbackAdapter>>,
    estimator: Mutex<BandwidthEstimator>,
    target: Arc<AtomicU64>,
    twcc_seq: Arc<AtomicU64>,
    pacer: Pacer,
    allocator_worker: Option<JoinHandle<()>>,
    allocator_shutdown: Option<mpsc::Sender<()>>,
    switches: Mutex<mpsc::Receiver<LayerSwitch>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    /// Build and start the pipeline. Fails on invalid configuration; the
    /// pacer and allocator workers are running when this returns.
    pub fn new(
        config: Config,
        estimator: BandwidthEstimator,
        allocator: BitrateAllocator,
    ) -> Result<Self, Error> {
        config.validate()?;

        let target = Arc::new(AtomicU64::new(config.initial_bitrate.as_u64()));
        let adapter = Arc::new(Mutex::new(FeedbackAdapter::new()));
        let twcc_seq = Arc::new(AtomicU64::new(0));

        let mut pacer = Pacer::new(&config, Instant::now());

        // Padding carries transport-wide sequence numbers like any other
        // packet, so it feeds the estimator the same way media does.
        let hook_adapter = adapter.clone();
        let hook_seq = twcc_seq.clone();
        pacer.set_send_hook(move |now, header, payload_len| {
            let seq = (hook_seq.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
            header.ext_vals.transport_cc = Some(seq);
            lock(&hook_adapter).on_sent(now, header, payload_len)
        });

        pacer.start()?;

        let (switch_tx, switch_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = spawn_allocator_worker(
            allocator,
            target.clone(),
            config.allocator_interval,
            switch_tx,
            shutdown_rx,
        )?;

        Ok(Session {
            adapter,
            estimator: Mutex::new(estimator),
            target,
            twcc_seq,
            pacer,
            allocator_worker: Some(worker),
            allocator_shutdown: Some(shutdown_tx),
            switches: Mutex::new(switch_rx),
        })
    }

    /// Register an outgoing stream. The returned [`MediaWriter`] stamps the
    /// transport-wide sequence extension, records the packet for feedback
    /// correlation and paces it out.
    pub fn register_stream(
        &self,
        info: StreamInfo,
        writer: impl RtpWriter + 'static,
    ) -> MediaWriter {
        MediaWriter {
            adapter: self.adapter.clone(),
            paced: self.pacer.register_stream(info, writer),
            twcc_seq: self.twcc_seq.clone(),
        }
    }

    /// Remove a stream from pacing and padding.
    pub fn unregister_stream(&self, ssrc: crate::rtp::Ssrc) {
        self.pacer.unregister_stream(ssrc);
    }

    /// Handle an incoming RTCP transport feedback packet (wire format).
    ///
    /// Parses, correlates against sent packets, updates the estimator and
    /// publishes the new target.
    pub fn on_rtcp_feedback(&self, now: Instant, buf: &[u8]) -> Result<(), Error> {
        let feedback = parse_feedback(buf)?;
        self.on_feedback(now, &feedback)
    }

    /// Handle an already-parsed feedback report.
    pub fn on_feedback(&self, now: Instant, feedback: &Feedback) -> Result<(), Error> {
        let acks = {
            let mut adapter = lock(&self.adapter);
            match feedback {
                Feedback::TransportCc(twcc) => adapter.on_transport_cc_feedback(twcc, now)?,
                Feedback::Ccfb(report) => adapter.on_ccfb_feedback(report, now)?,
            }
        };

        if acks.is_empty() {
            return Ok(());
        }

        // The receiver sends its report right after the newest arrival it
        // covers; use that as the report send time for RTT purposes.
        let feedback_sent_time = acks.iter().filter_map(|a| a.arrival).max();
        let rtt = feedback_sent_time.and_then(|sent| feedback_rtt(now, sent, &acks));

        let target = lock(&self.estimator).on_acks(now, rtt, &acks);

        self.target.store(target.as_u64(), Ordering::Relaxed);
        self.pacer.set_target_bitrate(target, now);

        Ok(())
    }

    /// The current target bitrate. Non-blocking; safe from any thread.
    pub fn target_bitrate(&self) -> Bitrate {
        Bitrate::bps(self.target.load(Ordering::Relaxed))
    }

    /// Layer switches performed by the allocator since the last call. Each
    /// switch needs a keyframe request sent upstream.
    pub fn poll_layer_switches(&self) -> Vec<LayerSwitch> {
        lock(&self.switches).try_iter().collect()
    }

    /// The next transport-wide sequence number. `MediaWriter` stamps these
    /// automatically; exposed for callers integrating their own send path.
    pub fn next_twcc_seq(&self) -> u16 {
        (self.twcc_seq.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16
    }

    /// Record a packet sent outside a [`MediaWriter`].
    pub fn on_rtp_sent(
        &self,
        now: Instant,
        header: &RtpHeader,
        payload_len: usize,
    ) -> Result<(), Error> {
        lock(&self.adapter).on_sent(now, header, payload_len)
    }

    /// Shut down the workers. Both exit within one tick interval.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.allocator_shutdown.take();
        if let Some(worker) = self.allocator_worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_allocator_worker(
    mut allocator: BitrateAllocator,
    target: Arc<AtomicU64>,
    interval: std::time::Duration,
    switch_tx: mpsc::Sender<LayerSwitch>,
    shutdown_rx: mpsc::Receiver<()>,
) -> Result<JoinHandle<()>, Error> {
    let handle = thread::Builder::new()
        .name("bitrate-allocator".into())
        .spawn(move || {
            let mut applied = None;

            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                // Consumers read the latest value; intermediate targets may
                // be skipped.
                let current = target.load(Ordering::Relaxed);
                if applied == Some(current) {
                    continue;
                }

                match allocator.set_target_bitrate(Bitrate::bps(current)) {
                    Ok(switches) => {
                        applied = Some(current);
                        for s in switches {
                            debug!("Layer switch: source {} -> {}", s.source, s.quality);
                            if switch_tx.send(s).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Allocator failed to apply target: {}", e);
                    }
                }
            }
        })?;

    Ok(handle)
}

/// Send-path handle for one stream.
///
/// Stamps the transport-wide sequence extension, records the packet in the
/// feedback adapter, debits the pacer and forwards to the wire writer.
pub struct MediaWriter {
    adapter: Arc<Mutex<FeedbackAdapter>>,
    paced: PacedWriter,
    twcc_seq: Arc<AtomicU64>,
}

impl MediaWriter {
    /// Send one packet.
    ///
    /// If the header has no transport-wide sequence number yet, one is
    /// assigned from the session-wide counter.
    pub fn write(
        &self,
        now: Instant,
        header: &mut RtpHeader,
        payload: &[u8],
    ) -> Result<usize, Error> {
        if header.ext_vals.transport_cc.is_none() {
            let seq = (self.twcc_seq.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
            header.ext_vals.transport_cc = Some(seq);
        }

        lock(&self.adapter).on_sent(now, header, payload.len())?;
        self.paced.write(now, header, payload)
    }
}
