//! Latency-compensated control loop around the acoustic plant.
//!
//! Two threads cooperate with the audio source's streaming thread:
//!
//! - The **plant tick** runs on the audio thread at the hard block cadence.
//!   It reads the currently-effective speaker command from the delay ring,
//!   mixes fresh ambient noise, runs the plant, emits the in-ear signal as
//!   the audio output, and queues the microphone observation.
//! - The **worker** pops queued observations, hands each one to the
//!   controller thread through a rendezvous channel, waits out a one-block
//!   deadline for the result, and installs it into the delay ring. A
//!   controller that overruns its budget gets silence installed in its
//!   place; the audio cadence is never stalled by a slow controller.
//! - The **controller thread** runs the user callback, with panics caught
//!   at the thread boundary.
//!
//! A command installed from the observation of block `k` becomes audible at
//! block `k + L`, where `L` is the configured system latency in blocks.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, error, info, warn};

use crate::block::{
    rms, Block, MicBlock, BLOCK_PERIOD_US, MIC_QUEUE_CAPACITY, SAMPLE_RATE, ZERO_BLOCK,
};
use crate::config::Config;
use crate::delay_ring::DelayRing;
use crate::latest_slot::LatestSlot;
use crate::noise::NoiseGenerator;
use crate::plant::PlantEngine;
use crate::source::{create_source, AudioCallback, AudioSource};

/// User controller callback: consumes one microphone observation, produces
/// one control block.
pub type ProcessMicsFn = Box<dyn FnMut(&MicBlock, &mut Block) + Send>;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built and validated, not yet streaming.
    Configured,
    /// Streaming: plant ticks fire, controller worker is live.
    Running,
    /// Torn down. A stopped engine cannot be restarted.
    Stopped,
}

/// Per-tick RMS levels of the two microphones.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicLevels {
    pub outside_rms: f32,
    pub inear_rms: f32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A controller panic must not take the engine down with it.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct EngineShared {
    /// Control commands in flight, depth = system latency in blocks.
    control_ring: Mutex<DelayRing>,
    /// Plant and its drifting secondary path, locked across one tick.
    plant: Mutex<PlantEngine>,
    noise: Mutex<NoiseGenerator>,

    /// Observations awaiting the controller, oldest first.
    mic_queue: Mutex<VecDeque<MicBlock>>,
    mic_cv: Condvar,

    /// Latest observation for external observers.
    latest: LatestSlot<MicBlock>,

    seq: AtomicU64,
    process_mics: Mutex<Option<ProcessMicsFn>>,

    running: AtomicBool,
    stop: AtomicBool,

    outside_rms_bits: AtomicU32,
    inear_rms_bits: AtomicU32,
}

impl EngineShared {
    /// One plant tick. Runs on the audio source's thread; must not block
    /// beyond the short ring/plant critical sections.
    fn tick(&self, input: &Block, output: &mut Block) {
        if !self.running.load(Ordering::Acquire) {
            output.fill(0.0);
            return;
        }

        // The command the controller produced L ticks ago takes effect now.
        let u = lock(&self.control_ring).peek();

        // Ambient noise: synthetic, plus whatever the source delivered.
        let mut n = lock(&self.noise).next_block();
        for (sample, &x) in n.iter_mut().zip(input.iter()) {
            *sample += x;
        }

        let mut mb = MicBlock::silent();
        {
            let mut plant = lock(&self.plant);
            let propagated = match plant.update_s() {
                Ok(()) => plant.propagate(&u, &n, &mut mb.outside, &mut mb.inear),
                Err(e) => Err(e),
            };
            if let Err(e) = propagated {
                error!("plant propagation failed: {e:#}");
                mb.outside = ZERO_BLOCK;
                mb.inear = ZERO_BLOCK;
            }
        }
        mb.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        mb.timestamp = Instant::now();

        // The in-ear signal is what a listener hears.
        output.copy_from_slice(&mb.inear);

        self.outside_rms_bits
            .store(rms(&mb.outside).to_bits(), Ordering::Relaxed);
        self.inear_rms_bits
            .store(rms(&mb.inear).to_bits(), Ordering::Relaxed);

        self.latest.publish(mb);

        {
            let mut queue = lock(&self.mic_queue);
            if queue.len() >= MIC_QUEUE_CAPACITY {
                // The controller cares about the most recent acoustic
                // reality; shed the oldest observation.
                queue.pop_front();
                debug!(seq = mb.seq, "mic queue full, dropping oldest block");
            }
            queue.push_back(mb);
        }
        self.mic_cv.notify_all();
    }
}

/// Worker: pops observations, supervises the controller deadline, installs
/// control blocks into the delay ring.
fn worker_loop(
    shared: Arc<EngineShared>,
    job_tx: Sender<(u64, MicBlock)>,
    result_rx: Receiver<(u64, Block)>,
    stop_rx: Receiver<()>,
) {
    let budget = Duration::from_micros(BLOCK_PERIOD_US);

    loop {
        let mb = {
            let mut queue = lock(&shared.mic_queue);
            loop {
                if let Some(mb) = queue.pop_front() {
                    break mb;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                queue = shared
                    .mic_cv
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        // Rendezvous with the controller thread. A controller still chewing
        // on an overrun job keeps us here, which is what lets the mic queue
        // absorb (and eventually shed) the backlog.
        select! {
            send(job_tx, (mb.seq, mb)) -> res => {
                if res.is_err() {
                    return;
                }
            }
            recv(stop_rx) -> _ => return,
        }

        let due = Instant::now() + budget;
        let control = loop {
            let remaining = due.saturating_duration_since(Instant::now());
            let msg = select! {
                recv(result_rx) -> msg => msg,
                recv(stop_rx) -> _ => return,
                default(remaining) => {
                    warn!(
                        seq = mb.seq,
                        budget_us = BLOCK_PERIOD_US,
                        "controller missed its deadline, installing silence"
                    );
                    break ZERO_BLOCK;
                }
            };
            match msg {
                Ok((id, block)) if id == mb.seq => break block,
                Ok((id, _)) => debug!(seq = id, "discarding stale controller result"),
                Err(_) => return,
            }
        };

        lock(&shared.control_ring).push(&control);
    }
}

/// Controller thread: runs the user callback for each dispatched job.
fn controller_loop(
    shared: Arc<EngineShared>,
    job_rx: Receiver<(u64, MicBlock)>,
    result_tx: Sender<(u64, Block)>,
) {
    while let Ok((id, mb)) = job_rx.recv() {
        let mut control = ZERO_BLOCK;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut callback = lock(&shared.process_mics);
            if let Some(process) = callback.as_mut() {
                process(&mb, &mut control);
            }
        }));
        if outcome.is_err() {
            error!(seq = id, "controller callback panicked, substituting silence");
            control = ZERO_BLOCK;
        }

        if result_tx.send((id, control)).is_err() {
            return;
        }
    }
}

/// The simulation engine: plant, noise, delay ring, controller loop, and
/// the audio source that clocks them.
///
/// # Example
///
/// ```no_run
/// use earsim_core::{AncEngine, Config};
///
/// # fn main() -> anyhow::Result<()> {
/// let mut engine = AncEngine::new(Config::default())?;
/// engine.set_process_mics(|mics, control| {
///     // Naive phase inversion of the in-ear signal.
///     for (out, &err) in control.iter_mut().zip(mics.inear.iter()) {
///         *out = -err;
///     }
/// });
/// engine.start()?;
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// engine.stop();
/// # Ok(())
/// # }
/// ```
pub struct AncEngine {
    shared: Arc<EngineShared>,
    source: Box<dyn AudioSource>,
    worker: Option<JoinHandle<()>>,
    controller: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
    state: EngineState,
    latency_blocks: usize,
}

impl AncEngine {
    /// Validate the configuration and build the engine in the
    /// [`EngineState::Configured`] state. Nothing runs until
    /// [`Self::start`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid engine configuration")?;

        let latency_blocks = config.timing.system_latency_blocks;
        info!(latency_blocks, "initializing engine");

        let shared = Arc::new(EngineShared {
            control_ring: Mutex::new(DelayRing::new(latency_blocks)),
            plant: Mutex::new(PlantEngine::new(&config)?),
            noise: Mutex::new(NoiseGenerator::new(config.noise.clone(), config.seed)),
            mic_queue: Mutex::new(VecDeque::with_capacity(MIC_QUEUE_CAPACITY)),
            mic_cv: Condvar::new(),
            latest: LatestSlot::new(MicBlock::silent()),
            seq: AtomicU64::new(0),
            process_mics: Mutex::new(None),
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            outside_rms_bits: AtomicU32::new(0),
            inear_rms_bits: AtomicU32::new(0),
        });
        // Observers see a silent frame until the first real tick.
        shared.latest.publish(MicBlock::silent());

        let source = create_source(&config.source);

        Ok(Self {
            shared,
            source,
            worker: None,
            controller: None,
            stop_tx: None,
            state: EngineState::Configured,
            latency_blocks,
        })
    }

    /// Spawn the controller threads, bind the audio callback, and start the
    /// source. Only valid from [`EngineState::Configured`].
    pub fn start(&mut self) -> Result<()> {
        ensure!(
            self.state == EngineState::Configured,
            "engine cannot start from the {:?} state",
            self.state
        );

        let callback: AudioCallback = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |input: &Block, output: &mut Block| shared.tick(input, output))
        };
        self.source
            .open(callback)
            .context("failed to open audio source")?;

        let rate = self.source.sample_rate();
        if rate != SAMPLE_RATE {
            self.source.close();
            anyhow::bail!("audio source delivers {rate} Hz, engine requires {SAMPLE_RATE} Hz");
        }

        let (job_tx, job_rx) = bounded::<(u64, MicBlock)>(0);
        let (result_tx, result_rx) = bounded::<(u64, Block)>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        self.controller = Some(
            std::thread::Builder::new()
                .name("earsim-controller".into())
                .spawn({
                    let shared = Arc::clone(&self.shared);
                    move || controller_loop(shared, job_rx, result_tx)
                })
                .context("failed to spawn controller thread")?,
        );
        self.worker = Some(
            std::thread::Builder::new()
                .name("earsim-worker".into())
                .spawn({
                    let shared = Arc::clone(&self.shared);
                    move || worker_loop(shared, job_tx, result_rx, stop_rx)
                })
                .context("failed to spawn worker thread")?,
        );
        self.stop_tx = Some(stop_tx);

        self.shared.running.store(true, Ordering::Release);
        if let Err(e) = self.source.start() {
            self.shutdown_workers();
            self.state = EngineState::Stopped;
            return Err(e).context("failed to start audio source");
        }

        self.state = EngineState::Running;
        info!("engine running");
        Ok(())
    }

    /// Stop the audio source (no further ticks), then signal and join the
    /// controller threads. Idempotent.
    pub fn stop(&mut self) {
        if self.state != EngineState::Running {
            self.state = EngineState::Stopped;
            return;
        }
        info!("stopping engine");

        // Source first so no tick fires during teardown.
        self.source.stop();
        self.source.close();
        self.shutdown_workers();

        self.state = EngineState::Stopped;
        debug!(
            ticks = self.shared.seq.load(Ordering::Relaxed),
            "engine stopped"
        );
    }

    fn shutdown_workers(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.stop.store(true, Ordering::Release);
        // Dropping the stop channel wakes every select in the worker.
        self.stop_tx.take();
        self.shared.mic_cv.notify_all();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // The worker's exit closes the job channel, which releases the
        // controller thread once any in-flight callback returns.
        if let Some(controller) = self.controller.take() {
            let _ = controller.join();
        }
    }

    /// Latest microphone observation, iff a new one has been published
    /// since the previous successful call.
    pub fn get_mics(&self) -> Option<MicBlock> {
        self.shared.latest.try_read()
    }

    /// Install a control block directly into the delay ring, bypassing the
    /// controller worker. Intended for tests and open-loop experiments.
    pub fn send_control(&self, control: &Block) {
        lock(&self.shared.control_ring).push(control);
    }

    /// Bind (or replace) the controller callback. Takes effect on the next
    /// observation the worker dispatches.
    pub fn set_process_mics<F>(&self, process: F)
    where
        F: FnMut(&MicBlock, &mut Block) + Send + 'static,
    {
        *lock(&self.shared.process_mics) = Some(Box::new(process));
    }

    /// Whether the engine is started and its audio source still delivers.
    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running && self.source.is_running()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Configured system latency in blocks.
    pub fn latency_blocks(&self) -> usize {
        self.latency_blocks
    }

    /// Number of plant ticks since start.
    pub fn ticks(&self) -> u64 {
        self.shared.seq.load(Ordering::Relaxed)
    }

    /// Observations currently queued for the controller.
    pub fn queued_mics(&self) -> usize {
        lock(&self.shared.mic_queue).len()
    }

    /// RMS levels of the most recent tick.
    pub fn mic_levels(&self) -> MicLevels {
        MicLevels {
            outside_rms: f32::from_bits(self.shared.outside_rms_bits.load(Ordering::Relaxed)),
            inear_rms: f32::from_bits(self.shared.inear_rms_bits.load(Ordering::Relaxed)),
        }
    }
}

impl Drop for AncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
