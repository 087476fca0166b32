//! Audio sources driving the block clock.
//!
//! The engine never paces itself: an [`AudioSource`] invokes the registered
//! callback exactly once per block period, handing in an input block and
//! taking back the block a listener would hear. Two sources are provided,
//! a timer-driven synthetic source for pure simulation and a WAV-file
//! source that plays a recording as the external input. Live device
//! backends plug in through the same trait.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{error, info, warn};

use crate::block::{Block, BLOCK_PERIOD_US, BLOCK_SIZE, SAMPLE_RATE, ZERO_BLOCK};
use crate::config::AudioSourceConfig;

/// Per-block callback: `(input, output)`. Invoked once per block period
/// from the source's streaming thread.
pub type AudioCallback = Arc<dyn Fn(&Block, &mut Block) + Send + Sync>;

/// Contract every clock source implements.
pub trait AudioSource: Send {
    /// Bind the block callback. Must be called before [`Self::start`].
    fn open(&mut self, callback: AudioCallback) -> Result<()>;

    /// Begin streaming blocks.
    fn start(&mut self) -> Result<()>;

    /// Stop streaming. No callbacks fire after this returns.
    fn stop(&mut self);

    /// Release resources. Implies [`Self::stop`].
    fn close(&mut self);

    /// Whether the source is still delivering blocks.
    fn is_running(&self) -> bool;

    /// Sample rate of the delivered blocks in Hz.
    fn sample_rate(&self) -> u32;
}

/// Build the source selected by the configuration.
pub fn create_source(config: &AudioSourceConfig) -> Box<dyn AudioSource> {
    match config {
        AudioSourceConfig::Synthetic { realtime } => Box::new(SyntheticSource::new(*realtime)),
        AudioSourceConfig::WavFile {
            input_path,
            output_path,
            loop_input,
        } => Box::new(WavFileSource::new(
            input_path.clone(),
            output_path.clone(),
            *loop_input,
        )),
    }
}

/// Timer-driven source delivering silent input blocks.
///
/// With `realtime` set the pacing thread sleeps out each block period;
/// otherwise blocks fire back-to-back, running the simulation as fast as
/// the plant computes.
pub struct SyntheticSource {
    realtime: bool,
    callback: Option<AudioCallback>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(realtime: bool) -> Self {
        Self {
            realtime,
            callback: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl AudioSource for SyntheticSource {
    fn open(&mut self, callback: AudioCallback) -> Result<()> {
        self.callback = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let callback = self
            .callback
            .clone()
            .context("synthetic source started before open")?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let running = Arc::clone(&self.running);
        let realtime = self.realtime;
        let period = Duration::from_micros(BLOCK_PERIOD_US);

        self.thread = Some(
            std::thread::Builder::new()
                .name("earsim-audio".into())
                .spawn(move || {
                    let mut output = ZERO_BLOCK;
                    while running.load(Ordering::Acquire) {
                        let started = Instant::now();
                        callback(&ZERO_BLOCK, &mut output);
                        if realtime {
                            if let Some(rest) = period.checked_sub(started.elapsed()) {
                                std::thread::sleep(rest);
                            }
                        }
                    }
                })
                .context("failed to spawn audio pacing thread")?,
        );
        info!(realtime, "synthetic source started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn close(&mut self) {
        self.stop();
        self.callback = None;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.close();
    }
}

type Reader = WavReader<BufReader<File>>;
type Writer = WavWriter<std::io::BufWriter<File>>;

/// WAV-file source: one block read, processed, and paced per period.
///
/// The file is treated as the external input signal; the engine output is
/// optionally recorded to a 32-bit float WAV. Reaching the end of the
/// input stops the source unless `loop_input` is set.
pub struct WavFileSource {
    input_path: PathBuf,
    output_path: Option<PathBuf>,
    loop_input: bool,

    callback: Option<AudioCallback>,
    reader: Option<Reader>,
    writer: Option<Writer>,
    file_sample_rate: u32,

    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WavFileSource {
    pub fn new(input_path: PathBuf, output_path: Option<PathBuf>, loop_input: bool) -> Self {
        Self {
            input_path,
            output_path,
            loop_input,
            callback: None,
            reader: None,
            writer: None,
            file_sample_rate: SAMPLE_RATE,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Read one block of mono samples (first channel) into `block`.
    /// Returns the number of frames read; 0 means end of file.
    fn read_block(reader: &mut Reader, block: &mut Block) -> Result<usize> {
        let spec = reader.spec();
        *block = ZERO_BLOCK;
        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Float, 32) => Self::read_frames(reader, block, |s: f32| s),
            (SampleFormat::Int, 16) => {
                Self::read_frames(reader, block, |s: i16| s as f32 / 32768.0)
            }
            (SampleFormat::Int, 24) => {
                Self::read_frames(reader, block, |s: i32| s as f32 / 8_388_608.0)
            }
            (SampleFormat::Int, 32) => {
                Self::read_frames(reader, block, |s: i32| s as f32 / 2_147_483_648.0)
            }
            (format, bits) => bail!("unsupported WAV format: {bits}-bit {format:?}"),
        }
    }

    fn read_frames<S>(
        reader: &mut Reader,
        block: &mut Block,
        convert: impl Fn(S) -> f32,
    ) -> Result<usize>
    where
        S: hound::Sample,
    {
        let channels = reader.spec().channels as usize;
        let mut samples = reader.samples::<S>();
        let mut frames = 0;

        'frames: for slot in block.iter_mut().take(BLOCK_SIZE) {
            for channel in 0..channels {
                match samples.next() {
                    Some(sample) => {
                        let sample = sample.context("failed to read WAV sample")?;
                        if channel == 0 {
                            *slot = convert(sample);
                        }
                    }
                    None => break 'frames,
                }
            }
            frames += 1;
        }
        Ok(frames)
    }

    fn write_block(writer: &mut Writer, block: &Block) -> Result<()> {
        for &sample in block.iter() {
            writer.write_sample(sample)?;
        }
        Ok(())
    }
}

impl AudioSource for WavFileSource {
    fn open(&mut self, callback: AudioCallback) -> Result<()> {
        let reader = WavReader::open(&self.input_path)
            .with_context(|| format!("failed to open WAV input {}", self.input_path.display()))?;
        let spec = reader.spec();
        self.file_sample_rate = spec.sample_rate;
        info!(
            path = %self.input_path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            duration_s = reader.duration() as f32 / spec.sample_rate as f32,
            "WAV input opened"
        );
        if spec.channels > 1 {
            warn!("multi-channel WAV input; only the first channel is used");
        }
        self.reader = Some(reader);

        if let Some(path) = &self.output_path {
            let out_spec = WavSpec {
                channels: 1,
                sample_rate: SAMPLE_RATE,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            };
            self.writer = Some(
                WavWriter::create(path, out_spec)
                    .with_context(|| format!("failed to create WAV output {}", path.display()))?,
            );
        }

        self.callback = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let callback = self
            .callback
            .clone()
            .context("WAV source started before open")?;
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut reader = self.reader.take().context("WAV source has no open input")?;
        let mut writer = self.writer.take();
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let input_path = self.input_path.clone();
        let loop_input = self.loop_input;
        let period = Duration::from_micros(BLOCK_PERIOD_US);

        self.thread = Some(
            std::thread::Builder::new()
                .name("earsim-audio".into())
                .spawn(move || {
                    let mut input = ZERO_BLOCK;

                    while running.load(Ordering::Acquire) {
                        let started = Instant::now();

                        let frames = match Self::read_block(&mut reader, &mut input) {
                            Ok(frames) => frames,
                            Err(e) => {
                                error!("WAV read failed: {e:#}");
                                break;
                            }
                        };
                        if frames == 0 {
                            if !loop_input {
                                info!("WAV input exhausted");
                                break;
                            }
                            // Rewind by reopening the file.
                            match WavReader::open(&input_path) {
                                Ok(rewound) => {
                                    reader = rewound;
                                    continue;
                                }
                                Err(e) => {
                                    error!("WAV rewind failed: {e:#}");
                                    break;
                                }
                            }
                        }

                        let mut output = ZERO_BLOCK;
                        callback(&input, &mut output);

                        if let Some(w) = writer.as_mut() {
                            if let Err(e) = Self::write_block(w, &output) {
                                error!("WAV write failed: {e:#}");
                                writer = None;
                            }
                        }

                        if let Some(rest) = period.checked_sub(started.elapsed()) {
                            std::thread::sleep(rest);
                        }
                    }

                    if let Some(w) = writer.take() {
                        match w.finalize() {
                            Ok(()) => info!("WAV output finalized"),
                            Err(e) => error!("failed to finalize WAV output: {e:#}"),
                        }
                    }
                    running.store(false, Ordering::Release);
                })
                .context("failed to spawn WAV streaming thread")?,
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn close(&mut self) {
        self.stop();
        self.callback = None;
        self.reader = None;
        // An unfinalized writer patches its header on drop.
        self.writer = None;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn sample_rate(&self) -> u32 {
        self.file_sample_rate
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn temp_wav_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("earsim-{}-{}.wav", tag, std::process::id()))
    }

    fn write_test_wav(path: &PathBuf, frames: usize) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample(((i % 100) as i16) * 100).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_synthetic_source_drives_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let callback: AudioCallback = Arc::new(move |input, _output| {
            assert_eq!(input, &ZERO_BLOCK);
            cb_count.fetch_add(1, Ordering::Relaxed);
        });

        let mut source = SyntheticSource::new(false);
        source.open(callback).unwrap();
        source.start().unwrap();
        assert!(source.is_running());
        std::thread::sleep(Duration::from_millis(30));
        source.stop();

        let ticks = count.load(Ordering::Relaxed);
        assert!(ticks > 10, "only {ticks} ticks");
        assert!(!source.is_running());
    }

    #[test]
    fn test_start_before_open_fails() {
        let mut source = SyntheticSource::new(false);
        assert!(source.start().is_err());
    }

    #[test]
    fn test_wav_source_plays_file_then_stops() {
        let path = temp_wav_path("input");
        write_test_wav(&path, BLOCK_SIZE * 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb_seen = Arc::clone(&seen);
        let callback: AudioCallback = Arc::new(move |input, output| {
            cb_seen.lock().unwrap().push(*input);
            // Echo the input back out.
            output.copy_from_slice(input);
        });

        let out_path = temp_wav_path("output");
        let mut source = WavFileSource::new(path.clone(), Some(out_path.clone()), false);
        source.open(callback).unwrap();
        assert_eq!(source.sample_rate(), SAMPLE_RATE);
        source.start().unwrap();

        // 3 blocks at ~5.3 ms each; give it room.
        std::thread::sleep(Duration::from_millis(120));
        assert!(!source.is_running(), "source should stop at end of file");
        source.close();

        let blocks = seen.lock().unwrap();
        assert_eq!(blocks.len(), 3);
        // First sample of the file is 0, second is 100/32768.
        assert_eq!(blocks[0][0], 0.0);
        assert!((blocks[0][1] - 100.0 / 32768.0).abs() < 1e-6);

        // The echoed output was recorded as f32.
        let mut reader = WavReader::open(&out_path).unwrap();
        assert_eq!(reader.spec().sample_format, SampleFormat::Float);
        assert_eq!(reader.duration() as usize, BLOCK_SIZE * 3);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert!((samples[1] - 100.0 / 32768.0).abs() < 1e-6);

        std::fs::remove_file(&path).ok();
        std::fs::remove_file(&out_path).ok();
    }

    #[test]
    fn test_wav_source_missing_file_fails_open() {
        let mut source = WavFileSource::new(PathBuf::from("/nonexistent/missing.wav"), None, false);
        let callback: AudioCallback = Arc::new(|_, _| {});
        assert!(source.open(callback).is_err());
    }

    #[test]
    fn test_wav_source_loops_when_asked() {
        let path = temp_wav_path("loop");
        write_test_wav(&path, BLOCK_SIZE);

        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let callback: AudioCallback = Arc::new(move |_, _| {
            cb_count.fetch_add(1, Ordering::Relaxed);
        });

        let mut source = WavFileSource::new(path.clone(), None, true);
        source.open(callback).unwrap();
        source.start().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(source.is_running());
        source.stop();

        // One block per period; looping must deliver more than the single
        // block the file holds.
        assert!(count.load(Ordering::Relaxed) > 1);
        std::fs::remove_file(&path).ok();
    }
}
