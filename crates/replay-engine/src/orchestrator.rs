//! The recorder controller.
//!
//! [`Recorder`] is the only writer of pipeline state. Lifecycle operations
//! (start, stop, config restart, exit handling) are serialized by one mutex;
//! the state itself sits behind a separate lock so queries never wait on a
//! spawn. Events raised under those locks are queued in an outbox and
//! published once the locks are released.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use replay_audio::{AudioRelay, DeviceEnumerator, StaticDeviceList};
use replay_buffer::RetentionPolicy;
use replay_extract::{
    ExtractError, ExtractRequest, ExtractionLock, FfmpegRemuxer, Remuxer, ReplayExtractor,
};
use replay_ipc::{
    AudioDevice, BufferStatus, Notification, PipelineState, RecorderCommand, RecorderConfig,
    RecorderEvent, StopReason,
};
use replay_pipeline::{PipelineExit, PipelineSupervisor, DEFAULT_STOP_GRACE};

use crate::config::ConfigStore;
use crate::error::{ConfigError, EngineError};
use crate::events::{EventHub, Outbox};
use crate::session::{ScratchPaths, Session};
use crate::EngineResult;

/// Delay between stop and start when a config change forces a restart.
pub const RESTART_SETTLE: Duration = Duration::from_secs(1);

/// Upper bound on waiting for an in-flight extraction at shutdown.
const EXTRACTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Optional collaborators and timings for a [`Recorder`].
pub struct RecorderOptions {
    /// Remux implementation. Defaults to ffmpeg from the config.
    pub remuxer: Option<Arc<dyn Remuxer>>,

    /// Device source. Defaults to a list published by the host.
    pub devices: Option<Arc<dyn DeviceEnumerator>>,

    /// Working data location.
    pub scratch: ScratchPaths,

    /// How long a stopping encoder may take before it is killed.
    pub stop_grace: Duration,

    /// Delay between stop and start on a device change.
    pub restart_settle: Duration,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            remuxer: None,
            devices: None,
            scratch: ScratchPaths::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            restart_settle: RESTART_SETTLE,
        }
    }
}

struct Inner {
    config: ConfigStore,
    state: RwLock<PipelineState>,
    session: Mutex<Option<Session>>,
    lifecycle: Mutex<()>,
    supervisor: PipelineSupervisor,
    relay: AudioRelay,
    published_devices: Arc<StaticDeviceList>,
    devices: Arc<dyn DeviceEnumerator>,
    remuxer: Option<Arc<dyn Remuxer>>,
    scratch: ScratchPaths,
    stop_grace: Duration,
    restart_settle: Duration,
    extraction: ExtractionLock,
    // Set while a config restart waits out the settle delay.
    restart_pending: AtomicBool,
    events: EventHub,
}

/// Controller for the capture pipeline, buffer and extraction.
pub struct Recorder {
    inner: Arc<Inner>,
    exit_watcher: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

impl Recorder {
    /// Create a recorder with default options.
    pub fn new(config: ConfigStore) -> EngineResult<Self> {
        Self::with_options(config, RecorderOptions::default())
    }

    pub fn with_options(config: ConfigStore, options: RecorderOptions) -> EngineResult<Self> {
        let (supervisor, exit_rx) = PipelineSupervisor::new()?;
        let published_devices = Arc::new(StaticDeviceList::default());
        let devices = options
            .devices
            .unwrap_or_else(|| Arc::clone(&published_devices) as Arc<dyn DeviceEnumerator>);

        let inner = Arc::new(Inner {
            config,
            state: RwLock::new(PipelineState::Idle),
            session: Mutex::new(None),
            lifecycle: Mutex::new(()),
            supervisor,
            relay: AudioRelay::new(),
            published_devices,
            devices,
            remuxer: options.remuxer,
            scratch: options.scratch,
            stop_grace: options.stop_grace,
            restart_settle: options.restart_settle,
            extraction: ExtractionLock::new(),
            restart_pending: AtomicBool::new(false),
            events: EventHub::new(),
        });

        let should_stop = Arc::new(AtomicBool::new(false));
        let exit_watcher = spawn_exit_watcher(Arc::downgrade(&inner), exit_rx, Arc::clone(&should_stop))?;

        Ok(Self {
            inner,
            exit_watcher: Some(exit_watcher),
            should_stop,
        })
    }

    /// Start recording. Does nothing if a pipeline is already running.
    pub fn start(&self) -> EngineResult<()> {
        self.inner.start()
    }

    /// Stop recording. Does nothing if idle.
    ///
    /// Returns once state is `Idle`; the encoder finishes in the background.
    pub fn stop(&self) {
        self.inner.stop(StopReason::UserRequested);
    }

    /// Save the trailing window to a file on a background thread.
    ///
    /// Returns `None` if an extraction is already in flight; the request is
    /// dropped. The outcome arrives as a [`Notification`].
    pub fn extract(&self) -> Option<JoinHandle<()>> {
        Arc::clone(&self.inner).extract()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.read().is_active()
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state.read().clone()
    }

    /// Whether an extraction is running.
    pub fn is_extracting(&self) -> bool {
        self.inner.extraction.is_busy()
    }

    /// Register a listener for recording on/off edges.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.events.on_state_change(Arc::new(listener));
    }

    /// Register a listener for extraction outcomes.
    pub fn on_notification<F>(&self, listener: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.events.on_notification(Arc::new(listener));
    }

    /// Receive every event on a channel.
    pub fn subscribe(&self) -> Receiver<RecorderEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> RecorderConfig {
        self.inner.config.get()
    }

    /// Whether the host should start recording right after launch.
    pub fn should_start_on_launch(&self) -> bool {
        self.inner.config.should_start_on_launch()
    }

    /// Validate, persist and apply a new configuration.
    ///
    /// Changing an audio device while recording restarts the pipeline.
    /// Other pipeline settings apply at the next start.
    pub fn update_config(&self, config: RecorderConfig) -> Result<(), ConfigError> {
        self.inner.update_config(config)
    }

    /// Forward relayed audio samples. Ignored unless the relay is running.
    pub fn push_audio(&self, samples: &[f32]) -> bool {
        self.inner.relay.push(samples)
    }

    /// Devices currently known to the recorder.
    pub fn audio_devices(&self) -> Vec<AudioDevice> {
        self.inner.devices.enumerate().unwrap_or_else(|e| {
            warn!("Failed to enumerate audio devices: {}", e);
            Vec::new()
        })
    }

    /// Publish the devices the host detected.
    pub fn set_audio_devices(&self, devices: Vec<AudioDevice>) {
        self.inner.published_devices.set(devices);
    }

    /// Buffer occupancy, if recording.
    pub fn buffer_status(&self) -> Option<BufferStatus> {
        self.inner.session.lock().as_ref().map(Session::stats)
    }

    /// Stop the pipeline and wait for an in-flight extraction.
    ///
    /// The persisted recording flag is left as it was, so the next launch
    /// can resume.
    #[instrument(name = "recorder_shutdown", skip(self))]
    pub fn shutdown(&self) {
        self.inner.stop(StopReason::Shutdown);

        let deadline = Instant::now() + EXTRACTION_DRAIN_TIMEOUT;
        while self.inner.extraction.is_busy() {
            if Instant::now() >= deadline {
                warn!("Extraction still running at shutdown, abandoning");
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Run the command loop (blocking) until `Shutdown` or disconnect.
    #[instrument(name = "recorder_run", skip(self, command_rx))]
    pub fn run(&self, command_rx: Receiver<RecorderCommand>) {
        info!("Recorder command loop starting");
        self.inner.events.emit(RecorderEvent::Ready);

        loop {
            match command_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    self.shutdown();
                    break;
                }
            }
        }

        info!("Recorder command loop stopped");
    }

    /// Handle a command. Returns false if the loop should end.
    fn handle_command(&self, command: RecorderCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            RecorderCommand::Start => {
                if let Err(e) = self.start() {
                    warn!("Start failed: {}", e);
                }
            }
            RecorderCommand::Stop => self.stop(),
            RecorderCommand::SaveReplay => {
                self.extract();
            }
            RecorderCommand::UpdateConfig(config) => {
                if let Err(e) = self.update_config(*config) {
                    warn!("Config rejected: {}", e);
                }
            }
            RecorderCommand::SetAudioDevices(devices) => self.set_audio_devices(devices),
            RecorderCommand::GetAudioDevices => {
                let devices = self.audio_devices();
                self.inner.events.emit(RecorderEvent::AudioDevices(devices));
            }
            RecorderCommand::GetState => {
                let state = self.state();
                self.inner.events.emit(RecorderEvent::StateChanged {
                    previous: Box::new(state.clone()),
                    current: Box::new(state),
                });
            }
            RecorderCommand::Shutdown => {
                self.shutdown();
                self.inner.events.emit(RecorderEvent::Shutdown);
                return false;
            }
        }

        true
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.inner.stop(StopReason::Shutdown);
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.exit_watcher.take() {
            let _ = handle.join();
        }
    }
}

impl Inner {
    #[instrument(name = "recorder_start", skip(self))]
    fn start(&self) -> EngineResult<()> {
        let mut outbox = Outbox::new();
        let result = {
            let _lifecycle = self.lifecycle.lock();
            self.start_locked(&mut outbox)
        };
        self.events.publish(outbox);
        result
    }

    fn start_locked(&self, outbox: &mut Outbox) -> EngineResult<()> {
        if !self.state.read().is_idle() {
            debug!("Pipeline already running, ignoring start");
            return Ok(());
        }

        info!("Starting recording");
        self.transition_to(PipelineState::Starting, outbox);

        let config = self.config.get();
        let devices = self.devices.enumerate().unwrap_or_else(|e| {
            warn!("Failed to enumerate audio devices: {}", e);
            Vec::new()
        });

        match Session::launch(&self.supervisor, &config, &devices, &self.scratch, &self.relay) {
            Ok(session) => {
                let active = session.active_state();
                *self.session.lock() = Some(session);
                self.transition_to(active, outbox);
                self.config.set_was_recording(true);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start pipeline: {}", e);
                self.relay.stop();
                self.transition_to(PipelineState::Idle, outbox);
                Err(e)
            }
        }
    }

    #[instrument(name = "recorder_stop", skip(self))]
    fn stop(&self, reason: StopReason) {
        let mut outbox = Outbox::new();
        {
            let _lifecycle = self.lifecycle.lock();
            if self.restart_pending.swap(false, Ordering::SeqCst) {
                info!(?reason, "Pending restart cancelled");
                if reason == StopReason::UserRequested {
                    self.config.set_was_recording(false);
                }
            }
            self.stop_locked(reason, &mut outbox);
        }
        self.events.publish(outbox);
    }

    /// Returns false if nothing was running.
    fn stop_locked(&self, reason: StopReason, outbox: &mut Outbox) -> bool {
        let Some(session) = self.session.lock().take() else {
            debug!("Not recording, ignoring stop");
            return false;
        };

        info!(?reason, "Stopping recording");
        self.relay.stop();
        self.transition_to(PipelineState::Stopping { reason: reason.clone() }, outbox);
        session.shutdown(self.stop_grace);
        self.transition_to(PipelineState::Idle, outbox);

        if reason == StopReason::UserRequested {
            self.config.set_was_recording(false);
        }
        true
    }

    fn handle_exit(&self, exit: PipelineExit) {
        let mut outbox = Outbox::new();
        {
            let _lifecycle = self.lifecycle.lock();
            let mut slot = self.session.lock();
            if slot.as_ref().map(Session::generation) == Some(exit.generation) {
                let session = slot.take();
                drop(slot);

                warn!(pid = exit.pid, code = ?exit.code, "Pipeline exited while recording");
                self.relay.stop();
                self.transition_to(
                    PipelineState::Stopping {
                        reason: StopReason::PipelineExited { code: exit.code },
                    },
                    &mut outbox,
                );
                drop(session);
                self.transition_to(PipelineState::Idle, &mut outbox);
            } else {
                debug!(
                    generation = exit.generation,
                    requested = exit.requested,
                    "Exit of retired pipeline"
                );
            }
        }
        self.events.publish(outbox);
    }

    fn update_config(&self, config: RecorderConfig) -> Result<(), ConfigError> {
        let previous = self.config.update(config.clone())?;
        info!("Config updated");

        let restart = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(session) => {
                    session.set_policy(RetentionPolicy::from_config(&config));
                    previous.audio_devices_differ(&config)
                }
                None => false,
            }
        };

        if restart {
            self.restart();
        }
        Ok(())
    }

    /// Stop, wait for the devices to be released, start again.
    ///
    /// A stop issued during the settle delay cancels the second half.
    #[instrument(name = "recorder_restart", skip(self))]
    fn restart(&self) {
        info!("Audio devices changed, restarting pipeline");
        let mut outbox = Outbox::new();
        {
            let _lifecycle = self.lifecycle.lock();
            if self.stop_locked(StopReason::ConfigChanged, &mut outbox) {
                self.restart_pending.store(true, Ordering::SeqCst);
            }
        }
        self.events.publish(outbox);

        thread::sleep(self.restart_settle);

        let mut outbox = Outbox::new();
        let result = {
            let _lifecycle = self.lifecycle.lock();
            self.restart_pending
                .swap(false, Ordering::SeqCst)
                .then(|| self.start_locked(&mut outbox))
        };
        self.events.publish(outbox);

        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => error!("Restart after config change failed: {}", e),
            None => debug!("Restart cancelled while settling"),
        }
    }

    #[instrument(name = "recorder_extract", skip(self))]
    fn extract(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let Some(guard) = self.extraction.try_acquire() else {
            debug!("Extraction already in progress, ignoring request");
            return None;
        };

        let requested_at = chrono::Local::now();
        let config = self.config.get();
        let source = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(session) => session.extract_source(),
                None => Err(ExtractError::NotRecording),
            }
        };

        let request = source.map(|source| ExtractRequest {
            source,
            window: Duration::from_secs(u64::from(config.window_seconds)),
            output_dir: self.config.output_dir(),
            min_buffer_bytes: config.min_buffer_bytes,
            min_artifact_bytes: config.min_artifact_bytes,
            requested_at,
        });
        let remuxer = self
            .remuxer
            .clone()
            .unwrap_or_else(|| Arc::new(FfmpegRemuxer::new(config.pipeline_program.clone())));
        let extractor = ReplayExtractor::new(remuxer, self.scratch.work());

        let inner = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("replay-extract".to_string())
            .spawn(move || {
                let _guard = guard;
                let result = request.and_then(|request| extractor.extract(request));
                inner.events.emit(RecorderEvent::Notification(notification_for(result)));
                if let Some(status) = inner.session.lock().as_ref().map(Session::stats) {
                    debug!(
                        entries = status.entries,
                        bytes = status.bytes,
                        span_secs = status.span_seconds,
                        "Buffer after extraction"
                    );
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start extraction thread: {}", e);
                self.events.emit(RecorderEvent::Notification(notification_for(Err(
                    ExtractError::Io {
                        path: PathBuf::new(),
                        source: e,
                    },
                ))));
                None
            }
        }
    }

    /// Swap state and queue the resulting events.
    fn transition_to(&self, new_state: PipelineState, outbox: &mut Outbox) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        let was_recording = previous.is_active();
        let recording = new_state.is_active();
        outbox.push(RecorderEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
        if was_recording != recording {
            outbox.push(RecorderEvent::RecordingChanged(recording));
        }
    }
}

fn notification_for(result: Result<PathBuf, ExtractError>) -> Notification {
    match result {
        Ok(path) => {
            let folder = path.parent().map(PathBuf::from).unwrap_or_default();
            Notification::ReplaySaved { path, folder }
        }
        Err(e) => {
            if matches!(
                e,
                ExtractError::InsufficientBuffer { .. } | ExtractError::NotRecording
            ) {
                info!("Replay not saved: {}", e);
            } else {
                warn!("Replay failed: {}", e);
            }
            Notification::ReplayFailed {
                reason: e.failure(),
                message: e.to_string(),
            }
        }
    }
}

fn spawn_exit_watcher(
    inner: Weak<Inner>,
    exit_rx: Receiver<PipelineExit>,
    should_stop: Arc<AtomicBool>,
) -> EngineResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("pipeline-exit-watcher".to_string())
        .spawn(move || {
            while !should_stop.load(Ordering::SeqCst) {
                match exit_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(exit) => match inner.upgrade() {
                        Some(inner) => inner.handle_exit(exit),
                        None => break,
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Exit watcher stopped");
        })
        .map_err(EngineError::Thread)
}
