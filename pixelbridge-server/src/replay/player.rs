//! The stream player.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use pixelbridge_core::protocol::Packet;

use crate::device::{DeviceError, DoneSignal, Ordinal};

use super::streamfile::EventStreamReader;

/// Receives every playback packet, typically by routing it onward.
pub type PacketSink =
    Arc<dyn Fn(Ordinal, &str, &Packet<'_>) -> Result<(), DeviceError> + Send + Sync>;

/// Claims a cooperative playback lease, signalling other subsystems to
/// refrain from driving devices while playback is active.
///
/// The lease is cooperative; it is up to all participating playback
/// mechanisms to sort out who holds it. Releasing an unheld lease does
/// nothing.
pub trait PlaybackLeaser: Send + Sync {
    fn acquire_playback_lease(&self);
    fn release_playback_lease(&self);
}

/// A leaser that does nothing.
pub struct NoopLeaser;

impl PlaybackLeaser for NoopLeaser {
    fn acquire_playback_lease(&self) {}
    fn release_playback_lease(&self) {}
}

/// The player's current status.
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub path: PathBuf,

    /// The number of playback rounds started, counting the current one.
    pub rounds: i64,

    pub position: Duration,
    pub duration: Duration,

    /// Wall-clock playtime, net of pauses.
    pub total_playtime: Duration,

    pub paused: bool,

    /// Devices that packets could not be routed to, by recorded device.
    pub no_route_devices: Vec<NoRouteEntry>,
}

/// A [`PlayerStatus`] entry for an unroutable device.
#[derive(Debug, Clone)]
pub struct NoRouteEntry {
    pub id: String,
    pub ordinal: Ordinal,
    pub count: i64,
}

enum PlayerCommand {
    Pause,
    Resume,
    Status(oneshot::Sender<PlayerStatus>),
}

/// Plays a stream file back to a sink with its recorded timing.
///
/// Playback runs in a single task: it loops over the stream in rounds,
/// sleeping between events, and accepts pause/resume/status commands
/// between waits. Pausing releases the playback lease and stops the
/// clock; resuming re-acquires the lease and shifts the schedule by the
/// paused duration. Events that fall more than `max_lag_age` behind are
/// dropped.
pub struct Player {
    sink: PacketSink,
    leaser: Arc<dyn PlaybackLeaser>,
    max_lag_age: Duration,

    active: Option<ActivePlayback>,
}

struct ActivePlayback {
    stop: DoneSignal,
    finished: DoneSignal,
    cmd_tx: mpsc::UnboundedSender<PlayerCommand>,
}

impl Player {
    pub fn new(sink: PacketSink) -> Self {
        Player {
            sink,
            leaser: Arc::new(NoopLeaser),
            max_lag_age: Duration::from_secs(1),
            active: None,
        }
    }

    /// Uses `leaser` to claim the playback lease while playing.
    pub fn with_leaser(mut self, leaser: Arc<dyn PlaybackLeaser>) -> Self {
        self.leaser = leaser;
        self
    }

    /// Sets how far behind schedule an event may fall before it is
    /// dropped.
    pub fn with_max_lag_age(mut self, max_lag_age: Duration) -> Self {
        self.max_lag_age = max_lag_age;
        self
    }

    /// Begins playback of `reader`, stopping any current playback first.
    ///
    /// The player owns the reader until stopped.
    pub async fn play(&mut self, reader: EventStreamReader) {
        self.stop().await;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stop = DoneSignal::new();
        let finished = DoneSignal::new();

        let playback = Playback {
            reader,
            sink: self.sink.clone(),
            leaser: self.leaser.clone(),
            max_lag_age: self.max_lag_age,
            cmd_rx,
            stop: stop.clone(),
            finished: finished.clone(),
            player_start: Instant::now(),
            round_count: 0,
            start_time: Instant::now(),
            realtime_offset: Duration::ZERO,
            paused_at: None,
            no_route: HashMap::new(),
            dropped: 0,
        };
        tokio::spawn(playback.run());

        self.active = Some(ActivePlayback {
            stop,
            finished,
            cmd_tx,
        });
    }

    /// Stops playback and waits for the playback task to wind down.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.stop.mark_done();
        active.finished.wait().await;
    }

    /// Pauses playback. Does nothing when idle or already paused.
    pub fn pause(&self) {
        if let Some(active) = &self.active {
            let _ = active.cmd_tx.send(PlayerCommand::Pause);
        }
    }

    /// Resumes paused playback. Does nothing when idle or not paused.
    pub fn resume(&self) {
        if let Some(active) = &self.active {
            let _ = active.cmd_tx.send(PlayerCommand::Resume);
        }
    }

    /// The current playback status, or `None` when idle.
    pub async fn status(&self) -> Option<PlayerStatus> {
        let active = self.active.as_ref()?;
        let (tx, rx) = oneshot::channel();
        active.cmd_tx.send(PlayerCommand::Status(tx)).ok()?;
        rx.await.ok()
    }

    pub fn is_playing(&self) -> bool {
        matches!(&self.active, Some(a) if !a.finished.is_done())
    }
}

/// The playback task's state. Owned by the task; external commands come in
/// over the channel.
struct Playback {
    reader: EventStreamReader,
    sink: PacketSink,
    leaser: Arc<dyn PlaybackLeaser>,
    max_lag_age: Duration,

    cmd_rx: mpsc::UnboundedReceiver<PlayerCommand>,
    stop: DoneSignal,
    finished: DoneSignal,

    // When the player started its first round.
    player_start: Instant,
    round_count: i64,

    // Per-round schedule epoch, and the total time spent paused. An event
    // with offset `o` is due at `start_time + realtime_offset + o`.
    start_time: Instant,
    realtime_offset: Duration,
    paused_at: Option<Instant>,

    // Route failures per recorded (file-local) device index.
    no_route: HashMap<i64, i64>,
    dropped: u64,
}

enum RoundEnd {
    Cancelled,
    Failed,
}

impl Playback {
    async fn run(mut self) {
        self.leaser.acquire_playback_lease();
        self.player_start = Instant::now();

        loop {
            if self.stop.is_done() {
                break;
            }

            self.round_count += 1;
            info!(
                "starting player round #{} for {}",
                self.round_count,
                self.reader.path().display()
            );
            self.reader.reset();

            match self.play_round().await {
                Ok(events_played) => {
                    // Guard against spinning on a stream with no events.
                    if events_played == 0 {
                        tokio::select! {
                            _ = self.stop.wait() => break,
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        }
                    }
                }
                Err(RoundEnd::Cancelled) => break,
                Err(RoundEnd::Failed) => break,
            }
        }

        self.leaser.release_playback_lease();
        self.cmd_rx.close();
        self.finished.mark_done();
    }

    /// Plays the stream once through. Returns the number of events
    /// delivered or dropped.
    async fn play_round(&mut self) -> Result<u64, RoundEnd> {
        self.start_time = Instant::now();
        self.realtime_offset = Duration::ZERO;
        let mut events_played = 0u64;

        loop {
            let event = match self.reader.read_event() {
                Ok(Some(e)) => e,
                Ok(None) => {
                    debug!("hit end of stream");
                    return Ok(events_played);
                }
                Err(e) => {
                    error!("could not read next event: {}", e);
                    return Err(RoundEnd::Failed);
                }
            };

            let lateness = self.wait_for_event(self.reader.position()).await?;
            events_played += 1;

            // An event that fell too far behind schedule is dropped; the
            // stream resumes once it reaches future events.
            if lateness > self.max_lag_age {
                info!(
                    "event (offset {:?}) is {:?} behind schedule; discarding",
                    event.offset, lateness
                );
                self.dropped += 1;
                continue;
            }

            let Some(device) = self.reader.resolve_device_for_index(event.device) else {
                warn!("stream references unknown device index #{}", event.device);
                continue;
            };

            let packet = match event.decode(device) {
                Ok(p) => p,
                Err(e) => {
                    warn!("could not decode event for device {:?}: {}", device.id, e);
                    continue;
                }
            };

            let ordinal = device.device_ordinal();
            match (self.sink)(ordinal, &device.id, &packet) {
                Ok(()) => {
                    // The device is reachable again; forget its failures.
                    self.no_route.remove(&event.device);
                }
                Err(e) if e.is_no_route() => {
                    let count = self.no_route.entry(event.device).or_insert(0);
                    if *count == 0 {
                        warn!("could not route packet to device {:?} (no route)", device.id);
                    }
                    *count += 1;
                }
                Err(e) => {
                    warn!("could not send packet to device {:?}: {}", device.id, e);
                }
            }
        }
    }

    /// Blocks until the event at stream `offset` is due, processing
    /// commands while waiting. Returns how far behind schedule the event
    /// is.
    async fn wait_for_event(&mut self, offset: Duration) -> Result<Duration, RoundEnd> {
        loop {
            if self.stop.is_done() {
                return Err(RoundEnd::Cancelled);
            }

            let target = self.start_time + self.realtime_offset + offset;
            let now = Instant::now();
            if self.paused_at.is_none() && now >= target {
                return Ok(now - target);
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.process_command(cmd),
                    None => return Err(RoundEnd::Cancelled),
                },
                _ = self.stop.wait() => return Err(RoundEnd::Cancelled),
                _ = tokio::time::sleep_until(target), if self.paused_at.is_none() => {
                    // The timer expired on schedule; report zero lag to
                    // smooth over timer imperfection.
                    return Ok(Duration::ZERO);
                }
            }
        }
    }

    fn process_command(&mut self, cmd: PlayerCommand) {
        match cmd {
            PlayerCommand::Pause => {
                if self.paused_at.is_none() {
                    info!("player is paused; releasing playback lease");
                    self.paused_at = Some(Instant::now());
                    self.leaser.release_playback_lease();
                }
            }
            PlayerCommand::Resume => {
                if let Some(paused_at) = self.paused_at.take() {
                    info!("player is resuming; acquiring playback lease");
                    self.leaser.acquire_playback_lease();
                    // Shift the schedule by the time spent paused.
                    self.realtime_offset += paused_at.elapsed();
                }
            }
            PlayerCommand::Status(tx) => {
                let _ = tx.send(self.status_snapshot());
            }
        }
    }

    fn status_snapshot(&self) -> PlayerStatus {
        let mut total_playtime = self.player_start.elapsed().saturating_sub(self.realtime_offset);
        if let Some(paused_at) = self.paused_at {
            total_playtime = total_playtime.saturating_sub(paused_at.elapsed());
        }

        let mut no_route_devices = Vec::with_capacity(self.no_route.len());
        for (index, count) in &self.no_route {
            if let Some(d) = self.reader.resolve_device_for_index(*index) {
                no_route_devices.push(NoRouteEntry {
                    id: d.id.clone(),
                    ordinal: d.device_ordinal(),
                    count: *count,
                });
            }
        }

        PlayerStatus {
            path: self.reader.path().to_path_buf(),
            rounds: self.round_count,
            position: self.reader.position(),
            duration: self.reader.duration(),
            total_playtime,
            paused: self.paused_at.is_some(),
            no_route_devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::streamfile::{testutil, EventStreamReader};
    use std::sync::Mutex;

    struct SinkLog {
        fired: Mutex<Vec<(Duration, String)>>,
        start: Instant,
        result: fn() -> Result<(), DeviceError>,
    }

    fn logging_sink(result: fn() -> Result<(), DeviceError>) -> (Arc<SinkLog>, PacketSink) {
        let log = Arc::new(SinkLog {
            fired: Mutex::new(Vec::new()),
            start: Instant::now(),
            result,
        });
        let for_sink = log.clone();
        let sink: PacketSink = Arc::new(move |_ordinal, id, _packet| {
            for_sink
                .fired
                .lock()
                .unwrap()
                .push((for_sink.start.elapsed(), id.to_string()));
            (for_sink.result)()
        });
        (log, sink)
    }

    async fn wait_for_fired(log: &SinkLog, count: usize) {
        while log.fired.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff < Duration::from_millis(250),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn plays_events_with_recorded_timing() {
        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("stream");
        testutil::write_stream_with_offsets(
            &stream,
            "aa:00",
            &[
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
        );

        let (log, sink) = logging_sink(|| Ok(()));
        let mut player = Player::new(sink);
        player.play(EventStreamReader::open(&stream).unwrap()).await;

        wait_for_fired(&log, 3).await;
        player.stop().await;

        let fired = log.fired.lock().unwrap();
        assert_eq!(fired.len(), 3);
        assert!(fired.iter().all(|(_, id)| id == "aa:00"));
        assert_close(fired[0].0, Duration::ZERO);
        assert_close(fired[1].0, Duration::from_secs(1));
        assert_close(fired[2].0, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_shifts_the_schedule_by_the_paused_duration() {
        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("stream");
        testutil::write_stream_with_offsets(
            &stream,
            "aa:00",
            &[
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
        );

        let (log, sink) = logging_sink(|| Ok(()));
        let mut player = Player::new(sink);
        player.play(EventStreamReader::open(&stream).unwrap()).await;

        // Pause half a second in, resume a second later. Every remaining
        // event shifts by the paused duration.
        tokio::time::sleep(Duration::from_millis(500)).await;
        player.pause();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = player.status().await.unwrap();
        assert!(status.paused);

        player.resume();
        wait_for_fired(&log, 3).await;
        player.stop().await;

        let fired = log.fired.lock().unwrap();
        assert_close(fired[1].0, Duration::from_secs(2));
        assert_close(fired[2].0, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn loops_rounds_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("stream");
        testutil::write_stream_with_offsets(
            &stream,
            "aa:00",
            &[Duration::ZERO, Duration::from_millis(200)],
        );

        let (log, sink) = logging_sink(|| Ok(()));
        let mut player = Player::new(sink);
        player.play(EventStreamReader::open(&stream).unwrap()).await;

        // More events than one round holds means a second round started.
        wait_for_fired(&log, 3).await;
        let status = player.status().await.unwrap();
        assert!(status.rounds >= 2);

        player.stop().await;
        assert!(!player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn no_route_errors_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("stream");
        testutil::write_stream_with_offsets(
            &stream,
            "aa:00",
            &[Duration::ZERO, Duration::from_millis(100)],
        );

        let (log, sink) = logging_sink(|| Err(DeviceError::NoRoute));
        let mut player = Player::new(sink);
        player.play(EventStreamReader::open(&stream).unwrap()).await;

        wait_for_fired(&log, 2).await;
        let status = player.status().await.unwrap();
        assert_eq!(status.no_route_devices.len(), 1);
        assert_eq!(status.no_route_devices[0].id, "aa:00");
        assert!(status.no_route_devices[0].count >= 1);
        assert_eq!(status.no_route_devices[0].ordinal, Ordinal::new(1, 2));

        player.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_follows_playback_and_pauses() {
        use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

        struct CountingLeaser(AtomicI64);
        impl PlaybackLeaser for CountingLeaser {
            fn acquire_playback_lease(&self) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
            fn release_playback_lease(&self) {
                self.0.fetch_sub(1, AtomicOrdering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("stream");
        testutil::write_stream_with_offsets(
            &stream,
            "aa:00",
            &[Duration::ZERO, Duration::from_secs(10)],
        );

        let leaser = Arc::new(CountingLeaser(AtomicI64::new(0)));
        let (log, sink) = logging_sink(|| Ok(()));
        let mut player = Player::new(sink).with_leaser(leaser.clone());
        player.play(EventStreamReader::open(&stream).unwrap()).await;

        wait_for_fired(&log, 1).await;
        assert_eq!(leaser.0.load(AtomicOrdering::SeqCst), 1);

        // Pausing releases the lease; resuming re-acquires it.
        player.pause();
        while leaser.0.load(AtomicOrdering::SeqCst) != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        player.resume();
        while leaser.0.load(AtomicOrdering::SeqCst) != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        player.stop().await;
        assert_eq!(leaser.0.load(AtomicOrdering::SeqCst), 0);
    }
}
