//! Automatic playback resumption.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;

use pixelbridge_core::protocol::Packet;

use crate::device::{Device, DoneSignal};

use super::{Manager, ProxyListener};

/// Resumes a paused playback stream once proxy traffic goes quiet.
///
/// The listener watches packets arriving at the proxy tier. After at least
/// one packet has been seen, and no further packet arrives within the
/// configured delay, the callback fires. This re-enables playback after a
/// live source (such as a lighting console driven by hand) stops sending.
pub struct AutoResumeListener {
    manager: Manager,
    delay: Duration,

    stop: DoneSignal,
    finished: DoneSignal,
}

impl AutoResumeListener {
    /// Starts watching `manager` for traffic. `on_delay` fires once
    /// traffic has been quiet for `delay` after the first packet, after
    /// which the listener unregisters itself.
    pub fn start(
        manager: Manager,
        delay: Duration,
        on_delay: impl FnOnce() + Send + 'static,
    ) -> AutoResumeListener {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let stop = DoneSignal::new();
        let finished = DoneSignal::new();

        let listener: Arc<dyn ProxyListener> = Arc::new(PacketSignal { signal_tx });
        manager.add_listener(listener.clone());

        let this = AutoResumeListener {
            manager: manager.clone(),
            delay,
            stop: stop.clone(),
            finished: finished.clone(),
        };

        tokio::spawn(async move {
            handle_auto_resume(delay, signal_rx, stop, on_delay).await;
            manager.remove_listener(&listener);
            finished.mark_done();
        });

        this
    }

    /// Stops the listener without firing its callback.
    pub async fn stop(&self) {
        self.stop.mark_done();
        self.finished.wait().await;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }
}

struct PacketSignal {
    signal_tx: mpsc::Sender<()>,
}

impl ProxyListener for PacketSignal {
    fn receive_packet(&self, _device: &Arc<dyn Device>, _packet: &Packet<'_>, _forwarded: bool) {
        // A full channel already records a pending packet; dropping the
        // signal is fine.
        let _ = self.signal_tx.try_send(());
    }
}

async fn handle_auto_resume(
    delay: Duration,
    mut signal_rx: mpsc::Receiver<()>,
    stop: DoneSignal,
    on_delay: impl FnOnce(),
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let countdown = async {
            match deadline {
                Some(t) => tokio::time::sleep_until(t).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = stop.wait() => return,
            _ = countdown => {
                info!("auto resume hit delay ({:?}); triggering", delay);
                on_delay();
                return;
            }
            msg = signal_rx.recv() => match msg {
                Some(()) => {
                    if deadline.is_none() {
                        info!(
                            "auto resume received first packet, starting countdown ({:?})",
                            delay
                        );
                    }
                    deadline = Some(tokio::time::Instant::now() + delay);
                }
                None => return,
            }
        }
    }
}
