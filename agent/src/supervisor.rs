//! Worker lifecycle. The supervisor owns the transport, the config cell,
//! and the two long-running workers (heartbeater, reporter). Protocol
//! events drive start/stop/reconfigure; a watchdog restarts workers that
//! go silent; cancellation fans out through child tokens.

use crate::collectors::{Collector, LogEntry};
use crate::config::Config;
use crate::protocol::{Message, ProtocolEvent, Session};
use crate::transport::WsClient;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(64);

const HEARTBEAT_CHECK_EVERY: Duration = Duration::from_secs(30);
const REPORTER_CHECK_EVERY: Duration = Duration::from_secs(60);
const HEARTBEAT_SILENCE: Duration = Duration::from_secs(60);
const REPORTER_SILENCE: Duration = Duration::from_secs(120);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHANNEL_CAPACITY: usize = 10;

/// Worker cadences in seconds, distributed over a watch channel so a
/// reload reaches running workers without restarting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub metrics: u64,
    pub detail: u64,
    pub system: u64,
    pub heartbeat: u64,
}

impl Schedule {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            metrics: cfg.metrics_interval.max(1) as u64,
            detail: cfg.detail_interval.max(1) as u64,
            system: cfg.system_interval.max(1) as u64,
            heartbeat: cfg.heartbeat_interval.max(1) as u64,
        }
    }
}

/// Exponential backoff step: doubles until saturating at [`MAX_BACKOFF`].
pub fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    cfg: Arc<RwLock<Config>>,
    client: Arc<WsClient>,
    collector: Arc<Collector>,
    cancel: CancellationToken,
    schedule_tx: watch::Sender<Schedule>,
    heartbeater: StdMutex<Option<WorkerHandle>>,
    reporter: StdMutex<Option<WorkerHandle>>,
    heartbeat_health: mpsc::Sender<bool>,
    reporter_health: mpsc::Sender<bool>,
    health_rx: StdMutex<Option<(mpsc::Receiver<bool>, mpsc::Receiver<bool>)>>,
}

impl Supervisor {
    pub fn new(
        cfg: Arc<RwLock<Config>>,
        client: Arc<WsClient>,
        collector: Arc<Collector>,
        initial: Schedule,
    ) -> Arc<Self> {
        let (schedule_tx, _) = watch::channel(initial);
        let (hb_tx, hb_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        let (rp_tx, rp_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        Arc::new(Self {
            cfg,
            client,
            collector,
            cancel: CancellationToken::new(),
            schedule_tx,
            heartbeater: StdMutex::new(None),
            reporter: StdMutex::new(None),
            heartbeat_health: hb_tx,
            reporter_health: rp_tx,
            health_rx: StdMutex::new(Some((hb_rx, rp_rx))),
        })
    }

    /// Connect, start the protocol read loop and the watchdog, then drain
    /// protocol events until shutdown. Failure to establish the very first
    /// connection is a fatal startup error.
    pub async fn run(
        self: Arc<Self>,
        session: Session,
        mut events: mpsc::Receiver<ProtocolEvent>,
        log_rx: mpsc::Receiver<LogEntry>,
    ) -> Result<()> {
        self.client
            .reconnect()
            .await
            .context("establishing initial connection")?;

        let session_task = tokio::spawn(async move { session.run().await });
        tokio::spawn(self.clone().monitor());
        tokio::spawn(
            self.collector
                .clone()
                .run_log_flusher(self.cancel.child_token(), log_rx),
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(ProtocolEvent::AuthSuccess) => {
                        info!("authenticated, starting workers");
                        self.start_heartbeater();
                        self.start_reporter();
                    }
                    Some(ProtocolEvent::Disconnected) => {
                        info!("disconnected, stopping workers");
                        self.stop_workers();
                    }
                    Some(ProtocolEvent::ReloadRequested) => {
                        self.reload_schedule().await;
                    }
                    None => break,
                },
            }
        }

        session_task.abort();
        Ok(())
    }

    /// Re-seed worker cadences from the current config without restarting
    /// anything.
    pub async fn reload_schedule(&self) {
        let schedule = Schedule::from_config(&*self.cfg.read().await);
        info!(
            metrics = schedule.metrics,
            detail = schedule.detail,
            system = schedule.system,
            heartbeat = schedule.heartbeat,
            "reloading worker schedule"
        );
        let _ = self.schedule_tx.send(schedule);
    }

    pub fn start_heartbeater(&self) {
        let mut slot = self.heartbeater.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            old.cancel.cancel();
        }
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(heartbeat_worker(
            self.client.clone(),
            self.schedule_tx.subscribe(),
            self.heartbeat_health.clone(),
            cancel.clone(),
        ));
        *slot = Some(WorkerHandle { cancel, task });
    }

    pub fn start_reporter(&self) {
        let mut slot = self.reporter.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            old.cancel.cancel();
        }
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(reporter_worker(
            self.collector.clone(),
            self.client.clone(),
            self.schedule_tx.subscribe(),
            self.reporter_health.clone(),
            cancel.clone(),
        ));
        *slot = Some(WorkerHandle { cancel, task });
    }

    fn stop_workers(&self) {
        for slot in [&self.heartbeater, &self.reporter] {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = slot.take() {
                handle.cancel.cancel();
            }
        }
    }

    fn heartbeater_running(&self) -> bool {
        self.heartbeater
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn reporter_running(&self) -> bool {
        self.reporter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Watchdog: every beat (healthy or not) proves the worker alive; a
    /// worker silent past its threshold is torn down and respawned.
    async fn monitor(self: Arc<Self>) {
        let Some((mut hb_rx, mut rp_rx)) = self
            .health_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let mut hb_check = interval(HEARTBEAT_CHECK_EVERY);
        let mut rp_check = interval(REPORTER_CHECK_EVERY);
        let mut last_heartbeat = Instant::now();
        let mut last_report = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                beat = hb_rx.recv() => {
                    let Some(healthy) = beat else { return };
                    last_heartbeat = Instant::now();
                    if !healthy {
                        warn!("heartbeater reported unhealthy");
                    }
                }
                beat = rp_rx.recv() => {
                    let Some(healthy) = beat else { return };
                    last_report = Instant::now();
                    if !healthy {
                        warn!("reporter reported unhealthy");
                    }
                }
                _ = hb_check.tick() => {
                    if self.heartbeater_running() && last_heartbeat.elapsed() > HEARTBEAT_SILENCE {
                        warn!("heartbeater silent for over {}s, restarting", HEARTBEAT_SILENCE.as_secs());
                        last_heartbeat = Instant::now();
                        self.start_heartbeater();
                    }
                }
                _ = rp_check.tick() => {
                    if self.reporter_running() && last_report.elapsed() > REPORTER_SILENCE {
                        warn!("reporter silent for over {}s, restarting", REPORTER_SILENCE.as_secs());
                        last_report = Instant::now();
                        self.start_reporter();
                    }
                }
            }
        }
    }

    /// Cancel everything, close the transport, and give workers a bounded
    /// window to observe cancellation.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        self.client.close().await;

        let mut tasks = Vec::new();
        for slot in [&self.heartbeater, &self.reporter] {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = slot.take() {
                tasks.push(handle.task);
            }
        }
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!(
                "workers did not exit within {}s, forcing shutdown",
                SHUTDOWN_TIMEOUT.as_secs()
            );
        } else {
            info!("all workers exited cleanly");
        }
    }
}

/// Outer worker loop shared by both workers: pause with exponential
/// backoff while disconnected, reset to 1 s once connected, rerun the body
/// when it returns, exit only on cancellation.
async fn heartbeat_worker(
    client: Arc<WsClient>,
    schedule_rx: watch::Receiver<Schedule>,
    health: mpsc::Sender<bool>,
    cancel: CancellationToken,
) {
    info!("heartbeater started");
    let mut delay = INITIAL_BACKOFF;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if !client.is_connected() {
            let _ = health.try_send(false);
            if !pause(&cancel, delay).await {
                break;
            }
            delay = next_backoff(delay);
            continue;
        }
        delay = INITIAL_BACKOFF;
        heartbeat_body(&client, schedule_rx.clone(), &health, &cancel).await;
        if cancel.is_cancelled() {
            break;
        }
        warn!(delay_secs = delay.as_secs(), "heartbeat loop exited, restarting");
        if !pause(&cancel, delay).await {
            break;
        }
        delay = next_backoff(delay);
    }
    info!("heartbeater stopped");
}

async fn heartbeat_body(
    client: &WsClient,
    mut schedule_rx: watch::Receiver<Schedule>,
    health: &mpsc::Sender<bool>,
    cancel: &CancellationToken,
) {
    let mut period = Duration::from_secs(schedule_rx.borrow().heartbeat.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = schedule_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                period = Duration::from_secs(schedule_rx.borrow().heartbeat.max(1));
                ticker = interval_at(Instant::now() + period, period);
                info!(secs = period.as_secs(), "heartbeat interval reloaded");
            }
            _ = ticker.tick() => {
                if !client.is_connected() {
                    let _ = health.try_send(false);
                    return;
                }
                match client.send(&Message::hello()).await {
                    Ok(()) => {
                        let _ = health.try_send(true);
                    }
                    Err(e) => {
                        // Keep ticking; the reconnect path repairs the link.
                        warn!(error = ?e, "heartbeat send failed");
                        let _ = health.try_send(false);
                    }
                }
            }
        }
    }
}

async fn reporter_worker(
    collector: Arc<Collector>,
    client: Arc<WsClient>,
    schedule_rx: watch::Receiver<Schedule>,
    health: mpsc::Sender<bool>,
    cancel: CancellationToken,
) {
    info!("reporter started");
    let mut delay = INITIAL_BACKOFF;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if !client.is_connected() {
            let _ = health.try_send(false);
            if !pause(&cancel, delay).await {
                break;
            }
            delay = next_backoff(delay);
            continue;
        }
        delay = INITIAL_BACKOFF;
        collector
            .clone()
            .run_reporting(cancel.clone(), schedule_rx.clone(), health.clone())
            .await;
        if cancel.is_cancelled() {
            break;
        }
        warn!(delay_secs = delay.as_secs(), "reporting loop exited, restarting");
        if !pause(&cancel, delay).await {
            break;
        }
        delay = next_backoff(delay);
    }
    info!("reporter stopped");
}

/// Cancellable sleep; false means cancellation fired.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..8 {
            delay = next_backoff(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 64, 64, 64]);
    }

    #[test]
    fn schedule_from_config_clamps_to_one_second() {
        let mut cfg = Config::default();
        cfg.metrics_interval = 2;
        // Bypassing set_value validation on purpose: a hand-edited file
        // may carry junk and the schedule must still be usable.
        cfg.detail_interval = 0;
        cfg.system_interval = -4;
        cfg.heartbeat_interval = 10;
        let sched = Schedule::from_config(&cfg);
        assert_eq!(sched.metrics, 2);
        assert_eq!(sched.detail, 1);
        assert_eq!(sched.system, 1);
        assert_eq!(sched.heartbeat, 10);
    }

    #[tokio::test]
    async fn pause_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(&cancel, Duration::from_secs(30)).await);
        let cancel = CancellationToken::new();
        assert!(pause(&cancel, Duration::from_millis(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_worker_backs_off_and_stays_quiet() {
        let client = Arc::new(WsClient::new("ws://127.0.0.1:1/ws".into()));
        let (schedule_tx, _) = watch::channel(Schedule {
            metrics: 5,
            detail: 15,
            system: 15,
            heartbeat: 1,
        });
        let (health_tx, mut health_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(heartbeat_worker(
            client,
            schedule_tx.subscribe(),
            health_tx,
            cancel.clone(),
        ));

        // Disconnected the whole time: only unhealthy beats arrive.
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        worker.await.unwrap();

        let mut beats = 0;
        while let Ok(healthy) = health_rx.try_recv() {
            assert!(!healthy);
            beats += 1;
        }
        // 1+2+4+8s of backoff within 10s: a handful of beats, not dozens.
        assert!((2..=6).contains(&beats), "got {beats} beats");
    }
}
