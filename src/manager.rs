//! Fleet reconciliation
//!
//! ## Responsibilities
//!
//! - Periodic discovery-driven diff of the live worker set
//! - Stop workers for vanished cameras, start workers for new ones
//! - Keep an explicit teardown list so a re-appearing IP is not
//!   restarted while its old worker is still releasing resources
//!
//! Cycles are strictly sequential; the worker registry is mutated only
//! from the reconciliation task.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::interval;

use crate::capture::StreamOpener;
use crate::discovery::DiscoveryProbe;
use crate::endpoint::EndpointSelector;
use crate::worker::{FrameSink, StreamWorker};

/// Discovery-driven camera fleet manager.
pub struct CameraManager {
    discovery: Arc<dyn DiscoveryProbe>,
    selector: Arc<EndpointSelector>,
    opener: Arc<dyn StreamOpener>,
    sink: Arc<dyn FrameSink>,
    workers: Arc<RwLock<HashMap<IpAddr, StreamWorker>>>,
    stopping: Arc<RwLock<Vec<StreamWorker>>>,
    running: Arc<RwLock<bool>>,
}

impl CameraManager {
    pub fn new(
        discovery: Arc<dyn DiscoveryProbe>,
        selector: Arc<EndpointSelector>,
        opener: Arc<dyn StreamOpener>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            discovery,
            selector,
            opener,
            sink,
            workers: Arc::new(RwLock::new(HashMap::new())),
            stopping: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the reconciliation loop on its own task.
    pub async fn start(&self, cycle_interval: Duration) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Camera manager already running");
                return;
            }
            *running = true;
        }

        tracing::info!(
            interval_sec = cycle_interval.as_secs(),
            "Starting camera manager"
        );

        let discovery = self.discovery.clone();
        let selector = self.selector.clone();
        let opener = self.opener.clone();
        let sink = self.sink.clone();
        let workers = self.workers.clone();
        let stopping = self.stopping.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(cycle_interval);
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                Self::sync_workers(&discovery, &selector, &opener, &sink, &workers, &stopping)
                    .await;
            }
            tracing::info!("Camera manager loop exited");
        });
    }

    /// Stop the loop and signal every worker. Teardown completes on the
    /// workers' own tasks.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        let mut workers = self.workers.write().await;
        for (ip, worker) in workers.drain() {
            tracing::info!(camera_ip = %ip, "Stopping worker");
            worker.stop();
        }
        self.stopping.write().await.clear();
        tracing::info!("Camera manager stopped");
    }

    /// IPs of cameras with a live worker.
    pub async fn live_cameras(&self) -> HashSet<IpAddr> {
        self.workers.read().await.keys().cloned().collect()
    }

    /// Run one reconciliation cycle immediately. Intended for callers
    /// that drive the cadence themselves; not for use while the
    /// periodic loop is running.
    pub async fn reconcile_once(&self) {
        Self::sync_workers(
            &self.discovery,
            &self.selector,
            &self.opener,
            &self.sink,
            &self.workers,
            &self.stopping,
        )
        .await;
    }

    /// One cycle: reap, discover, retire vanished, start new.
    async fn sync_workers(
        discovery: &Arc<dyn DiscoveryProbe>,
        selector: &Arc<EndpointSelector>,
        opener: &Arc<dyn StreamOpener>,
        sink: &Arc<dyn FrameSink>,
        workers: &Arc<RwLock<HashMap<IpAddr, StreamWorker>>>,
        stopping: &Arc<RwLock<Vec<StreamWorker>>>,
    ) {
        // Reap finished teardowns and workers that died on their own
        // (open failures), so their cameras become eligible again.
        stopping.write().await.retain(|w| !w.is_finished());
        workers.write().await.retain(|ip, worker| {
            if worker.is_finished() {
                tracing::debug!(camera_ip = %ip, "Worker exited on its own, removing");
                false
            } else {
                true
            }
        });

        let ips = discovery.discover_ips().await;

        // Retire workers whose camera vanished from this pass. Stop is
        // a signal only; the handle moves to the teardown list.
        let vanished: Vec<IpAddr> = workers
            .read()
            .await
            .keys()
            .filter(|ip| !ips.contains(*ip))
            .cloned()
            .collect();
        if !vanished.is_empty() {
            let mut workers = workers.write().await;
            let mut stopping = stopping.write().await;
            for ip in vanished {
                if let Some(worker) = workers.remove(&ip) {
                    tracing::info!(camera_ip = %ip, "Camera vanished, stopping worker");
                    worker.stop();
                    stopping.push(worker);
                }
            }
        }

        // Start workers for newly discovered cameras.
        for ip in ips {
            if workers.read().await.contains_key(&ip) {
                continue;
            }
            if stopping.read().await.iter().any(|w| w.camera_ip() == ip) {
                tracing::debug!(camera_ip = %ip, "Previous worker still tearing down, deferring");
                continue;
            }
            let Some(url) = selector.select_stream(ip).await else {
                continue;
            };
            let worker = StreamWorker::spawn(ip, url, opener.clone(), sink.clone());
            workers.write().await.insert(ip, worker);
            tracing::info!(camera_ip = %ip, "Worker started");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameStream};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Discovery fake returning a settable IP set.
    struct ScriptedProbe {
        ips: Mutex<HashSet<IpAddr>>,
    }

    impl ScriptedProbe {
        fn new(ips: &[&str]) -> Self {
            Self {
                ips: Mutex::new(ips.iter().map(|s| s.parse().unwrap()).collect()),
            }
        }

        fn set(&self, ips: &[&str]) {
            *self.ips.lock().unwrap() = ips.iter().map(|s| s.parse().unwrap()).collect();
        }
    }

    #[async_trait]
    impl DiscoveryProbe for ScriptedProbe {
        async fn discover_ips(&self) -> HashSet<IpAddr> {
            self.ips.lock().unwrap().clone()
        }
    }

    /// Stream that pends until cancelled, like a camera between frames.
    struct IdleStream;

    #[async_trait]
    impl FrameStream for IdleStream {
        async fn read_frame(&mut self) -> Result<Frame> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Opener whose probe fails for configured IPs and that counts opens.
    struct ScriptedOpener {
        unreachable_markers: Vec<String>,
        opens: AtomicUsize,
        probes: AtomicUsize,
    }

    impl ScriptedOpener {
        fn new(unreachable: &[&str]) -> Self {
            Self {
                unreachable_markers: unreachable.iter().map(|s| s.to_string()).collect(),
                opens: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamOpener for ScriptedOpener {
        async fn open(&self, _url: &str) -> Result<Box<dyn FrameStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleStream))
        }

        async fn probe(&self, url: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            !self.unreachable_markers.iter().any(|m| url.contains(m))
        }
    }

    struct NullSink;

    impl FrameSink for NullSink {
        fn on_frame(&self, _camera_ip: &str, _frame: Frame) -> Result<()> {
            Ok(())
        }
    }

    fn manager(
        probe: Arc<ScriptedProbe>,
        opener: Arc<ScriptedOpener>,
    ) -> CameraManager {
        let selector = Arc::new(EndpointSelector::new(
            vec!["rtsp://{ip}:554/stream1".to_string()],
            String::new(),
            String::new(),
            opener.clone(),
        ));
        CameraManager::new(probe, selector, opener, Arc::new(NullSink))
    }

    fn ips(list: &[&str]) -> HashSet<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_workers_match_discovered_set() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5", "10.0.0.6"]));
        let opener = Arc::new(ScriptedOpener::new(&[]));
        let mgr = manager(probe, opener);

        mgr.reconcile_once().await;

        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5", "10.0.0.6"]));
    }

    #[tokio::test]
    async fn test_probe_failures_excluded_and_retried() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5", "10.0.0.6"]));
        let opener = Arc::new(ScriptedOpener::new(&["10.0.0.6"]));
        let mgr = manager(probe, opener.clone());

        mgr.reconcile_once().await;
        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5"]));
        let probes_after_first = opener.probes.load(Ordering::SeqCst);

        // The unreachable camera is probed again on the next cycle.
        mgr.reconcile_once().await;
        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5"]));
        assert!(opener.probes.load(Ordering::SeqCst) > probes_after_first);
    }

    #[tokio::test]
    async fn test_stable_camera_keeps_its_worker() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5"]));
        let opener = Arc::new(ScriptedOpener::new(&[]));
        let mgr = manager(probe, opener.clone());

        mgr.reconcile_once().await;
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

        mgr.reconcile_once().await;
        mgr.reconcile_once().await;
        // No restart: the original worker is still serving the camera.
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5"]));
    }

    #[tokio::test]
    async fn test_new_camera_added_without_touching_existing() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5"]));
        let opener = Arc::new(ScriptedOpener::new(&[]));
        let mgr = manager(probe.clone(), opener.clone());

        mgr.reconcile_once().await;
        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5"]));

        probe.set(&["10.0.0.5", "10.0.0.6"]);
        mgr.reconcile_once().await;

        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5", "10.0.0.6"]));
        // Exactly one additional open: 10.0.0.5 was untouched.
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_vanished_camera_worker_is_stopped_and_removed() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5", "10.0.0.6"]));
        let opener = Arc::new(ScriptedOpener::new(&[]));
        let mgr = manager(probe.clone(), opener);

        mgr.reconcile_once().await;
        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.5", "10.0.0.6"]));

        probe.set(&["10.0.0.6"]);
        mgr.reconcile_once().await;

        assert_eq!(mgr.live_cameras().await, ips(&["10.0.0.6"]));
        // The cancelled worker's task finishes its teardown on its own.
        wait_for_teardown(&mgr).await;
    }

    #[tokio::test]
    async fn test_open_failure_makes_camera_eligible_next_cycle() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5"]));
        // Probe succeeds but open fails: worker task dies immediately.
        let opener = Arc::new(FlakyOpener::default());
        let selector = Arc::new(EndpointSelector::new(
            vec!["rtsp://{ip}:554/stream1".to_string()],
            String::new(),
            String::new(),
            opener.clone(),
        ));
        let mgr = CameraManager::new(probe, selector, opener.clone(), Arc::new(NullSink));

        mgr.reconcile_once().await;
        // The worker was registered, then its task exited on open failure.
        wait_for(|| opener.opens.load(Ordering::SeqCst) == 1).await;
        wait_for_dead_worker(&mgr).await;

        // Next cycle reaps the dead worker and tries again.
        mgr.reconcile_once().await;
        wait_for(|| opener.opens.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_stop_clears_the_fleet() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5", "10.0.0.6"]));
        let opener = Arc::new(ScriptedOpener::new(&[]));
        let mgr = manager(probe, opener);

        mgr.reconcile_once().await;
        assert_eq!(mgr.live_cameras().await.len(), 2);

        mgr.stop().await;
        assert!(mgr.live_cameras().await.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_loop_reconciles() {
        let probe = Arc::new(ScriptedProbe::new(&["10.0.0.5"]));
        let opener = Arc::new(ScriptedOpener::new(&[]));
        let mgr = manager(probe, opener);

        mgr.start(Duration::from_millis(50)).await;
        wait_for_live(&mgr, 1).await;

        mgr.stop().await;
        assert!(mgr.live_cameras().await.is_empty());
    }

    /// Opener that always fails open but accepts probes.
    #[derive(Default)]
    struct FlakyOpener {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl StreamOpener for FlakyOpener {
        async fn open(&self, _url: &str) -> Result<Box<dyn FrameStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(Error::Capture("open refused".to_string()))
        }

        async fn probe(&self, _url: &str) -> bool {
            true
        }
    }

    async fn wait_for_teardown(mgr: &CameraManager) {
        for _ in 0..200 {
            if mgr.stopping.read().await.iter().all(|w| w.is_finished()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("teardown did not finish in time");
    }

    async fn wait_for_dead_worker(mgr: &CameraManager) {
        for _ in 0..200 {
            let workers = mgr.workers.read().await;
            if workers.values().all(|w| w.is_finished()) {
                return;
            }
            drop(workers);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker did not die in time");
    }

    async fn wait_for_live(mgr: &CameraManager, n: usize) {
        for _ in 0..200 {
            if mgr.live_cameras().await.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fleet did not reach expected size in time");
    }
}
