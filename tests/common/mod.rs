#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use openworkers_context_group::engine::headless::{HeadlessEngine, InstanceMonitor};
use openworkers_context_group::platform::HeadlessPlatform;
use openworkers_context_group::{
    ContextGroup, ContextGroupHandle, EnginePlatform, GroupConfig, PlatformConfig, TokioEventLoop,
};
use tokio::sync::mpsc as tokio_mpsc;

type Command = Box<dyn FnOnce(&mut ContextGroup) + Send>;

/// A thread owning one context group and driving its event loop.
///
/// The loop does not start until [`OwnerThread::start`] is called, so a test
/// can queue work from other threads first.
pub struct OwnerThread {
    pub handle: ContextGroupHandle,
    pub monitor: InstanceMonitor,
    pub platform: Arc<EnginePlatform>,
    start: Option<mpsc::Sender<()>>,
    commands: Option<tokio_mpsc::UnboundedSender<Command>>,
    join: Option<JoinHandle<()>>,
}

impl OwnerThread {
    pub fn spawn() -> Self {
        Self::spawn_with(headless_platform(), GroupConfig::default().with_strict_reference_checks(false))
    }

    pub fn spawn_with(platform: Arc<EnginePlatform>, config: GroupConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (start_tx, start_rx) = mpsc::channel::<()>();
        let (cmd_tx, mut cmd_rx) = tokio_mpsc::unbounded_channel::<Command>();
        let owner_platform = Arc::clone(&platform);

        let join = thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let engine = HeadlessEngine::new();
            let event_loop = TokioEventLoop::new(rt.handle().clone()).unwrap();

            let mut group =
                ContextGroup::owned(&engine, owner_platform, Some(event_loop), None, config).unwrap();
            ready_tx
                .send((group.handle(), engine.last_monitor().unwrap()))
                .unwrap();

            // Dropped sender also starts the loop
            let _ = start_rx.recv();

            rt.block_on(async {
                while let Some(command) = cmd_rx.recv().await {
                    command(&mut group);
                }
            });

            group.dispose();
        });

        let (handle, monitor) = ready_rx.recv().unwrap();

        Self {
            handle,
            monitor,
            platform,
            start: Some(start_tx),
            commands: Some(cmd_tx),
            join: Some(join),
        }
    }

    /// Spawn and start driving right away.
    pub fn spawn_started() -> Self {
        let mut owner = Self::spawn();
        owner.start();
        owner
    }

    pub fn start(&mut self) {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
    }

    /// Run `f` against the group on the owning thread and wait for its result.
    pub fn with_group<R, F>(&mut self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut ContextGroup) -> R + Send + 'static,
    {
        self.start();

        let (tx, rx) = mpsc::channel();
        self.commands
            .as_ref()
            .expect("owner thread stopped")
            .send(Box::new(move |group| {
                let _ = tx.send(f(group));
            }))
            .unwrap();

        rx.recv().unwrap()
    }

    /// Stop the loop, dispose the group and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.start();
        self.commands.take();

        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}

impl Drop for OwnerThread {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.stop();
        }
    }
}

pub fn headless_platform() -> Arc<EnginePlatform> {
    EnginePlatform::new(HeadlessPlatform::new(), PlatformConfig::default())
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }

    cond()
}

pub const TIMEOUT: Duration = Duration::from_secs(5);
