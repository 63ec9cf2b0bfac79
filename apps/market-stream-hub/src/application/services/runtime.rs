//! Stream Runtime
//!
//! Wires the hand-off channel, upstream bridge, polling fallback, engine and
//! guard together and owns their background tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EventSink, GuardConfig, LivenessGuard, PollingConfig, PollingFallback, run_event_pump};
use crate::application::ports::{MarketDataUpstream, MinuteBarStore, UpstreamError};
use crate::infrastructure::broadcast::FanoutEngine;
use crate::infrastructure::config::EngineSettings;
use crate::infrastructure::upstream::UpstreamBridge;

/// Running engine with its background tasks.
#[derive(Debug)]
pub struct StreamRuntime {
    engine: Arc<FanoutEngine>,
    bridge: Arc<UpstreamBridge>,
    polling: Arc<PollingFallback>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamRuntime {
    /// Build every component and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream connection cannot be started.
    pub fn start(
        settings: EngineSettings,
        upstream: Arc<dyn MarketDataUpstream>,
        store: Option<Arc<dyn MinuteBarStore>>,
    ) -> Result<Self, UpstreamError> {
        let cancel = CancellationToken::new();
        let (sink, rx) = EventSink::channel(settings.handoff_capacity);

        let bridge = Arc::new(UpstreamBridge::new(Arc::clone(&upstream)));
        bridge.bind(&sink);

        let polling = Arc::new(PollingFallback::new(
            upstream,
            sink,
            PollingConfig {
                interval: settings.kline_poll_interval,
                limit: settings.kline_poll_limit,
            },
            cancel.child_token(),
        ));

        let guard_config = GuardConfig::from(&settings);
        let engine = Arc::new(FanoutEngine::new(
            settings,
            Arc::clone(&bridge),
            Arc::clone(&polling),
            store,
        ));

        let mut tasks = vec![tokio::spawn(run_event_pump(
            rx,
            Arc::clone(&engine),
            cancel.clone(),
        ))];

        if let Err(e) = bridge.start() {
            cancel.cancel();
            return Err(e);
        }

        tasks.extend(LivenessGuard::new(Arc::clone(&engine), guard_config).spawn(&cancel));
        tracing::info!("Stream runtime started");

        Ok(Self {
            engine,
            bridge,
            polling,
            cancel,
            tasks,
        })
    }

    /// The fan-out engine.
    #[must_use]
    pub fn engine(&self) -> Arc<FanoutEngine> {
        Arc::clone(&self.engine)
    }

    /// The upstream bridge.
    #[must_use]
    pub fn bridge(&self) -> Arc<UpstreamBridge> {
        Arc::clone(&self.bridge)
    }

    /// Token cancelled by [`StreamRuntime::shutdown`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Detach every session, release upstream subscriptions and stop all tasks.
    pub async fn shutdown(self) {
        tracing::info!("Stream runtime shutting down");
        self.engine.shutdown().await;
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Runtime task ended abnormally");
            }
        }
        self.polling.stop_all().await;
        tracing::info!("Stream runtime stopped");
    }
}
