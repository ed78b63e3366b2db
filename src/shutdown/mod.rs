use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            return Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once SIGINT or SIGTERM has been received. Suitable as an
    /// axum graceful-shutdown future.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let triggered = Arc::clone(&self.triggered);
        async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            while !triggered.load(Ordering::SeqCst) {
                ticker.tick().await;
            }
            tracing::info!(target: "jobgate::shutdown", "shutdown signal received");
        }
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use signal_hook::consts::signal::SIGINT;
    use signal_hook::low_level::raise;

    use super::ShutdownHooks;

    #[tokio::test]
    async fn wait_resolves_after_signal() {
        let hooks = ShutdownHooks::install().expect("signal hooks should install");
        assert!(!hooks.is_triggered());

        raise(SIGINT).expect("signal should be raised");

        tokio::time::timeout(Duration::from_secs(2), hooks.wait())
            .await
            .expect("shutdown future should resolve");
        assert!(hooks.is_triggered());
    }
}
