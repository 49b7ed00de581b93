use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::controller::inner::ControllerInner;

impl ControllerInner {
    /// Periodic maintenance, independent of request processing. Only
    /// touches the in-memory circuit-test table; requests are never
    /// blocked on it.
    pub(crate) async fn housekeeping_runner(
        inner: Arc<ControllerInner>,
        cancellation_token: CancellationToken,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(inner.opts.housekeeping_interval));

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    inner.housekeeping();
                }
            }
        }
    }

    #[instrument(skip_all)]
    fn housekeeping(&self) {
        let before = self.circuit_tests.outstanding();
        self.circuit_tests
            .sweep(Self::clock(), self.opts.circuit_test_timeout);
        let swept = before.saturating_sub(self.circuit_tests.outstanding());
        if swept > 0 {
            trace!("Swept {swept} expired circuit test(s)");
        }
    }
}
