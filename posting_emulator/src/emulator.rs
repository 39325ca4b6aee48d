//! The emulator loop.
//!
//! Every cycle pauses, samples one row per topic, encodes the rows for the
//! configured sink and dispatches them concurrently, waiting for all three
//! requests before the next cycle begins. Cycles never overlap.
//!
//! ## Metrics
//!
//! `cycles`: Total number of cycles started
//! `fetch_failure`: Cycles aborted because sampling failed
//! `encode_failure`: Topics skipped because their record could not be encoded
//!
//! Additional metrics are emitted by the [dispatcher](crate::dispatcher).
//!

use metrics::counter;
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, error, info, warn};

use crate::{
    config::{self, Config, Pause},
    dispatcher::{self, Dispatcher},
    encoder::Encoder,
    record::Topic,
    sampler::{self, Database, Sampler},
    sink::Registry,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Emulator`].
pub enum Error {
    /// Sampling failed and the cycle was aborted before any dispatch.
    #[error("Cycle aborted: {0}")]
    Fetch(#[from] sampler::Error),
    /// The configuration is not usable.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The dispatcher could not be built.
    #[error(transparent)]
    Dispatcher(#[from] dispatcher::Error),
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// One-based cycle number
    pub cycle: u64,
    /// Offset every row was sampled at
    pub offset: u64,
    /// Requests answered with a success status
    pub dispatched: usize,
    /// Requests that failed or were answered with another status
    pub failed: usize,
    /// Topics not dispatched because their record could not be encoded
    pub skipped: usize,
}

#[derive(Debug)]
/// The sample, encode, dispatch loop.
pub struct Emulator<D> {
    sampler: Sampler<D>,
    encoder: Encoder,
    dispatcher: Dispatcher,
    pause: Pause,
    rng: StdRng,
    cycles: u64,
    cycle_limit: Option<u64>,
    labels: Vec<(String, String)>,
    shutdown: posting_signal::Watcher,
}

impl<D> Emulator<D>
where
    D: Database,
{
    /// Create a new [`Emulator`] sending to the sink `registry` was built for.
    ///
    /// # Errors
    ///
    /// Returns an error if the pause bounds are empty or the HTTP client
    /// cannot be built.
    pub fn new(
        config: &Config,
        registry: Registry,
        database: D,
        shutdown: posting_signal::Watcher,
    ) -> Result<Self, Error> {
        config.pause.validate()?;
        let sink = registry.sink();
        let rng = config
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::from_seed);

        Ok(Self {
            sampler: Sampler::new(database, config.offset_upper_bound),
            encoder: Encoder::new(sink, config.user_id.clone()),
            dispatcher: Dispatcher::new(registry, config.request_timeout())?,
            pause: config.pause,
            rng,
            cycles: 0,
            cycle_limit: None,
            labels: vec![("sink".to_string(), sink.name().to_string())],
            shutdown,
        })
    }

    /// Stop after `limit` cycles instead of running until shutdown.
    #[must_use]
    pub fn with_cycle_limit(mut self, limit: u64) -> Self {
        self.cycle_limit = Some(limit);
        self
    }

    /// Number of cycles started so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one cycle: sample, encode and dispatch.
    ///
    /// Encoding failures skip only the affected topic and dispatch failures
    /// are reported in the returned [`CycleReport`].
    ///
    /// # Errors
    ///
    /// Returns an error if sampling failed. Nothing is dispatched in that case.
    pub async fn cycle(&mut self) -> Result<CycleReport, Error> {
        self.cycles += 1;
        let cycle = self.cycles;
        counter!("cycles", &self.labels).increment(1);

        let sample = match self.sampler.sample(&mut self.rng).await {
            Ok(sample) => sample,
            Err(err) => {
                counter!("fetch_failure", &self.labels).increment(1);
                return Err(err.into());
            }
        };
        debug!("Cycle {cycle} sampled offset {offset}", offset = sample.offset);

        let mut payloads = Vec::with_capacity(Topic::ALL.len());
        let mut skipped = 0;
        for topic in Topic::ALL {
            match self.encoder.encode(topic, sample.get(topic)) {
                Ok(payload) => payloads.push((topic, payload)),
                Err(err) => {
                    let mut labels = self.labels.clone();
                    labels.push(("topic".to_string(), topic.name().to_string()));
                    counter!("encode_failure", &labels).increment(1);
                    error!("Cycle {cycle} skipped {topic}: {err}");
                    skipped += 1;
                }
            }
        }

        let results = self.dispatcher.dispatch_all(payloads).await;
        let failed = results.iter().filter(|(_, result)| result.is_err()).count();

        Ok(CycleReport {
            cycle,
            offset: sample.offset,
            dispatched: results.len() - failed,
            failed,
            skipped,
        })
    }

    /// Run [`Emulator`] until a shutdown signal is received or the cycle limit
    /// is reached.
    ///
    /// The shutdown signal is observed during the pause between cycles. A
    /// cycle in progress always runs to completion.
    pub async fn spin(mut self) {
        info!(
            "Emulating user posts to {sink}",
            sink = self.dispatcher.sink()
        );
        loop {
            if self.cycle_limit.is_some_and(|limit| self.cycles >= limit) {
                info!("Completed {cycles} cycles", cycles = self.cycles);
                return;
            }

            let pause = self.pause.draw(&mut self.rng);
            tokio::select! {
                () = self.shutdown.recv() => {
                    info!("shutdown signal received");
                    return;
                }
                () = tokio::time::sleep(pause) => {}
            }

            match self.cycle().await {
                Ok(report) if report.failed > 0 || report.skipped > 0 => warn!(
                    "Cycle {cycle} at offset {offset}: {dispatched} sent, {failed} failed, {skipped} skipped",
                    cycle = report.cycle,
                    offset = report.offset,
                    dispatched = report.dispatched,
                    failed = report.failed,
                    skipped = report.skipped,
                ),
                Ok(report) => debug!(
                    "Cycle {cycle} at offset {offset} complete",
                    cycle = report.cycle,
                    offset = report.offset
                ),
                Err(err) => warn!("Cycle {cycles}: {err}", cycles = self.cycles),
            }
        }
    }
}
