//! Predictive worker-pool autoscaling.
//!
//! Signals (utilization, queue depth, latency) are smoothed with an
//! exponential moving average and the short-term trend is estimated by a
//! least-squares slope over a sliding window. Decisions scale the pool up
//! aggressively and down cautiously, with cooldowns to suppress
//! oscillation. Provisioning itself goes through an injected
//! [`Provisioner`]; the autoscaler knows nothing about machines.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::Result;
use tracing::{debug, info, instrument, warn};

use super::{coordinator::Coordinator, proto::WorkerId};

/// Autoscaler tuning knobs.
#[derive(Clone, Debug)]
pub struct AutoscaleConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    /// Smoothing factor for the exponential average.
    pub alpha: f64,
    /// Samples kept for trend estimation.
    pub window: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Positive trend above this forces a scale-up even below the
    /// utilization threshold.
    pub trend_up: f64,
    /// Negative trend below this permits a scale-down.
    pub trend_down: f64,
    pub scale_up_factor: f64,
    pub scale_down_factor: f64,
    pub up_cooldown: Duration,
    pub down_cooldown: Duration,
    /// How long to wait for a draining worker's queue to empty.
    pub drain_timeout: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 64,
            alpha: 0.3,
            window: 10,
            scale_up_threshold: 0.75,
            scale_down_threshold: 0.25,
            trend_up: 0.1,
            trend_down: -0.05,
            scale_up_factor: 0.5,
            scale_down_factor: 0.25,
            up_cooldown: Duration::from_secs(30),
            down_cooldown: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// Exponential smoothing over a sliding sample window.
#[derive(Clone, Debug)]
pub struct Smoother {
    alpha: f64,
    window: usize,
    samples: VecDeque<f64>,
    smoothed: Option<f64>,
}

impl Smoother {
    pub fn new(alpha: f64, window: usize) -> Self {
        Self {
            alpha,
            window,
            samples: VecDeque::new(),
            smoothed: None,
        }
    }

    /// Feed one observation: `S_t = alpha * X_t + (1 - alpha) * S_{t-1}`.
    pub fn observe(&mut self, sample: f64) {
        self.smoothed = Some(match self.smoothed {
            Some(prior) => self.alpha * sample + (1.0 - self.alpha) * prior,
            None => sample,
        });
        self.samples.push_back(sample);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    pub fn value(&self) -> f64 {
        self.smoothed.unwrap_or(0.0)
    }

    /// Least-squares slope over the window; zero until two samples exist.
    pub fn trend(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let n_f = n as f64;
        let mean_x = (n_f - 1.0) / 2.0;
        let mean_y: f64 = self.samples.iter().sum::<f64>() / n_f;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, y) in self.samples.iter().enumerate() {
            let dx = i as f64 - mean_x;
            numerator += dx * (y - mean_y);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }
}

/// One observation of cluster state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolSample {
    /// Aggregate utilization in `[0, 1]`.
    pub utilization: f64,
    pub queue_depth: u32,
    /// Mean recent action latency.
    pub latency: Duration,
}

/// What the autoscaler decided on one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(u32),
    Down(u32),
    Hold,
}

/// Brings machines up and down. Cloud specifics live behind this seam.
pub trait Provisioner: Send + Sync + 'static {
    /// Provision `count` new workers, returning their ids once registered.
    fn provision(&self, count: u32) -> impl Future<Output = Result<Vec<WorkerId>>> + Send;

    /// Tear down the given workers.
    fn deprovision(&self, workers: Vec<WorkerId>) -> impl Future<Output = Result<()>> + Send;
}

/// Predictive scaler over a [`Coordinator`]'s worker pool.
pub struct Autoscaler<P> {
    config: AutoscaleConfig,
    coordinator: Arc<Coordinator>,
    provisioner: P,
    utilization: Smoother,
    queue_depth: Smoother,
    latency: Smoother,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

impl<P: Provisioner> Autoscaler<P> {
    pub fn new(config: AutoscaleConfig, coordinator: Arc<Coordinator>, provisioner: P) -> Self {
        let utilization = Smoother::new(config.alpha, config.window);
        let queue_depth = Smoother::new(config.alpha, config.window);
        let latency = Smoother::new(config.alpha, config.window);
        Self {
            config,
            coordinator,
            provisioner,
            utilization,
            queue_depth,
            latency,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    /// Feed one cluster sample.
    pub fn observe(&mut self, sample: PoolSample) {
        self.utilization.observe(sample.utilization);
        self.queue_depth.observe(f64::from(sample.queue_depth));
        self.latency.observe(sample.latency.as_secs_f64());
    }

    /// Decide based on the smoothed signals, respecting cooldowns and the
    /// `[min_workers, max_workers]` clamp.
    #[instrument(name = "Autoscaler::decide", skip(self))]
    pub fn decide(&self, current: u32) -> ScaleDecision {
        let predicted = self.utilization.value();
        let trend = self.utilization.trend();
        let now = Instant::now();

        let up_cooling = self
            .last_scale_up
            .is_some_and(|at| now.duration_since(at) < self.config.up_cooldown);
        let down_cooling = self
            .last_scale_down
            .is_some_and(|at| now.duration_since(at) < self.config.down_cooldown);

        if (predicted > self.config.scale_up_threshold || trend > self.config.trend_up)
            && !up_cooling
        {
            // Rising trends multiply the step so a sharp ramp jumps ahead of
            // the queue instead of chasing it.
            let trend_multiplier = if trend > self.config.trend_up { 2.0 } else { 1.0 };
            let step = ((f64::from(current) * self.config.scale_up_factor * trend_multiplier)
                .floor() as u32)
                .max(1);
            let target = current.saturating_add(step).min(self.config.max_workers);
            if target > current {
                debug!(predicted, trend, current, target, "scale up");
                return ScaleDecision::Up(target - current);
            }
        }

        if predicted < self.config.scale_down_threshold
            && trend < self.config.trend_down
            && !down_cooling
        {
            let step = ((f64::from(current) * self.config.scale_down_factor * 0.5).floor()
                as u32)
                .max(1);
            let target = current.saturating_sub(step).max(self.config.min_workers);
            if target < current {
                debug!(predicted, trend, current, target, "scale down");
                return ScaleDecision::Down(current - target);
            }
        }

        ScaleDecision::Hold
    }

    /// One full tick: sample, decide, apply.
    #[instrument(name = "Autoscaler::tick", skip(self))]
    pub async fn tick(&mut self, sample: PoolSample) -> Result<ScaleDecision> {
        self.observe(sample);
        let current = self.coordinator.worker_count() as u32;
        let decision = self.decide(current);
        match decision {
            ScaleDecision::Up(count) => {
                let provisioned = self.provisioner.provision(count).await?;
                info!(requested = count, provisioned = provisioned.len(), "scaled up");
                self.last_scale_up = Some(Instant::now());
            }
            ScaleDecision::Down(count) => {
                self.drain_and_deprovision(count).await?;
                self.last_scale_down = Some(Instant::now());
            }
            ScaleDecision::Hold => {}
        }
        Ok(decision)
    }

    /// Scale-down path: mark the least-utilized workers draining, wait for
    /// their queues to empty (bounded), then deprovision and unregister.
    #[instrument(name = "Autoscaler::drain_and_deprovision", skip(self))]
    async fn drain_and_deprovision(&self, count: u32) -> Result<()> {
        let victims = self.coordinator.least_utilized(count as usize);
        for worker in &victims {
            self.coordinator.mark_draining(*worker);
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        let mut pending: Vec<WorkerId> = victims.clone();
        while !pending.is_empty() && Instant::now() < deadline {
            pending.retain(|worker| !self.coordinator.worker_idle(*worker));
            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if !pending.is_empty() {
            warn!(stragglers = pending.len(), "drain timeout, deprovisioning anyway");
        }

        self.provisioner.deprovision(victims.clone()).await?;
        for worker in victims {
            self.coordinator.unregister(worker);
        }
        info!(drained = count, "scaled down");
        Ok(())
    }
}
