use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::models::Period;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

/// Periodically reassesses every registered farm over a trailing period.
pub struct Scheduler {
    engine: Arc<Engine>,
    config: SchedulerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Engine>,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.initial_delay_seconds);
        let run_interval = Duration::from_secs(self.config.interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            self.config.initial_delay_seconds, self.config.interval_minutes
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        if let Err(e) = self.run_assessment().await {
            error!("Assessment run error: {}", e);
        }

        let mut ticker = interval(run_interval);
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_assessment().await {
                        error!("Assessment run error: {}", e);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One pass over the registry. Individual farm failures are logged by the
    /// batch and never abort the run.
    pub async fn run_assessment(&self) -> Result<()> {
        info!("Starting assessment run");

        self.engine.rebuild_index().await?;
        let farm_ids = self.engine.farm_ids().await?;
        if farm_ids.is_empty() {
            warn!("No farms registered, nothing to assess");
            return Ok(());
        }

        let yesterday = (Utc::now() - ChronoDuration::days(1)).date_naive();
        let period = Period::trailing(yesterday, self.config.period_days)?;

        let report = self
            .engine
            .assess_batch(
                farm_ids,
                period,
                self.config.perils.clone(),
                self.shutdown_rx.clone(),
            )
            .await;

        info!(
            "Assessment run completed: {} assessed, {} failed, {} cancelled",
            report.succeeded, report.failed, report.cancelled
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::geometry::GeoArea;
    use crate::history::{AssessmentHistory, InMemoryHistory};
    use crate::models::{FarmRecord, Peril, SoilClass};
    use crate::sources::Dataset;

    fn farm(id: &str, x: f64) -> FarmRecord {
        FarmRecord {
            id: id.to_string(),
            name: None,
            area: GeoArea::rectangle(id, (x, 40.0), (x + 0.1, 40.1)).unwrap(),
            crop: None,
            soil_class: Some(SoilClass::Loam),
            elevation_m: Some(300.0),
            slope_percent: Some(2.0),
            yield_history: vec![],
            claim_history: vec![],
            insured_value: 50_000.0,
        }
    }

    fn scheduler(shutdown_rx: watch::Receiver<bool>) -> (Scheduler, Arc<InMemoryHistory>) {
        let config = Config::from_yaml("scheduler:\n  perils: [flood]\n").unwrap();
        let mut dataset = Dataset::new();
        dataset.add_farm(farm("f1", -100.0)).unwrap();
        dataset.add_farm(farm("f2", -99.0)).unwrap();
        let dataset = Arc::new(dataset);
        let history = Arc::new(InMemoryHistory::new());

        let engine = Engine::new(&config, dataset.clone(), dataset, history.clone()).unwrap();
        let scheduler = Scheduler::new(Arc::new(engine), config.scheduler.clone(), shutdown_rx);
        (scheduler, history)
    }

    #[tokio::test]
    async fn test_run_assessment_covers_registry() {
        let (_tx, rx) = watch::channel(false);
        let (scheduler, history) = scheduler(rx);

        scheduler.run_assessment().await.unwrap();

        for farm_id in ["f1", "f2"] {
            let latest = history.latest(farm_id).await.unwrap().unwrap();
            assert!(latest.perils.contains_key(&Peril::Flood));
            assert_eq!(latest.period.num_days(), 30);
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_initial_delay() {
        let (tx, rx) = watch::channel(false);
        let (mut scheduler, history) = scheduler(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert!(history.latest("f1").await.unwrap().is_none());
    }
}
