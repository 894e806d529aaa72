use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::error;

use super::{ProbeResult, Prober, Scraper};
use crate::config::{Config, TargetGroup};
use crate::discovery;
use crate::errors::FleetResult;

/// Owns one scraper per configured target group.
pub struct ScraperManager {
    results: mpsc::Sender<ProbeResult>,
    scrapers: Vec<Arc<Scraper>>,
}

impl ScraperManager {
    pub fn new(results: mpsc::Sender<ProbeResult>) -> Self {
        ScraperManager {
            results,
            scrapers: Vec::new(),
        }
    }

    /// Shuts down all scrapers in parallel.
    pub async fn reset(&mut self) {
        let scrapers = std::mem::take(&mut self.scrapers);
        join_all(scrapers.iter().map(|scraper| scraper.close())).await;
    }

    /// Replaces the scraper set with one built from `config` and starts it.
    ///
    /// A group that fails to load is logged and skipped; the remaining
    /// groups still scrape.
    pub async fn update(&mut self, config: &Config) {
        self.reset().await;
        for group in &config.target_groups {
            match load_group(group) {
                Ok(scraper) => self.scrapers.push(Arc::new(scraper)),
                Err(err) => error!(group = %group.group, %err, "failed to load group"),
            }
        }
        for scraper in &self.scrapers {
            scraper.start(self.results.clone(), config.scrape_interval);
        }
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}

fn load_group(group: &TargetGroup) -> FleetResult<Scraper> {
    let discoverer = discovery::new_from_config(group)?;
    let prober = Prober::new(group)?;
    Ok(Scraper::new(prober, discoverer))
}
