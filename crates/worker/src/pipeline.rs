//! Analysis pipeline boundary.
//!
//! The real pipeline (scraping, market analysis, recommendations) lives
//! outside the relay. [`ScriptedPipeline`] walks through the same agent
//! stages with fixed delays so the relay can be exercised end to end.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use taskrelay_core::task::AnalysisRequest;
use tokio_util::sync::CancellationToken;

use crate::reporter::ProgressReporter;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("Analysis cancelled")]
    Cancelled,
}

/// Produces an analysis result for one request, reporting progress as it
/// goes.
#[async_trait]
pub trait AnalysisPipeline: Send + Sync {
    async fn run(
        &self,
        request: &AnalysisRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, PipelineError>;
}

/// Agent stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Supervisor,
    Collector,
    Analyzer,
    Advisor,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Supervisor,
        Stage::Collector,
        Stage::Analyzer,
        Stage::Advisor,
    ];

    pub fn agent(self) -> &'static str {
        match self {
            Stage::Supervisor => "Supervisor",
            Stage::Collector => "Collector",
            Stage::Analyzer => "Analyzer",
            Stage::Advisor => "Advisor",
        }
    }

    fn describe(self, request: &AnalysisRequest) -> String {
        match self {
            Stage::Supervisor => format!("Starting product analysis for {}", request.url),
            Stage::Collector => format!(
                "Collecting main product and up to {} related products",
                request.max_products
            ),
            Stage::Analyzer => format!(
                "Analyzing market position against {} competitors",
                request.max_competitive
            ),
            Stage::Advisor => "Drafting optimization suggestions".to_string(),
        }
    }
}

/// Deterministic stand-in pipeline.
#[derive(Debug, Clone)]
pub struct ScriptedPipeline {
    step_delay: Duration,
    fail_at: Option<Stage>,
}

impl ScriptedPipeline {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            fail_at: None,
        }
    }

    /// Make the run fail when it reaches `stage`.
    pub fn failing_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(self.step_delay) => Ok(()),
        }
    }
}

impl Default for ScriptedPipeline {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl AnalysisPipeline for ScriptedPipeline {
    async fn run(
        &self,
        request: &AnalysisRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, PipelineError> {
        for stage in Stage::ALL {
            reporter
                .progress(stage.agent(), stage.describe(request))
                .await;
            self.pause(cancel).await?;

            if self.fail_at == Some(stage) {
                return Err(PipelineError::Stage {
                    stage: stage.agent().to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
        }

        let competitors: Vec<_> = (1..=request.max_competitive)
            .map(|rank| json!({ "rank": rank }))
            .collect();

        Ok(json!({
            "report": {
                "main_product": { "url": request.url },
                "competitive_products": competitors,
                "market_analysis": {},
                "optimization_suggestions": {},
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use taskrelay_core::channels::ChannelName;
    use taskrelay_events::InMemoryBroker;

    use super::*;
    use crate::tracker::StatusTracker;

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(
            "T1",
            ChannelName::for_task("product_analysis", "T1").unwrap(),
            Arc::new(InMemoryBroker::default()),
            Arc::new(StatusTracker::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_run_produces_report() {
        let pipeline = ScriptedPipeline::new(Duration::from_secs(1));
        let mut request = AnalysisRequest::new("https://shop.example.com/item/1");
        request.max_competitive = 3;

        let result = pipeline
            .run(&request, &reporter(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result["report"]["main_product"]["url"],
            "https://shop.example.com/item/1"
        );
        assert_eq!(
            result["report"]["competitive_products"]
                .as_array()
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_failure_names_stage() {
        let pipeline = ScriptedPipeline::new(Duration::from_millis(10)).failing_at(Stage::Analyzer);
        let request = AnalysisRequest::new("https://shop.example.com/item/1");

        let err = pipeline
            .run(&request, &reporter(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, PipelineError::Stage { ref stage, .. } if stage == "Analyzer");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_run() {
        let pipeline = ScriptedPipeline::new(Duration::from_secs(60));
        let request = AnalysisRequest::new("https://shop.example.com/item/1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_matches!(
            pipeline.run(&request, &reporter(), &cancel).await,
            Err(PipelineError::Cancelled)
        );
    }
}
