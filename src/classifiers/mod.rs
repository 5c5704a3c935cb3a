//! The classifier bank: per-dimension analyzers producing signal facts.
//!
//! Every dimension always gets a regex pass. When an LLM is configured and
//! the dimension's gate considers enhancement worthwhile, a short
//! completion refines the regex results; signal-by-signal the higher
//! confidence wins. LLM failure is never fatal, the regex results stand.

mod calibration;
mod claim;
mod contract;
mod intent;
mod llm_boost;
mod support;
mod temporal;

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use crate::cancel::CancelToken;
use crate::config::ClassifierConfig;
use crate::fact::{Dimension, Fact, FactData, Provenance, Signal};
use crate::llm::LlmClient;
use crate::thread::Thread;

/// A candidate signal produced by one classifier pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub signal: String,
    pub confidence: f64,
}

impl Classification {
    pub fn new(signal: impl Into<String>, confidence: f64) -> Self {
        Self {
            signal: signal.into(),
            confidence,
        }
    }
}

/// Static description of one dimension classifier.
struct DimensionSpec {
    dimension: Dimension,
    signals: &'static [&'static str],
    regex_pass: fn(&str, &[&str]) -> Vec<Classification>,
    gate: fn(&str, &[&str]) -> bool,
}

fn dimension_specs() -> [DimensionSpec; 6] {
    [
        DimensionSpec {
            dimension: Dimension::Claim,
            signals: claim::SIGNALS,
            regex_pass: claim::regex_pass,
            gate: claim::gate,
        },
        DimensionSpec {
            dimension: Dimension::Support,
            signals: support::SIGNALS,
            regex_pass: support::regex_pass,
            gate: support::gate,
        },
        DimensionSpec {
            dimension: Dimension::Calibration,
            signals: calibration::SIGNALS,
            regex_pass: calibration::regex_pass,
            gate: calibration::gate,
        },
        DimensionSpec {
            dimension: Dimension::Temporal,
            signals: temporal::SIGNALS,
            regex_pass: temporal::regex_pass,
            gate: temporal::gate,
        },
        DimensionSpec {
            dimension: Dimension::Contract,
            signals: contract::SIGNALS,
            regex_pass: contract::regex_pass,
            gate: contract::gate,
        },
        DimensionSpec {
            dimension: Dimension::Intent,
            signals: intent::SIGNALS,
            regex_pass: intent::regex_pass,
            gate: intent::gate,
        },
    ]
}

/// Merge LLM results into regex results: on a signal collision the higher
/// confidence wins, otherwise the entry is inserted.
fn merge(base: &mut Vec<Classification>, extra: Vec<Classification>) {
    for entry in extra {
        match base.iter_mut().find(|c| c.signal == entry.signal) {
            Some(existing) => {
                if entry.confidence > existing.confidence {
                    existing.confidence = entry.confidence;
                }
            }
            None => base.push(entry),
        }
    }
}

/// Runs all dimension classifiers concurrently over a thread.
pub struct ClassifierBank {
    config: ClassifierConfig,
    model: String,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ClassifierBank {
    pub fn new(config: ClassifierConfig, default_model: impl Into<String>) -> Self {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| default_model.into());
        Self {
            config,
            model,
            llm: None,
        }
    }

    /// Enable LLM enhancement behind the per-dimension gates.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Classify the thread on every dimension, returning signal facts.
    ///
    /// The bank always runs; without an LLM it is regex-only.
    pub async fn classify(
        &self,
        thread: &Thread,
        turn_index: u32,
        cancel: &CancelToken,
    ) -> Vec<Fact> {
        let last = thread
            .last_user()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let context: Vec<String> = thread
            .recent_context(self.config.context_window)
            .iter()
            .map(|m| m.content.clone())
            .collect();
        let ctx_refs: Vec<&str> = context.iter().map(|s| s.as_str()).collect();

        let specs = dimension_specs();
        let runs = specs
            .iter()
            .map(|spec| self.classify_dimension(spec, &last, &ctx_refs, turn_index, cancel));

        join_all(runs).await.into_iter().flatten().collect()
    }

    async fn classify_dimension(
        &self,
        spec: &DimensionSpec,
        last: &str,
        context: &[&str],
        turn_index: u32,
        cancel: &CancelToken,
    ) -> Vec<Fact> {
        let started = Instant::now();
        let mut results = (spec.regex_pass)(last, context);

        let use_llm = self.config.enable_llm
            && self.llm.is_some()
            && !cancel.is_cancelled()
            && (spec.gate)(last, context);

        if use_llm {
            let llm = self.llm.as_ref().expect("llm presence checked above");
            match llm_boost::enhance(
                llm.as_ref(),
                &self.model,
                spec.dimension,
                spec.signals,
                last,
                context,
                cancel,
            )
            .await
            {
                Ok(detected) => merge(&mut results, detected),
                Err(err) => {
                    tracing::debug!(
                        dimension = spec.dimension.as_str(),
                        error = %err,
                        "LLM enhancement failed, keeping regex results"
                    );
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.config.soft_budget_ms {
            tracing::warn!(
                dimension = spec.dimension.as_str(),
                elapsed_ms,
                budget_ms = self.config.soft_budget_ms,
                "classifier exceeded its soft budget"
            );
        }

        results
            .into_iter()
            .map(|c| Signal::new(spec.dimension, c.signal, c.confidence))
            .filter(Signal::in_range)
            .map(|signal| {
                Fact::new(FactData::Signal(signal)).with_provenance(
                    Provenance::classifier(spec.dimension)
                        .with_turn(turn_index)
                        .with_duration_ms(elapsed_ms),
                )
            })
            .collect()
    }
}
