//! System prompt priming
//!
//! Before live audio flows, the engine is fed the personality's voice prompt
//! and system prompt one step at a time. Priming can take seconds, so the
//! client's connection is probed between steps and priming stops as soon as
//! the client is gone.

use crate::runtime::EngineLease;
use crate::PipelineError;
use async_trait::async_trait;
use std::time::Instant;
use voice_gateway_core::PrimingStep;

/// Checks whether the client is still connected
#[async_trait]
pub trait LivenessProbe: Send {
    async fn is_alive(&mut self) -> bool;
}

/// Ordered priming steps for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimingPlan {
    steps: Vec<PrimingStep>,
}

impl PrimingPlan {
    /// Voice prompt frames, silence, one step per text token, silence.
    ///
    /// Without text tokens only the voice prompt and one silence block remain.
    pub fn build(voice_frames: usize, silence_frames: usize, text_tokens: &[u32]) -> Self {
        let mut steps = Vec::with_capacity(voice_frames + silence_frames * 2 + text_tokens.len());
        steps.extend((0..voice_frames).map(PrimingStep::VoicePrompt));
        steps.extend(std::iter::repeat(PrimingStep::Silence).take(silence_frames));
        if !text_tokens.is_empty() {
            steps.extend(text_tokens.iter().copied().map(PrimingStep::Text));
            steps.extend(std::iter::repeat(PrimingStep::Silence).take(silence_frames));
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[PrimingStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// How a priming run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimingOutcome {
    Completed { steps: usize },
    /// The client disconnected; the engine has been reset
    Aborted { completed_steps: usize },
}

/// Execute `plan`, probing liveness before every step.
///
/// On abort or error the engine is reset before the lease leaves this
/// function. On success priming-only encoder state is cleared and the primed
/// context is kept.
pub async fn run_priming<P>(
    lease: EngineLease,
    plan: &PrimingPlan,
    probe: &mut P,
) -> Result<(EngineLease, PrimingOutcome), PipelineError>
where
    P: LivenessProbe + ?Sized,
{
    let started = Instant::now();
    let mut lease = lease;

    for (index, step) in plan.steps().iter().copied().enumerate() {
        if !probe.is_alive().await {
            let (lease, ()) = lease.run_blocking(|runtime| runtime.engine.reset()).await?;
            metrics::counter!("gateway_priming_aborted_total").increment(1);
            tracing::info!(
                holder = %lease.holder_id(),
                completed_steps = index,
                total_steps = plan.len(),
                "Client disconnected during priming"
            );
            return Ok((lease, PrimingOutcome::Aborted { completed_steps: index }));
        }

        let (next, result) = lease
            .run_blocking(move |runtime| {
                let result = runtime.engine.prime_step(step);
                if result.is_err() {
                    runtime.engine.reset();
                }
                result
            })
            .await?;
        lease = next;
        result?;
    }

    let (lease, ()) = lease
        .run_blocking(|runtime| runtime.engine.finish_priming())
        .await?;

    metrics::histogram!("gateway_priming_duration_seconds").record(started.elapsed().as_secs_f64());
    tracing::debug!(
        holder = %lease.holder_id(),
        steps = plan.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Priming complete"
    );
    Ok((lease, PrimingOutcome::Completed { steps: plan.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{LoopbackConfig, LoopbackEngine};
    use crate::runtime::{EngineRuntime, EngineSlot};
    use std::sync::Arc;
    use voice_gateway_core::{Result as CoreResult, TextTokenizer};

    struct NullTokenizer;

    impl TextTokenizer for NullTokenizer {
        fn encode(&self, _text: &str) -> CoreResult<Vec<u32>> {
            Ok(vec![])
        }

        fn id_to_piece(&self, _id: u32) -> Option<String> {
            None
        }
    }

    /// Reports alive for the first `alive_for` probes
    struct CountdownProbe {
        alive_for: usize,
        probes: usize,
    }

    #[async_trait]
    impl LivenessProbe for CountdownProbe {
        async fn is_alive(&mut self) -> bool {
            self.probes += 1;
            self.probes <= self.alive_for
        }
    }

    fn slot() -> EngineSlot {
        EngineSlot::new(EngineRuntime::new(
            Box::new(LoopbackEngine::new(LoopbackConfig::default())),
            Arc::new(NullTokenizer),
        ))
    }

    #[test]
    fn test_plan_order() {
        let plan = PrimingPlan::build(2, 1, &[7, 8]);
        assert_eq!(
            plan.steps(),
            &[
                PrimingStep::VoicePrompt(0),
                PrimingStep::VoicePrompt(1),
                PrimingStep::Silence,
                PrimingStep::Text(7),
                PrimingStep::Text(8),
                PrimingStep::Silence,
            ]
        );
    }

    #[test]
    fn test_plan_without_text() {
        let plan = PrimingPlan::build(0, 3, &[]);
        assert_eq!(plan.len(), 3);
        assert!(PrimingPlan::build(0, 0, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_completes_when_client_stays() {
        let slot = slot();
        let lease = slot.acquire("s1").await;
        let plan = PrimingPlan::build(0, 2, &[5, 6, 7]);
        let mut probe = CountdownProbe {
            alive_for: usize::MAX,
            probes: 0,
        };

        let (_lease, outcome) = run_priming(lease, &plan, &mut probe).await.unwrap();
        assert_eq!(outcome, PrimingOutcome::Completed { steps: 7 });
        assert_eq!(probe.probes, 7);
    }

    #[tokio::test]
    async fn test_aborts_on_disconnect_and_allows_next_session() {
        let slot = slot();
        let lease = slot.acquire("s1").await;
        let plan = PrimingPlan::build(0, 5, &[1, 2, 3]);
        let mut probe = CountdownProbe {
            alive_for: 4,
            probes: 0,
        };

        let (lease, outcome) = run_priming(lease, &plan, &mut probe).await.unwrap();
        assert_eq!(outcome, PrimingOutcome::Aborted { completed_steps: 4 });
        // The probe is never consulted again after reporting the client gone
        assert_eq!(probe.probes, 5);

        drop(lease);
        assert!(slot.try_acquire("s2").is_some());
    }

    #[tokio::test]
    async fn test_step_error_releases_lease() {
        let slot = slot();
        let lease = slot.acquire("s1").await;
        // No voice embedding is resident, so the first voice step fails
        let plan = PrimingPlan::build(1, 0, &[]);
        let mut probe = CountdownProbe {
            alive_for: usize::MAX,
            probes: 0,
        };

        let result = run_priming(lease, &plan, &mut probe).await;
        assert!(matches!(result, Err(PipelineError::Engine(_))));
        assert!(slot.try_acquire("s2").is_some());
    }
}
