use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One rung of the model/temperature fallback ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptConfig {
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderConfig {
    pub primary_model: String,
    pub primary_temperature: f32,
    pub low_temperature: f32,
    pub secondary_model: String,
    pub secondary_temperature: f32,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            primary_model: "gpt-4.1".to_owned(),
            primary_temperature: 0.7,
            low_temperature: 0.2,
            secondary_model: "gpt-4.1-mini".to_owned(),
            secondary_temperature: 1.0,
        }
    }
}

impl LadderConfig {
    /// Rungs in order: primary at its temperature, primary cooled down (favors
    /// tool use over free generation), then the secondary model running hotter.
    pub fn next_config(&self, attempt_index: usize) -> Option<AttemptConfig> {
        match attempt_index {
            0 => Some(AttemptConfig {
                model: self.primary_model.clone(),
                temperature: self.primary_temperature,
            }),
            1 => Some(AttemptConfig {
                model: self.primary_model.clone(),
                temperature: self.low_temperature,
            }),
            2 if !self.secondary_model.trim().is_empty() => Some(AttemptConfig {
                model: self.secondary_model.clone(),
                temperature: self.secondary_temperature,
            }),
            _ => None,
        }
    }

    pub fn rungs(&self) -> Vec<AttemptConfig> {
        (0..).map_while(|idx| self.next_config(idx)).collect()
    }
}

#[derive(Debug)]
pub struct LadderOutcome<T> {
    /// First value that satisfied the predicate.
    pub accepted: Option<(AttemptConfig, T)>,
    /// Last value that was produced but rejected by the predicate.
    pub last_rejected: Option<(AttemptConfig, T)>,
    pub errors: Vec<(AttemptConfig, anyhow::Error)>,
}

impl<T> LadderOutcome<T> {
    pub fn attempts(&self) -> usize {
        self.errors.len()
            + usize::from(self.accepted.is_some())
            + usize::from(self.last_rejected.is_some())
    }
}

/// Walks the rungs strictly in sequence, waiting `backoff` before every rung
/// after the first, and stops at the first result `accept` approves.
pub async fn run_ladder<T, F, Fut, P>(
    rungs: &[AttemptConfig],
    backoff: Duration,
    mut call: F,
    accept: P,
) -> LadderOutcome<T>
where
    F: FnMut(AttemptConfig) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    P: Fn(&T) -> bool,
{
    let mut outcome = LadderOutcome {
        accepted: None,
        last_rejected: None,
        errors: Vec::new(),
    };

    for (idx, rung) in rungs.iter().enumerate() {
        if idx > 0 && !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        match call(rung.clone()).await {
            Ok(value) if accept(&value) => {
                outcome.accepted = Some((rung.clone(), value));
                return outcome;
            }
            Ok(value) => {
                tracing::warn!(
                    model = %rung.model,
                    temperature = rung.temperature,
                    rung = idx + 1,
                    "ladder rung produced no usable result"
                );
                outcome.last_rejected = Some((rung.clone(), value));
            }
            Err(err) => {
                tracing::warn!(
                    model = %rung.model,
                    temperature = rung.temperature,
                    rung = idx + 1,
                    error = %format!("{err:#}"),
                    "ladder rung failed"
                );
                outcome.errors.push((rung.clone(), err));
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn ladder_cools_primary_then_falls_back() {
        let ladder = LadderConfig::default();
        let rungs = ladder.rungs();
        assert_eq!(rungs.len(), 3);
        assert_eq!(rungs[0].model, rungs[1].model);
        assert!(rungs[1].temperature < rungs[0].temperature);
        assert_eq!(rungs[2].model, ladder.secondary_model);
        assert!(rungs[2].temperature > rungs[1].temperature);
        assert!(ladder.next_config(3).is_none());
    }

    #[test]
    fn empty_secondary_model_shortens_ladder() {
        let ladder = LadderConfig {
            secondary_model: String::new(),
            ..LadderConfig::default()
        };
        assert_eq!(ladder.rungs().len(), 2);
    }

    #[tokio::test]
    async fn stops_at_first_accepted_rung() {
        let rungs = LadderConfig::default().rungs();
        let seen = Mutex::new(Vec::new());
        let outcome = run_ladder(
            &rungs,
            Duration::ZERO,
            |rung| {
                seen.lock().unwrap().push(rung.temperature);
                let idx = seen.lock().unwrap().len();
                async move {
                    match idx {
                        1 => anyhow::bail!("rate limited"),
                        2 => Ok(Vec::<&str>::new()),
                        _ => Ok(vec!["https://example.com"]),
                    }
                }
            },
            |citations| !citations.is_empty(),
        )
        .await;

        let (rung, value) = outcome.accepted.clone().expect("third rung accepted");
        assert_eq!(rung, rungs[2]);
        assert_eq!(value, vec!["https://example.com"]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.last_rejected.is_some());
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test]
    async fn exhausted_ladder_reports_every_failure() {
        let rungs = LadderConfig::default().rungs();
        let outcome = run_ladder(
            &rungs,
            Duration::ZERO,
            |_| async { Err::<(), _>(anyhow::anyhow!("boom")) },
            |_| true,
        )
        .await;
        assert!(outcome.accepted.is_none());
        assert_eq!(outcome.errors.len(), 3);
    }
}
