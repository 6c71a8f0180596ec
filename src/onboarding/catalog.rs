//! Declarative catalog of steps and onboardings, loaded from JSON.
//!
//! Applying a catalog is idempotent: steps and onboardings that already exist
//! are kept, and onboarding membership is rewritten to follow the file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, Error, OnboardingError};

use super::manager::OnboardingEngine;
use super::model::{Onboarding, Step};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub steps: Vec<StepEntry>,
    #[serde(default)]
    pub onboardings: Vec<OnboardingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub button_text: Option<String>,
    #[serde(default)]
    pub done_text: Option<String>,
    #[serde(default)]
    pub panel_step_open_action_name: String,
    #[serde(default)]
    pub is_per_company: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingEntry {
    pub route_name: String,
    pub name: String,
    #[serde(default)]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub text_completed: Option<String>,
    #[serde(default)]
    pub panel_close_action_name: Option<String>,
    /// Member step keys, in panel order.
    #[serde(default)]
    pub steps: Vec<String>,
}

/// What applying a catalog changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub steps_created: usize,
    pub onboardings_created: usize,
    pub onboardings_updated: usize,
}

impl StepEntry {
    fn to_step(&self) -> Step {
        let mut step = Step::new(&self.key, &self.title, &self.panel_step_open_action_name);
        step.description = self.description.clone();
        step.button_text = self.button_text.clone();
        step.done_text = self.done_text.clone();
        step.is_per_company = self.is_per_company;
        step
    }
}

impl OnboardingEntry {
    fn to_onboarding(&self) -> Onboarding {
        let mut onboarding = Onboarding::new(&self.name, &self.route_name);
        if let Some(sequence) = self.sequence {
            onboarding = onboarding.with_sequence(sequence);
        }
        if let Some(text) = &self.text_completed {
            onboarding = onboarding.with_text_completed(text);
        }
        if let Some(action) = &self.panel_close_action_name {
            onboarding = onboarding.with_close_action(action);
        }
        onboarding
    }
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(format!("catalog: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Create missing steps and onboardings, then sync onboarding membership.
    pub async fn apply(&self, engine: &OnboardingEngine) -> Result<ApplyReport, Error> {
        let mut report = ApplyReport::default();

        for entry in &self.steps {
            if let Some(existing) = engine.get_step_by_key(&entry.key).await? {
                if existing.is_per_company != entry.is_per_company {
                    warn!(
                        step = %entry.key,
                        "Catalog scope differs from stored step, keeping stored value"
                    );
                }
                continue;
            }
            engine.create_step(entry.to_step()).await?;
            report.steps_created += 1;
        }

        for entry in &self.onboardings {
            let mut step_ids: Vec<Uuid> = Vec::with_capacity(entry.steps.len());
            for key in &entry.steps {
                let step = engine
                    .get_step_by_key(key)
                    .await?
                    .ok_or_else(|| OnboardingError::StepNotFound(key.clone()))?;
                step_ids.push(step.id);
            }

            match engine.get_onboarding_by_route(&entry.route_name).await? {
                Some(existing) => {
                    engine.set_onboarding_steps(existing.id, &step_ids).await?;
                    report.onboardings_updated += 1;
                }
                None => {
                    engine.create_onboarding(entry.to_onboarding(), &step_ids).await?;
                    report.onboardings_created += 1;
                }
            }
        }

        info!(
            steps_created = report.steps_created,
            onboardings_created = report.onboardings_created,
            onboardings_updated = report.onboardings_updated,
            "Catalog applied"
        );
        Ok(report)
    }
}
