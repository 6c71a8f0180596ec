//! Onboarding records: steps, onboardings and their per-scope progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{OnboardingState, StateMap, StepState};

/// Identifier of a tenant (a company in the host environment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where progress is kept: shared by all tenants, or isolated per tenant.
///
/// Stored as a NULL `tenant_id` for `Global`. The global scope never equals
/// any concrete tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Tenant(TenantId),
}

impl Scope {
    /// Scope a record lives in for the acting tenant.
    pub fn resolve(is_per_company: bool, tenant: TenantId) -> Self {
        if is_per_company {
            Self::Tenant(tenant)
        } else {
            Self::Global
        }
    }

    pub fn tenant(&self) -> Option<TenantId> {
        match self {
            Self::Global => None,
            Self::Tenant(t) => Some(*t),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Tenant(t) => write!(f, "tenant:{t}"),
        }
    }
}

/// A single onboarding action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    /// Stable reference used by configuration and by domain code validating it.
    pub key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_text: Option<String>,
    /// Action the UI invokes to open the step. Required once attached.
    pub panel_step_open_action_name: String,
    /// Progress is tracked per tenant instead of shared.
    pub is_per_company: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        key: impl Into<String>,
        title: impl Into<String>,
        panel_step_open_action_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            title: title.into(),
            description: None,
            button_text: None,
            done_text: None,
            panel_step_open_action_name: panel_step_open_action_name.into(),
            is_per_company: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: set the button and done texts.
    pub fn with_texts(mut self, button_text: impl Into<String>, done_text: impl Into<String>) -> Self {
        self.button_text = Some(button_text.into());
        self.done_text = Some(done_text.into());
        self
    }

    /// Builder: track progress per tenant.
    pub fn per_company(mut self) -> Self {
        self.is_per_company = true;
        self
    }

    /// Whether the step may be attached to an onboarding.
    pub fn has_open_action(&self) -> bool {
        !self.panel_step_open_action_name.trim().is_empty()
    }

    pub fn scope_for(&self, tenant: TenantId) -> Scope {
        Scope::resolve(self.is_per_company, tenant)
    }
}

/// A user-facing group of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Onboarding {
    pub id: Uuid,
    pub name: String,
    /// Globally unique handle callers resolve the onboarding by.
    pub route_name: String,
    pub sequence: i64,
    pub text_completed: String,
    pub panel_close_action_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Onboarding {
    pub fn new(name: impl Into<String>, route_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            route_name: route_name.into(),
            sequence: 10,
            text_completed: "Great! You're all set.".to_string(),
            panel_close_action_name: "action_close".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set listing order.
    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Builder: set the completion text.
    pub fn with_text_completed(mut self, text: impl Into<String>) -> Self {
        self.text_completed = text.into();
        self
    }

    /// Builder: set the close action.
    pub fn with_close_action(mut self, action: impl Into<String>) -> Self {
        self.panel_close_action_name = action.into();
        self
    }
}

/// Per-(onboarding, scope) aggregate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingProgress {
    pub id: Uuid,
    pub onboarding_id: Uuid,
    pub scope: Scope,
    pub is_onboarding_closed: bool,
    /// Step progress records contributing to this aggregate.
    pub progress_step_ids: Vec<Uuid>,
    /// Derived from the contributing records at load time.
    pub onboarding_state: OnboardingState,
}

/// Per-(step, scope) completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub id: Uuid,
    pub step_id: Uuid,
    pub scope: Scope,
    pub step_state: StepState,
}

/// A step as the panel shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelStep {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_text: Option<String>,
    /// State reported by the render that produced this entry.
    pub state: StepState,
    pub action: String,
}

impl PanelStep {
    pub fn from_step(step: &Step, state: StepState) -> Self {
        Self {
            id: step.id,
            title: step.title.clone(),
            description: step.description.clone(),
            button_text: step.button_text.clone(),
            done_text: step.done_text.clone(),
            state,
            action: step.panel_step_open_action_name.clone(),
        }
    }
}

/// Everything needed to render an onboarding panel once.
#[derive(Debug, Clone, Serialize)]
pub struct RenderingValues {
    pub route_name: String,
    pub steps: Vec<PanelStep>,
    pub state: StateMap,
    pub text_completed: String,
    pub close_method: String,
    /// Aggregate after this render consolidated its steps.
    pub current_onboarding_state: OnboardingState,
}

/// One dashboard panel: a rendered progress record and who it was rendered for.
#[derive(Debug, Clone, Serialize)]
pub struct PanelData {
    pub tenant_id: TenantId,
    pub progress_id: Uuid,
    #[serde(flatten)]
    pub values: RenderingValues,
}
