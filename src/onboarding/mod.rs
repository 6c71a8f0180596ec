//! Onboarding progress engine — steps grouped into onboardings, with
//! per-scope completion tracking and a read-and-advance rendering protocol.

pub mod catalog;
pub mod manager;
pub mod model;
pub mod routes;
pub mod state;

pub use catalog::Catalog;
pub use manager::OnboardingEngine;
pub use model::{Onboarding, OnboardingProgress, PanelData, RenderingValues, Scope, Step, StepProgress, TenantId};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use state::{OnboardingState, PanelState, StateMap, StepState, StepValidation};
