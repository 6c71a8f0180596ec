//! `OnboardingStore` trait — single async interface for onboarding persistence.
//!
//! Every method is atomic: implementations run multi-row operations inside
//! one transaction, so a caller never observes a half-applied change.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::model::{Onboarding, OnboardingProgress, Scope, Step, StepProgress, TenantId};
use crate::onboarding::state::StateMap;

/// Backend-agnostic store for steps, onboardings and their progress.
#[async_trait]
pub trait OnboardingStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Steps ───────────────────────────────────────────────────────

    /// Insert a new step. A duplicate key is a `Constraint` error.
    async fn insert_step(&self, step: &Step) -> Result<(), DatabaseError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>, DatabaseError>;

    async fn get_step_by_key(&self, key: &str) -> Result<Option<Step>, DatabaseError>;

    /// Change the step's scope flag.
    ///
    /// When the value changes, all progress of the step is deleted and the
    /// enclosing onboardings have their shared progress refreshed. Returns
    /// whether anything changed.
    async fn set_step_per_company(&self, step_id: Uuid, value: bool) -> Result<bool, DatabaseError>;

    /// Delete a step together with its progress and memberships.
    async fn delete_step(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Onboardings ─────────────────────────────────────────────────

    /// Insert a new onboarding and its ordered member steps in one
    /// transaction. A duplicate route or an unknown step id is a
    /// `Constraint` error and leaves nothing behind.
    async fn insert_onboarding_with_steps(
        &self,
        onboarding: &Onboarding,
        step_ids: &[Uuid],
    ) -> Result<(), DatabaseError>;

    async fn get_onboarding(&self, id: Uuid) -> Result<Option<Onboarding>, DatabaseError>;

    async fn get_onboarding_by_route(&self, route_name: &str) -> Result<Option<Onboarding>, DatabaseError>;

    /// All onboardings ordered by sequence.
    async fn list_onboardings(&self) -> Result<Vec<Onboarding>, DatabaseError>;

    /// Member steps in panel order.
    async fn list_onboarding_steps(&self, onboarding_id: Uuid) -> Result<Vec<Step>, DatabaseError>;

    /// Replace the ordered member steps.
    ///
    /// Existing progress records get their contributing step progress
    /// recomputed, and shared progress is dropped if the onboarding became
    /// per-tenant.
    async fn set_onboarding_steps(&self, onboarding_id: Uuid, step_ids: &[Uuid]) -> Result<(), DatabaseError>;

    /// True if any member step is per-tenant or any per-tenant progress exists.
    async fn onboarding_is_per_company(&self, onboarding_id: Uuid) -> Result<bool, DatabaseError>;

    /// Delete shared progress of an onboarding that is now per-tenant.
    /// Returns the number of progress records deleted.
    async fn refresh_progress_ids(&self, onboarding_id: Uuid) -> Result<usize, DatabaseError>;

    /// Delete an onboarding and its progress. Steps are kept.
    async fn delete_onboarding(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Onboarding progress ─────────────────────────────────────────

    async fn get_progress(&self, id: Uuid) -> Result<Option<OnboardingProgress>, DatabaseError>;

    async fn find_progress(
        &self,
        onboarding_id: Uuid,
        scope: Scope,
    ) -> Result<Option<OnboardingProgress>, DatabaseError>;

    async fn list_progress(&self, onboarding_id: Uuid) -> Result<Vec<OnboardingProgress>, DatabaseError>;

    /// Create the progress record for `scope` and link the matching step
    /// progress. A second record for the same scope is a `Constraint` error.
    async fn create_progress(
        &self,
        onboarding_id: Uuid,
        scope: Scope,
    ) -> Result<OnboardingProgress, DatabaseError>;

    async fn set_progress_closed(&self, progress_id: Uuid, closed: bool) -> Result<(), DatabaseError>;

    /// Flip the closed flag and return the new value.
    async fn toggle_progress_closed(&self, progress_id: Uuid) -> Result<bool, DatabaseError>;

    /// Relink the step progress contributing to this aggregate.
    async fn recompute_progress_step_ids(&self, progress_id: Uuid) -> Result<(), DatabaseError>;

    /// Read every member step state, then consolidate JustDone to Done.
    async fn get_and_update_onboarding_state(
        &self,
        progress_id: Uuid,
        tenant: TenantId,
    ) -> Result<StateMap, DatabaseError>;

    /// Delete every progress record held for `tenant`.
    async fn purge_tenant(&self, tenant: TenantId) -> Result<usize, DatabaseError>;

    // ── Step progress ───────────────────────────────────────────────

    async fn find_step_progress(
        &self,
        step_id: Uuid,
        scope: Scope,
    ) -> Result<Option<StepProgress>, DatabaseError>;

    async fn list_step_progress(&self, step_id: Uuid) -> Result<Vec<StepProgress>, DatabaseError>;

    /// Mark the step done for the tenant's scope, creating the record if
    /// needed. Returns the records actually transitioned.
    async fn set_step_just_done(
        &self,
        step_id: Uuid,
        tenant: TenantId,
    ) -> Result<Vec<StepProgress>, DatabaseError>;

    /// NotDone → JustDone on one record; `None` when it was in another state.
    async fn step_progress_set_just_done(&self, id: Uuid) -> Result<Option<StepProgress>, DatabaseError>;

    /// JustDone → Done on one record; `None` when it was in another state.
    async fn consolidate_step_progress(&self, id: Uuid) -> Result<Option<StepProgress>, DatabaseError>;
}
