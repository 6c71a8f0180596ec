//! OnboardingEngine — the programmatic surface over steps, onboardings and
//! their progress.
//!
//! Callers act as a tenant: every operation that reads or advances progress
//! takes the acting `TenantId`, and the engine resolves whether the record
//! lives in the shared scope or in that tenant's scope.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DatabaseError, OnboardingError};
use crate::store::OnboardingStore;

use super::model::{
    Onboarding, OnboardingProgress, PanelData, PanelStep, RenderingValues, Scope, Step,
    StepProgress, TenantId,
};
use super::state::{OnboardingState, StateMap, StepState, StepValidation};

type Result<T> = std::result::Result<T, OnboardingError>;

/// Coordinates onboarding configuration, progress tracking and rendering.
pub struct OnboardingEngine {
    store: Arc<dyn OnboardingStore>,
    progress_create_retries: u32,
}

impl OnboardingEngine {
    pub fn new(store: Arc<dyn OnboardingStore>) -> Self {
        Self::with_config(store, &EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn OnboardingStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            progress_create_retries: config.progress_create_retries,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn OnboardingStore> {
        &self.store
    }

    // ── Configuration ───────────────────────────────────────────────

    /// Register a step. Keys are unique.
    pub async fn create_step(&self, step: Step) -> Result<Step> {
        match self.store.insert_step(&step).await {
            Ok(()) => {
                debug!(step = %step.key, per_company = step.is_per_company, "Step created");
                Ok(step)
            }
            Err(e) if e.is_constraint() => Err(OnboardingError::DuplicateStepKey { key: step.key }),
            Err(e) => Err(e.into()),
        }
    }

    /// Register an onboarding with its ordered member steps.
    ///
    /// Every step must exist and carry a panel action; nothing is written
    /// otherwise.
    pub async fn create_onboarding(&self, onboarding: Onboarding, step_ids: &[Uuid]) -> Result<Onboarding> {
        let step_ids = self.validate_members(step_ids).await?;

        match self.store.insert_onboarding_with_steps(&onboarding, &step_ids).await {
            Ok(()) => {}
            Err(e) if e.is_constraint() => {
                // A step deleted since validation also fails the insert.
                if self.store.get_onboarding_by_route(&onboarding.route_name).await?.is_some() {
                    return Err(OnboardingError::DuplicateRoute {
                        route: onboarding.route_name,
                    });
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        info!(route = %onboarding.route_name, steps = step_ids.len(), "Onboarding created");
        Ok(onboarding)
    }

    /// Replace the member steps of an onboarding.
    ///
    /// Existing progress records are relinked to the new membership, so a
    /// completed onboarding that gains a step reports `not_done` again.
    pub async fn set_onboarding_steps(&self, onboarding_id: Uuid, step_ids: &[Uuid]) -> Result<()> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        let step_ids = self.validate_members(step_ids).await?;
        self.store.set_onboarding_steps(onboarding.id, &step_ids).await?;
        info!(route = %onboarding.route_name, steps = step_ids.len(), "Onboarding steps changed");
        Ok(())
    }

    /// Append a step to an onboarding. Attaching twice is a no-op.
    pub async fn attach_step(&self, onboarding_id: Uuid, step_id: Uuid) -> Result<()> {
        let mut ids = self.member_ids(onboarding_id).await?;
        if ids.contains(&step_id) {
            return Ok(());
        }
        ids.push(step_id);
        self.set_onboarding_steps(onboarding_id, &ids).await
    }

    /// Remove a step from an onboarding. The step and its progress are kept.
    pub async fn detach_step(&self, onboarding_id: Uuid, step_id: Uuid) -> Result<()> {
        let mut ids = self.member_ids(onboarding_id).await?;
        let before = ids.len();
        ids.retain(|id| *id != step_id);
        if ids.len() == before {
            return Ok(());
        }
        self.set_onboarding_steps(onboarding_id, &ids).await
    }

    async fn member_ids(&self, onboarding_id: Uuid) -> Result<Vec<Uuid>> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        Ok(self
            .store
            .list_onboarding_steps(onboarding.id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    /// Resolve member ids, dropping duplicates and rejecting steps without
    /// an open action.
    async fn validate_members(&self, step_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(step_ids.len());
        for id in step_ids {
            if !seen.insert(*id) {
                continue;
            }
            let step = self.require_step(*id).await?;
            if !step.has_open_action() {
                return Err(OnboardingError::MissingAction { key: step.key });
            }
            out.push(step.id);
        }
        Ok(out)
    }

    // ── Steps ───────────────────────────────────────────────────────

    /// Mark a step done for the acting tenant.
    ///
    /// Returns the records that actually transitioned; an empty result means
    /// the step was already completed in that scope.
    pub async fn action_set_just_done(&self, step_id: Uuid, tenant: TenantId) -> Result<Vec<StepProgress>> {
        let transitioned = self
            .store
            .set_step_just_done(step_id, tenant)
            .await
            .map_err(|e| not_found_as(e, || OnboardingError::StepNotFound(step_id.to_string())))?;
        debug!(step_id = %step_id, tenant = %tenant, transitioned = transitioned.len(), "Step set just done");
        Ok(transitioned)
    }

    /// Mark a step done by key, reporting what happened instead of failing
    /// on unknown keys.
    pub async fn action_validate_step(&self, key: &str, tenant: TenantId) -> Result<StepValidation> {
        let Some(step) = self.store.get_step_by_key(key).await? else {
            debug!(key, "Validated unknown step");
            return Ok(StepValidation::NotFound);
        };

        let transitioned = self.action_set_just_done(step.id, tenant).await?;
        Ok(if transitioned.is_empty() {
            StepValidation::WasDone
        } else {
            StepValidation::JustDone
        })
    }

    /// NotDone → JustDone on a single progress record.
    pub async fn step_progress_set_just_done(&self, progress_step_id: Uuid) -> Result<Option<StepProgress>> {
        Ok(self.store.step_progress_set_just_done(progress_step_id).await?)
    }

    /// JustDone → Done on a single progress record.
    pub async fn action_consolidate_just_done(&self, progress_step_id: Uuid) -> Result<Option<StepProgress>> {
        Ok(self.store.consolidate_step_progress(progress_step_id).await?)
    }

    /// Switch a step between shared and per-tenant progress.
    ///
    /// A change wipes the step's progress and drops the shared progress of
    /// enclosing onboardings that became per-tenant. Returns whether the flag
    /// changed.
    pub async fn set_is_per_company(&self, step_id: Uuid, value: bool) -> Result<bool> {
        let changed = self
            .store
            .set_step_per_company(step_id, value)
            .await
            .map_err(|e| not_found_as(e, || OnboardingError::StepNotFound(step_id.to_string())))?;
        if changed {
            info!(step_id = %step_id, is_per_company = value, "Step scope switched");
        }
        Ok(changed)
    }

    /// Progress state of a step for the acting tenant, `not_done` when no
    /// record exists yet.
    pub async fn current_step_state(&self, step_id: Uuid, tenant: TenantId) -> Result<StepState> {
        let step = self.require_step(step_id).await?;
        Ok(self
            .store
            .find_step_progress(step.id, step.scope_for(tenant))
            .await?
            .map(|p| p.step_state)
            .unwrap_or_default())
    }

    // ── Onboarding progress ─────────────────────────────────────────

    /// Return the progress record for the acting tenant, creating it on first
    /// access.
    ///
    /// A concurrent creator for the same scope surfaces as a constraint
    /// violation; the engine then reads the winner's row instead.
    pub async fn search_or_create_progress(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<OnboardingProgress> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        let scope = self.progress_scope(onboarding.id, tenant).await?;

        if let Some(progress) = self.store.find_progress(onboarding.id, scope).await? {
            return Ok(progress);
        }

        let mut retries = 0;
        loop {
            match self.store.create_progress(onboarding.id, scope).await {
                Ok(progress) => {
                    info!(route = %onboarding.route_name, %scope, "Onboarding progress created");
                    return Ok(progress);
                }
                Err(e) if e.is_constraint() && retries < self.progress_create_retries => {
                    retries += 1;
                    warn!(route = %onboarding.route_name, %scope, retries, "Progress created concurrently, reading it back");
                    if let Some(progress) = self.store.find_progress(onboarding.id, scope).await? {
                        return Ok(progress);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the member step states and consolidate just-done steps.
    pub async fn get_and_update_onboarding_state(&self, progress_id: Uuid, tenant: TenantId) -> Result<StateMap> {
        self.store
            .get_and_update_onboarding_state(progress_id, tenant)
            .await
            .map_err(|e| not_found_as(e, || OnboardingError::ProgressNotFound { id: progress_id }))
    }

    /// Relink the step progress contributing to a progress record.
    pub async fn recompute_progress_step_ids(&self, progress_id: Uuid) -> Result<()> {
        self.store
            .recompute_progress_step_ids(progress_id)
            .await
            .map_err(|e| not_found_as(e, || OnboardingError::ProgressNotFound { id: progress_id }))
    }

    /// Hide the panel for the acting tenant.
    pub async fn action_close(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<()> {
        let progress = self.search_or_create_progress(onboarding_id, tenant).await?;
        self.store.set_progress_closed(progress.id, true).await?;
        debug!(progress_id = %progress.id, "Onboarding panel closed");
        Ok(())
    }

    /// Flip panel visibility for the acting tenant. Returns the new closed flag.
    pub async fn action_toggle_visibility(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<bool> {
        let progress = self.search_or_create_progress(onboarding_id, tenant).await?;
        let closed = self.store.toggle_progress_closed(progress.id).await?;
        debug!(progress_id = %progress.id, closed, "Onboarding panel toggled");
        Ok(closed)
    }

    /// Close the panel of the onboarding behind `route_name`. Unknown routes
    /// are ignored.
    pub async fn action_close_panel(&self, route_name: &str, tenant: TenantId) -> Result<()> {
        match self.store.get_onboarding_by_route(route_name).await? {
            Some(onboarding) => self.action_close(onboarding.id, tenant).await,
            None => {
                debug!(route = route_name, "Close requested for unknown onboarding route");
                Ok(())
            }
        }
    }

    /// Drop shared progress of an onboarding that became per-tenant.
    pub async fn action_refresh_progress_ids(&self, onboarding_id: Uuid) -> Result<usize> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        let deleted = self.store.refresh_progress_ids(onboarding.id).await?;
        if deleted > 0 {
            info!(route = %onboarding.route_name, deleted, "Shared onboarding progress dropped");
        }
        Ok(deleted)
    }

    /// Aggregate state for the acting tenant without advancing anything.
    pub async fn current_onboarding_state(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<OnboardingState> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        let scope = self.progress_scope(onboarding.id, tenant).await?;
        if let Some(progress) = self.store.find_progress(onboarding.id, scope).await? {
            return Ok(progress.onboarding_state);
        }

        let steps = self.store.list_onboarding_steps(onboarding.id).await?;
        let mut completed = 0;
        for step in &steps {
            if self.current_step_state(step.id, tenant).await?.is_completed() {
                completed += 1;
            }
        }
        Ok(OnboardingState::from_counts(completed, steps.len()))
    }

    pub async fn is_onboarding_closed(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<bool> {
        let scope = self.progress_scope(onboarding_id, tenant).await?;
        Ok(self
            .store
            .find_progress(onboarding_id, scope)
            .await?
            .is_some_and(|p| p.is_onboarding_closed))
    }

    /// Whether the onboarding tracks progress per tenant. Sticky once any
    /// per-tenant progress exists.
    pub async fn is_per_company(&self, onboarding_id: Uuid) -> Result<bool> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        Ok(self.store.onboarding_is_per_company(onboarding.id).await?)
    }

    async fn progress_scope(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<Scope> {
        let per_company = self.store.onboarding_is_per_company(onboarding_id).await?;
        Ok(Scope::resolve(per_company, tenant))
    }

    // ── Rendering ───────────────────────────────────────────────────

    /// Everything a panel needs for one render. Advances just-done steps, so
    /// each completion is reported exactly once.
    pub async fn prepare_rendering_values(&self, onboarding_id: Uuid, tenant: TenantId) -> Result<RenderingValues> {
        let onboarding = self.require_onboarding(onboarding_id).await?;
        let progress = self.search_or_create_progress(onboarding.id, tenant).await?;
        self.render(&onboarding, progress.id, tenant).await
    }

    /// `prepare_rendering_values` for the onboarding behind `route_name`.
    pub async fn prepare_rendering_values_by_route(&self, route_name: &str, tenant: TenantId) -> Result<RenderingValues> {
        let onboarding = self.require_route(route_name).await?;
        self.prepare_rendering_values(onboarding.id, tenant).await
    }

    async fn render(&self, onboarding: &Onboarding, progress_id: Uuid, tenant: TenantId) -> Result<RenderingValues> {
        let state = self.get_and_update_onboarding_state(progress_id, tenant).await?;
        let steps = self.store.list_onboarding_steps(onboarding.id).await?;

        let panel_steps: Vec<PanelStep> = steps
            .iter()
            .map(|step| PanelStep::from_step(step, state.step(step.id)))
            .collect();
        let completed = panel_steps.iter().filter(|s| s.state.is_completed()).count();

        Ok(RenderingValues {
            route_name: onboarding.route_name.clone(),
            current_onboarding_state: OnboardingState::from_counts(completed, panel_steps.len()),
            steps: panel_steps,
            state,
            text_completed: onboarding.text_completed.clone(),
            close_method: onboarding.panel_close_action_name.clone(),
        })
    }

    /// Ensure progress exists for every known route and tenant, and return
    /// each record once whether it was found or created. Unknown routes are
    /// skipped.
    pub async fn initiate_onboardings(&self, route_names: &[&str], tenants: &[TenantId]) -> Result<Vec<OnboardingProgress>> {
        let mut progress = Vec::new();
        let mut seen = HashSet::new();
        for route in route_names {
            let Some(onboarding) = self.store.get_onboarding_by_route(route).await? else {
                debug!(route, "Skipping unknown onboarding route");
                continue;
            };
            for tenant in tenants {
                let record = self.search_or_create_progress(onboarding.id, *tenant).await?;
                if seen.insert(record.id) {
                    progress.push(record);
                }
            }
        }
        Ok(progress)
    }

    /// Render every existing progress of the given routes for the given
    /// tenants. Shared progress is rendered once.
    pub async fn panel_data(&self, route_names: &[&str], tenants: &[TenantId]) -> Result<Vec<PanelData>> {
        let mut panels = Vec::new();
        let mut seen = HashSet::new();
        for route in route_names {
            let Some(onboarding) = self.store.get_onboarding_by_route(route).await? else {
                continue;
            };
            for tenant in tenants {
                let scope = self.progress_scope(onboarding.id, *tenant).await?;
                let Some(progress) = self.store.find_progress(onboarding.id, scope).await? else {
                    continue;
                };
                if !seen.insert(progress.id) {
                    continue;
                }
                let values = self.render(&onboarding, progress.id, *tenant).await?;
                panels.push(PanelData {
                    tenant_id: *tenant,
                    progress_id: progress.id,
                    values,
                });
            }
        }
        Ok(panels)
    }

    // ── Housekeeping ────────────────────────────────────────────────

    /// Forget every progress record of a tenant.
    pub async fn purge_tenant(&self, tenant: TenantId) -> Result<usize> {
        let deleted = self.store.purge_tenant(tenant).await?;
        info!(tenant = %tenant, deleted, "Tenant progress purged");
        Ok(deleted)
    }

    pub async fn delete_step(&self, step_id: Uuid) -> Result<bool> {
        Ok(self.store.delete_step(step_id).await?)
    }

    pub async fn delete_onboarding(&self, onboarding_id: Uuid) -> Result<bool> {
        Ok(self.store.delete_onboarding(onboarding_id).await?)
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub async fn get_step(&self, step_id: Uuid) -> Result<Option<Step>> {
        Ok(self.store.get_step(step_id).await?)
    }

    pub async fn get_step_by_key(&self, key: &str) -> Result<Option<Step>> {
        Ok(self.store.get_step_by_key(key).await?)
    }

    pub async fn get_onboarding(&self, onboarding_id: Uuid) -> Result<Option<Onboarding>> {
        Ok(self.store.get_onboarding(onboarding_id).await?)
    }

    pub async fn get_onboarding_by_route(&self, route_name: &str) -> Result<Option<Onboarding>> {
        Ok(self.store.get_onboarding_by_route(route_name).await?)
    }

    pub async fn list_onboardings(&self) -> Result<Vec<Onboarding>> {
        Ok(self.store.list_onboardings().await?)
    }

    pub async fn list_onboarding_steps(&self, onboarding_id: Uuid) -> Result<Vec<Step>> {
        Ok(self.store.list_onboarding_steps(onboarding_id).await?)
    }

    async fn require_step(&self, step_id: Uuid) -> Result<Step> {
        self.store
            .get_step(step_id)
            .await?
            .ok_or_else(|| OnboardingError::StepNotFound(step_id.to_string()))
    }

    async fn require_onboarding(&self, onboarding_id: Uuid) -> Result<Onboarding> {
        self.store
            .get_onboarding(onboarding_id)
            .await?
            .ok_or_else(|| OnboardingError::OnboardingNotFound(onboarding_id.to_string()))
    }

    async fn require_route(&self, route_name: &str) -> Result<Onboarding> {
        self.store
            .get_onboarding_by_route(route_name)
            .await?
            .ok_or_else(|| OnboardingError::OnboardingNotFound(route_name.to_string()))
    }
}

fn not_found_as(err: DatabaseError, not_found: impl FnOnce() -> OnboardingError) -> OnboardingError {
    match err {
        DatabaseError::NotFound { .. } => not_found(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::onboarding::state::PanelState;
    use crate::store::LibSqlBackend;

    async fn test_engine() -> OnboardingEngine {
        let store = LibSqlBackend::new_memory().await.unwrap();
        OnboardingEngine::new(Arc::new(store))
    }

    async fn onboarding_with(engine: &OnboardingEngine, steps: Vec<Step>) -> (Onboarding, Vec<Step>) {
        let mut created = Vec::new();
        for step in steps {
            created.push(engine.create_step(step).await.unwrap());
        }
        let ids: Vec<Uuid> = created.iter().map(|s| s.id).collect();
        let onboarding = engine
            .create_onboarding(Onboarding::new("Invoicing", "account_invoice"), &ids)
            .await
            .unwrap();
        (onboarding, created)
    }

    #[tokio::test]
    async fn duplicate_step_key_is_rejected() {
        let engine = test_engine().await;
        engine.create_step(Step::new("taxes", "Taxes", "open")).await.unwrap();
        let err = engine
            .create_step(Step::new("taxes", "Taxes", "open"))
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::DuplicateStepKey { key } if key == "taxes"));
    }

    #[tokio::test]
    async fn duplicate_route_is_rejected() {
        let engine = test_engine().await;
        engine
            .create_onboarding(Onboarding::new("One", "dup"), &[])
            .await
            .unwrap();
        let err = engine
            .create_onboarding(Onboarding::new("Two", "dup"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::DuplicateRoute { route } if route == "dup"));
    }

    #[tokio::test]
    async fn step_without_action_cannot_be_attached() {
        let engine = test_engine().await;
        let bare = engine.create_step(Step::new("bare", "Bare", "")).await.unwrap();

        let err = engine
            .create_onboarding(Onboarding::new("O", "o"), &[bare.id])
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::MissingAction { key } if key == "bare"));
        // Validation happens before anything is written
        assert!(engine.get_onboarding_by_route("o").await.unwrap().is_none());

        let (onboarding, _) = onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let err = engine.attach_step(onboarding.id, bare.id).await.unwrap_err();
        assert!(matches!(err, OnboardingError::MissingAction { .. }));
        assert_eq!(engine.list_onboarding_steps(onboarding.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attach_and_detach() {
        let engine = test_engine().await;
        let (onboarding, _) = onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let extra = engine.create_step(Step::new("b", "B", "open")).await.unwrap();

        engine.attach_step(onboarding.id, extra.id).await.unwrap();
        engine.attach_step(onboarding.id, extra.id).await.unwrap();
        assert_eq!(engine.list_onboarding_steps(onboarding.id).await.unwrap().len(), 2);

        engine.detach_step(onboarding.id, extra.id).await.unwrap();
        let keys: Vec<String> = engine
            .list_onboarding_steps(onboarding.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[tokio::test]
    async fn unknown_step_is_reported() {
        let engine = test_engine().await;
        let missing = Uuid::new_v4();
        let err = engine
            .action_set_just_done(missing, TenantId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::StepNotFound(_)));

        let err = engine.set_is_per_company(missing, true).await.unwrap_err();
        assert!(matches!(err, OnboardingError::StepNotFound(_)));
    }

    #[tokio::test]
    async fn validate_step_outcomes() {
        let engine = test_engine().await;
        engine.create_step(Step::new("bank", "Bank", "open")).await.unwrap();
        let tenant = TenantId::new();

        assert_eq!(
            engine.action_validate_step("bank", tenant).await.unwrap(),
            StepValidation::JustDone
        );
        assert_eq!(
            engine.action_validate_step("bank", tenant).await.unwrap(),
            StepValidation::WasDone
        );
        assert_eq!(
            engine.action_validate_step("nope", tenant).await.unwrap(),
            StepValidation::NotFound
        );
    }

    #[tokio::test]
    async fn search_or_create_is_idempotent() {
        let engine = test_engine().await;
        let (onboarding, _) = onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let tenant = TenantId::new();

        let first = engine.search_or_create_progress(onboarding.id, tenant).await.unwrap();
        let second = engine.search_or_create_progress(onboarding.id, tenant).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.scope, Scope::Global);
    }

    #[tokio::test]
    async fn per_company_onboarding_gets_tenant_progress() {
        let engine = test_engine().await;
        let (onboarding, _) =
            onboarding_with(&engine, vec![Step::new("a", "A", "open").per_company()]).await;
        let tenant = TenantId::new();

        let progress = engine.search_or_create_progress(onboarding.id, tenant).await.unwrap();
        assert_eq!(progress.scope, Scope::Tenant(tenant));
        assert!(engine.is_per_company(onboarding.id).await.unwrap());
    }

    #[tokio::test]
    async fn rendering_reports_just_done_once() {
        let engine = test_engine().await;
        let (onboarding, steps) = onboarding_with(&engine, vec![Step::new("a", "A", "open_a")]).await;
        let tenant = TenantId::new();

        let values = engine.prepare_rendering_values(onboarding.id, tenant).await.unwrap();
        assert_eq!(values.steps[0].state, StepState::NotDone);
        assert_eq!(values.state.onboarding_state, None);
        assert_eq!(values.close_method, "action_close");
        assert_eq!(values.current_onboarding_state, OnboardingState::NotDone);

        engine.action_set_just_done(steps[0].id, tenant).await.unwrap();
        let values = engine
            .prepare_rendering_values_by_route("account_invoice", tenant)
            .await
            .unwrap();
        assert_eq!(values.steps[0].state, StepState::JustDone);
        assert_eq!(values.state.onboarding_state, Some(PanelState::JustDone));
        assert_eq!(values.current_onboarding_state, OnboardingState::Done);

        let values = engine.prepare_rendering_values(onboarding.id, tenant).await.unwrap();
        assert_eq!(values.steps[0].state, StepState::Done);
        assert_eq!(values.state.onboarding_state, Some(PanelState::Done));
    }

    #[tokio::test]
    async fn unknown_route_render_is_not_found() {
        let engine = test_engine().await;
        let err = engine
            .prepare_rendering_values_by_route("missing", TenantId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::OnboardingNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_progress_is_not_found() {
        let engine = test_engine().await;
        let id = Uuid::new_v4();
        let err = engine
            .get_and_update_onboarding_state(id, TenantId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::ProgressNotFound { id: got } if got == id));
    }

    #[tokio::test]
    async fn close_and_toggle() {
        let engine = test_engine().await;
        let (onboarding, _) = onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let tenant = TenantId::new();

        assert!(!engine.is_onboarding_closed(onboarding.id, tenant).await.unwrap());
        engine.action_close_panel("account_invoice", tenant).await.unwrap();
        assert!(engine.is_onboarding_closed(onboarding.id, tenant).await.unwrap());

        let values = engine.prepare_rendering_values(onboarding.id, tenant).await.unwrap();
        assert_eq!(values.state.onboarding_state, Some(PanelState::Closed));

        assert!(!engine.action_toggle_visibility(onboarding.id, tenant).await.unwrap());
        assert!(engine.action_toggle_visibility(onboarding.id, tenant).await.unwrap());
    }

    #[tokio::test]
    async fn current_states_without_progress() {
        let engine = test_engine().await;
        let (onboarding, steps) = onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let tenant = TenantId::new();

        assert_eq!(engine.current_step_state(steps[0].id, tenant).await.unwrap(), StepState::NotDone);
        engine.action_set_just_done(steps[0].id, tenant).await.unwrap();
        assert_eq!(engine.current_step_state(steps[0].id, tenant).await.unwrap(), StepState::JustDone);
        assert_eq!(
            engine.current_onboarding_state(onboarding.id, tenant).await.unwrap(),
            OnboardingState::Done
        );
        // Reading the aggregate does not create progress
        assert!(engine.store().list_progress(onboarding.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn initiate_and_panel_data() {
        let engine = test_engine().await;
        let (onboarding, _) =
            onboarding_with(&engine, vec![Step::new("a", "A", "open").per_company()]).await;
        let t1 = TenantId::new();
        let t2 = TenantId::new();

        let progress = engine
            .initiate_onboardings(&["account_invoice", "unknown"], &[t1, t2])
            .await
            .unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(engine.store().list_progress(onboarding.id).await.unwrap().len(), 2);

        // Existing records are returned again, nothing new is created
        let again = engine
            .initiate_onboardings(&["account_invoice"], &[t1, t2])
            .await
            .unwrap();
        let mut ids: Vec<Uuid> = progress.iter().map(|p| p.id).collect();
        let mut again_ids: Vec<Uuid> = again.iter().map(|p| p.id).collect();
        ids.sort();
        again_ids.sort();
        assert_eq!(ids, again_ids);
        assert_eq!(engine.store().list_progress(onboarding.id).await.unwrap().len(), 2);

        let panels = engine.panel_data(&["account_invoice"], &[t1]).await.unwrap();
        assert_eq!(panels.len(), 1);
        assert_eq!(panels[0].tenant_id, t1);
        assert_eq!(panels[0].values.route_name, "account_invoice");
    }

    #[tokio::test]
    async fn shared_progress_is_rendered_once_in_panel_data() {
        let engine = test_engine().await;
        onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let tenants = [TenantId::new(), TenantId::new()];

        engine
            .initiate_onboardings(&["account_invoice"], &tenants)
            .await
            .unwrap();
        let panels = engine.panel_data(&["account_invoice"], &tenants).await.unwrap();
        assert_eq!(panels.len(), 1);
    }

    #[tokio::test]
    async fn refresh_drops_shared_progress_of_per_company_onboarding() {
        let engine = test_engine().await;
        let (onboarding, steps) = onboarding_with(&engine, vec![Step::new("a", "A", "open")]).await;
        let tenant = TenantId::new();
        engine.search_or_create_progress(onboarding.id, tenant).await.unwrap();

        // Nothing to do while the onboarding is shared
        assert_eq!(engine.action_refresh_progress_ids(onboarding.id).await.unwrap(), 0);

        assert!(engine.set_is_per_company(steps[0].id, true).await.unwrap());
        assert!(engine.store().list_progress(onboarding.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_tenant_and_delete() {
        let engine = test_engine().await;
        let (onboarding, steps) =
            onboarding_with(&engine, vec![Step::new("a", "A", "open").per_company()]).await;
        let tenant = TenantId::new();
        engine.search_or_create_progress(onboarding.id, tenant).await.unwrap();
        engine.action_set_just_done(steps[0].id, tenant).await.unwrap();

        assert_eq!(engine.purge_tenant(tenant).await.unwrap(), 2);
        assert_eq!(engine.current_step_state(steps[0].id, tenant).await.unwrap(), StepState::NotDone);

        assert!(engine.delete_step(steps[0].id).await.unwrap());
        assert!(engine.get_step(steps[0].id).await.unwrap().is_none());
        assert!(engine.delete_onboarding(onboarding.id).await.unwrap());
        assert!(engine.list_onboardings().await.unwrap().is_empty());
    }

    // ── Racing writers ──────────────────────────────────────────────

    /// In-memory backend that plays a concurrent writer: every
    /// `create_progress` loses to a row someone else inserted, and the first
    /// `hidden_finds` lookups do not see that row yet.
    struct RacingStore {
        inner: LibSqlBackend,
        hidden_finds: usize,
        /// Deleted right before an onboarding insert, as if by another request.
        delete_before_insert: Option<Uuid>,
        finds: AtomicUsize,
        creates: AtomicUsize,
    }

    impl RacingStore {
        async fn new(hidden_finds: usize) -> Self {
            Self {
                inner: LibSqlBackend::new_memory().await.unwrap(),
                hidden_finds,
                delete_before_insert: None,
                finds: AtomicUsize::new(0),
                creates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OnboardingStore for RacingStore {
        async fn init_schema(&self) -> std::result::Result<(), DatabaseError> {
            self.inner.init_schema().await
        }

        async fn insert_step(&self, step: &Step) -> std::result::Result<(), DatabaseError> {
            self.inner.insert_step(step).await
        }

        async fn get_step(&self, id: Uuid) -> std::result::Result<Option<Step>, DatabaseError> {
            self.inner.get_step(id).await
        }

        async fn get_step_by_key(&self, key: &str) -> std::result::Result<Option<Step>, DatabaseError> {
            self.inner.get_step_by_key(key).await
        }

        async fn set_step_per_company(&self, step_id: Uuid, value: bool) -> std::result::Result<bool, DatabaseError> {
            self.inner.set_step_per_company(step_id, value).await
        }

        async fn delete_step(&self, id: Uuid) -> std::result::Result<bool, DatabaseError> {
            self.inner.delete_step(id).await
        }

        async fn insert_onboarding_with_steps(
            &self,
            onboarding: &Onboarding,
            step_ids: &[Uuid],
        ) -> std::result::Result<(), DatabaseError> {
            if let Some(step_id) = self.delete_before_insert {
                self.inner.delete_step(step_id).await?;
            }
            self.inner.insert_onboarding_with_steps(onboarding, step_ids).await
        }

        async fn get_onboarding(&self, id: Uuid) -> std::result::Result<Option<Onboarding>, DatabaseError> {
            self.inner.get_onboarding(id).await
        }

        async fn get_onboarding_by_route(&self, route_name: &str) -> std::result::Result<Option<Onboarding>, DatabaseError> {
            self.inner.get_onboarding_by_route(route_name).await
        }

        async fn list_onboardings(&self) -> std::result::Result<Vec<Onboarding>, DatabaseError> {
            self.inner.list_onboardings().await
        }

        async fn list_onboarding_steps(&self, onboarding_id: Uuid) -> std::result::Result<Vec<Step>, DatabaseError> {
            self.inner.list_onboarding_steps(onboarding_id).await
        }

        async fn set_onboarding_steps(&self, onboarding_id: Uuid, step_ids: &[Uuid]) -> std::result::Result<(), DatabaseError> {
            self.inner.set_onboarding_steps(onboarding_id, step_ids).await
        }

        async fn onboarding_is_per_company(&self, onboarding_id: Uuid) -> std::result::Result<bool, DatabaseError> {
            self.inner.onboarding_is_per_company(onboarding_id).await
        }

        async fn refresh_progress_ids(&self, onboarding_id: Uuid) -> std::result::Result<usize, DatabaseError> {
            self.inner.refresh_progress_ids(onboarding_id).await
        }

        async fn delete_onboarding(&self, id: Uuid) -> std::result::Result<bool, DatabaseError> {
            self.inner.delete_onboarding(id).await
        }

        async fn get_progress(&self, id: Uuid) -> std::result::Result<Option<OnboardingProgress>, DatabaseError> {
            self.inner.get_progress(id).await
        }

        async fn find_progress(
            &self,
            onboarding_id: Uuid,
            scope: Scope,
        ) -> std::result::Result<Option<OnboardingProgress>, DatabaseError> {
            if self.finds.fetch_add(1, Ordering::SeqCst) < self.hidden_finds {
                return Ok(None);
            }
            self.inner.find_progress(onboarding_id, scope).await
        }

        async fn list_progress(&self, onboarding_id: Uuid) -> std::result::Result<Vec<OnboardingProgress>, DatabaseError> {
            self.inner.list_progress(onboarding_id).await
        }

        async fn create_progress(
            &self,
            _onboarding_id: Uuid,
            _scope: Scope,
        ) -> std::result::Result<OnboardingProgress, DatabaseError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Err(DatabaseError::Constraint(
                "create_progress: UNIQUE constraint failed: onboarding_progress.onboarding_id".into(),
            ))
        }

        async fn set_progress_closed(&self, progress_id: Uuid, closed: bool) -> std::result::Result<(), DatabaseError> {
            self.inner.set_progress_closed(progress_id, closed).await
        }

        async fn toggle_progress_closed(&self, progress_id: Uuid) -> std::result::Result<bool, DatabaseError> {
            self.inner.toggle_progress_closed(progress_id).await
        }

        async fn recompute_progress_step_ids(&self, progress_id: Uuid) -> std::result::Result<(), DatabaseError> {
            self.inner.recompute_progress_step_ids(progress_id).await
        }

        async fn get_and_update_onboarding_state(
            &self,
            progress_id: Uuid,
            tenant: TenantId,
        ) -> std::result::Result<StateMap, DatabaseError> {
            self.inner.get_and_update_onboarding_state(progress_id, tenant).await
        }

        async fn purge_tenant(&self, tenant: TenantId) -> std::result::Result<usize, DatabaseError> {
            self.inner.purge_tenant(tenant).await
        }

        async fn find_step_progress(
            &self,
            step_id: Uuid,
            scope: Scope,
        ) -> std::result::Result<Option<StepProgress>, DatabaseError> {
            self.inner.find_step_progress(step_id, scope).await
        }

        async fn list_step_progress(&self, step_id: Uuid) -> std::result::Result<Vec<StepProgress>, DatabaseError> {
            self.inner.list_step_progress(step_id).await
        }

        async fn set_step_just_done(
            &self,
            step_id: Uuid,
            tenant: TenantId,
        ) -> std::result::Result<Vec<StepProgress>, DatabaseError> {
            self.inner.set_step_just_done(step_id, tenant).await
        }

        async fn step_progress_set_just_done(&self, id: Uuid) -> std::result::Result<Option<StepProgress>, DatabaseError> {
            self.inner.step_progress_set_just_done(id).await
        }

        async fn consolidate_step_progress(&self, id: Uuid) -> std::result::Result<Option<StepProgress>, DatabaseError> {
            self.inner.consolidate_step_progress(id).await
        }
    }

    /// A shared onboarding stored directly in the racing store's backend.
    async fn racing_onboarding(store: &RacingStore) -> Onboarding {
        let step = Step::new("a", "A", "open");
        store.inner.insert_step(&step).await.unwrap();
        let onboarding = Onboarding::new("Invoicing", "account_invoice");
        store
            .inner
            .insert_onboarding_with_steps(&onboarding, &[step.id])
            .await
            .unwrap();
        onboarding
    }

    #[tokio::test]
    async fn lost_progress_race_reads_back_winner() {
        let store = Arc::new(RacingStore::new(1).await);
        let onboarding = racing_onboarding(&store).await;
        let winner = store.inner.create_progress(onboarding.id, Scope::Global).await.unwrap();

        let engine = OnboardingEngine::new(store.clone());
        let progress = engine
            .search_or_create_progress(onboarding.id, TenantId::new())
            .await
            .unwrap();

        assert_eq!(progress.id, winner.id);
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.finds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lost_progress_race_surfaces_after_one_retry() {
        let store = Arc::new(RacingStore::new(usize::MAX).await);
        let onboarding = racing_onboarding(&store).await;

        let engine = OnboardingEngine::new(store.clone());
        let err = engine
            .search_or_create_progress(onboarding.id, TenantId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OnboardingError::Database(DatabaseError::Constraint(_))));
        assert_eq!(store.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lost_progress_race_without_retries_surfaces() {
        let store = Arc::new(RacingStore::new(1).await);
        let onboarding = racing_onboarding(&store).await;
        store.inner.create_progress(onboarding.id, Scope::Global).await.unwrap();

        let config = EngineConfig {
            progress_create_retries: 0,
            ..EngineConfig::default()
        };
        let engine = OnboardingEngine::with_config(store.clone(), &config);
        let err = engine
            .search_or_create_progress(onboarding.id, TenantId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OnboardingError::Database(DatabaseError::Constraint(_))));
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.finds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_deleted_during_create_leaves_no_onboarding() {
        let mut store = RacingStore::new(0).await;
        let step = Step::new("a", "A", "open");
        store.delete_before_insert = Some(step.id);
        let store = Arc::new(store);

        let engine = OnboardingEngine::new(store.clone());
        engine.create_step(step.clone()).await.unwrap();
        let err = engine
            .create_onboarding(Onboarding::new("Invoicing", "account_invoice"), &[step.id])
            .await
            .unwrap_err();

        assert!(matches!(err, OnboardingError::Database(DatabaseError::Constraint(_))));
        assert!(engine.get_onboarding_by_route("account_invoice").await.unwrap().is_none());
    }
}
