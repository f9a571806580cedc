//! Access Port over the agreements portal.
//!
//! The [`AgreementPort`] trait decouples the collector and the execution
//! state machine from how the portal is driven. [`api::HttpPortal`] calls the
//! portal's JSON backend; [`ui::UiPortal`] clicks through the web UI. Tests
//! use `test_support::FakePortal`.
//!
//! Bindings never retry and never verify that a mutation took effect.

pub mod api;
pub mod ui;

use std::time::Instant;

use crate::core::types::{Agreement, AgreementStatus, AgreementView, Institution};
use crate::error::PortError;

/// Remote position for one institution.
///
/// Owned by whoever opened it and passed into every port call; a new
/// institution or a failed item means a new context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub institution: Institution,
    /// Binding-specific session handle (context cookie for the API binding).
    pub session: Option<String>,
    pub opened_at: Instant,
}

impl ExecutionContext {
    pub fn new(institution: Institution, session: Option<String>) -> Self {
        Self {
            institution,
            session,
            opened_at: Instant::now(),
        }
    }
}

pub trait AgreementPort {
    /// Select `institution` on the remote side.
    fn open_context(&mut self, institution: &Institution) -> Result<ExecutionContext, PortError>;

    /// All agreements of the context's institution, tagged with its id.
    fn list_agreements(&mut self, ctx: &ExecutionContext) -> Result<AgreementView, PortError>;

    /// Ask the portal to move `agreement` to `desired` (Approved or Awaiting).
    fn request_status_change(
        &mut self,
        ctx: &ExecutionContext,
        agreement: &Agreement,
        desired: AgreementStatus,
    ) -> Result<(), PortError>;

    fn request_delete(
        &mut self,
        ctx: &ExecutionContext,
        agreement: &Agreement,
    ) -> Result<(), PortError>;
}

impl<P: AgreementPort + ?Sized> AgreementPort for Box<P> {
    fn open_context(&mut self, institution: &Institution) -> Result<ExecutionContext, PortError> {
        (**self).open_context(institution)
    }

    fn list_agreements(&mut self, ctx: &ExecutionContext) -> Result<AgreementView, PortError> {
        (**self).list_agreements(ctx)
    }

    fn request_status_change(
        &mut self,
        ctx: &ExecutionContext,
        agreement: &Agreement,
        desired: AgreementStatus,
    ) -> Result<(), PortError> {
        (**self).request_status_change(ctx, agreement, desired)
    }

    fn request_delete(
        &mut self,
        ctx: &ExecutionContext,
        agreement: &Agreement,
    ) -> Result<(), PortError> {
        (**self).request_delete(ctx, agreement)
    }
}
