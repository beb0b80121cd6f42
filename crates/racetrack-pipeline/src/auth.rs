//! Auth/permission oracle consumed by the pipeline.
//!
//! The pipeline asks yes/no questions before any mutating operation and
//! treats a denial as terminal. The real authorization engine lives
//! outside this crate; `AllowAll` serves single-tenant setups and tests.

use async_trait::async_trait;

use crate::error::PipelineResult;

/// What the caller wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    Read,
    Call,
    DeployNew,
    Redeploy,
    Delete,
}

/// What the caller wants to do it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResource<'a> {
    Global,
    Family(&'a str),
    Job(&'a str, &'a str),
}

#[async_trait]
pub trait AuthOracle: Send + Sync {
    /// Allow or deny; denial comes back as `PipelineError::Denied`.
    async fn authorize(
        &self,
        identity: &str,
        resource: AuthResource<'_>,
        scope: AuthScope,
    ) -> PipelineResult<()>;

    /// Grant the owner the default scopes (read, call, redeploy,
    /// delete) on a freshly deployed job family.
    async fn grant_default_permissions(&self, identity: &str, job_name: &str)
        -> PipelineResult<()>;
}

/// Oracle that permits everything.
pub struct AllowAll;

#[async_trait]
impl AuthOracle for AllowAll {
    async fn authorize(
        &self,
        _identity: &str,
        _resource: AuthResource<'_>,
        _scope: AuthScope,
    ) -> PipelineResult<()> {
        Ok(())
    }

    async fn grant_default_permissions(
        &self,
        _identity: &str,
        _job_name: &str,
    ) -> PipelineResult<()> {
        Ok(())
    }
}
