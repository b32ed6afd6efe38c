//! Server-side acceptance of one queued mutation.
//!
//! Order of checks: authenticate the caller, resolve which baby the mutation
//! applies to, short-circuit replays of already-applied mutation ids, consume
//! one call from the (caller, baby) fixed-window limit, then validate and commit.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::{ApplyOutcome, Database};
use crate::models::{Caller, CaregiverRole, MutationResponse, QueuedMutation, RateLimitStatus, RejectReason};
use crate::rate_limit::{self, RateLimitConfig};

/// The caller and baby a request was resolved to.
#[derive(Debug, Clone)]
pub struct Scope {
    pub caller: Caller,
    pub baby_id: String,
    pub role: CaregiverRole,
}

impl Scope {
    #[must_use]
    pub fn rate_limit_key(&self) -> String {
        format!("{}:{}", self.caller.id, self.baby_id)
    }
}

pub struct MutationEndpoint<'a> {
    db: &'a Database,
    config: RateLimitConfig,
}

impl<'a> MutationEndpoint<'a> {
    #[must_use]
    pub fn new(db: &'a Database, config: RateLimitConfig) -> Self {
        Self { db, config }
    }

    /// Look up the caller behind a bearer token.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Result<Caller, MutationResponse>> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(Err(MutationResponse::rejected(
                RejectReason::Unauthenticated,
                "Missing bearer token",
            )));
        };
        Ok(self.db.find_caller_by_token(token)?.ok_or_else(|| {
            MutationResponse::rejected(RejectReason::Unauthenticated, "Invalid token")
        }))
    }

    /// Pick the baby a caller is acting on: the requested one, else their active
    /// baby, else their only linked baby.
    pub fn resolve_scope(
        &self,
        caller: Caller,
        requested: Option<&str>,
    ) -> Result<Result<Scope, MutationResponse>> {
        let deny = |message: String| -> Result<Result<Scope, MutationResponse>> {
            Ok(Err(MutationResponse::rejected(RejectReason::Scope, message)))
        };

        let baby_id = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => match &caller.active_baby_id {
                Some(id) => id.clone(),
                None => {
                    let linked = self.db.linked_babies(&caller.id)?;
                    match linked.as_slice() {
                        [(baby, _)] => baby.id.clone(),
                        [] => return deny("No baby is shared with this caller".to_string()),
                        _ => {
                            return deny(
                                "Several babies are shared with this caller; choose one with X-Baby-Id"
                                    .to_string(),
                            );
                        }
                    }
                }
            },
        };

        let Some(role) = self.db.caregiver_role(&caller.id, &baby_id)? else {
            return deny(format!("No access to baby {baby_id}"));
        };
        Ok(Ok(Scope {
            caller,
            baby_id,
            role,
        }))
    }

    /// Accept or reject one mutation. `Err` is reserved for internal failures.
    pub fn submit(
        &self,
        token: Option<&str>,
        requested_scope: Option<&str>,
        mutation: &QueuedMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationResponse> {
        match self.authenticate(token)? {
            Ok(caller) => self.submit_as(caller, requested_scope, mutation, now),
            Err(rejection) => Ok(rejection),
        }
    }

    /// [`Self::submit`] for a caller that has already been authenticated.
    pub fn submit_as(
        &self,
        caller: Caller,
        requested_scope: Option<&str>,
        mutation: &QueuedMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationResponse> {
        let scope = match self.resolve_scope(caller, requested_scope)? {
            Ok(scope) => scope,
            Err(rejection) => return Ok(rejection),
        };

        if !scope.role.can_write() {
            return Ok(MutationResponse::rejected(
                RejectReason::Scope,
                "Viewers cannot log entries",
            ));
        }

        let key = scope.rate_limit_key();

        if let Some(applied) = self.db.get_applied_mutation(&mutation.id)? {
            if applied.caller_id != scope.caller.id {
                return Ok(MutationResponse::rejected(
                    RejectReason::Validation,
                    "Mutation id already used",
                ));
            }
            tracing::debug!(mutation_id = %mutation.id, "replayed mutation acknowledged");
            let status = rate_limit::peek(self.db, &key, self.config, now)?;
            return Ok(MutationResponse::Accepted {
                entity_id: applied.entity_id,
                duplicate: true,
                rate_limit: Some(status),
            });
        }

        let status = rate_limit::check_and_consume(self.db, &key, self.config, now)?;
        if !status.allowed {
            return Ok(rate_limited(status));
        }

        match self.db.apply_mutation(&scope.caller.id, &scope.baby_id, mutation, now)? {
            ApplyOutcome::Applied { entity_id } => {
                tracing::debug!(
                    mutation_id = %mutation.id,
                    %entity_id,
                    entity = %mutation.payload.entity,
                    op = %mutation.payload.op,
                    "mutation committed"
                );
                Ok(MutationResponse::Accepted {
                    entity_id,
                    duplicate: false,
                    rate_limit: Some(status),
                })
            }
            ApplyOutcome::Invalid(message) => Ok(MutationResponse::Rejected {
                reason: RejectReason::Validation,
                message,
                rate_limit: Some(status),
            }),
            ApplyOutcome::Forbidden(message) => Ok(MutationResponse::Rejected {
                reason: RejectReason::Authorization,
                message,
                rate_limit: Some(status),
            }),
        }
    }

    /// Rate-limit status for the caller's resolved scope, without consuming.
    pub fn rate_limit_status(
        &self,
        token: Option<&str>,
        requested_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Result<RateLimitStatus, MutationResponse>> {
        match self.authenticate(token)? {
            Ok(caller) => self.rate_limit_status_as(caller, requested_scope, now),
            Err(rejection) => Ok(Err(rejection)),
        }
    }

    pub fn rate_limit_status_as(
        &self,
        caller: Caller,
        requested_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Result<RateLimitStatus, MutationResponse>> {
        let scope = match self.resolve_scope(caller, requested_scope)? {
            Ok(scope) => scope,
            Err(rejection) => return Ok(Err(rejection)),
        };
        Ok(Ok(rate_limit::peek(self.db, &scope.rate_limit_key(), self.config, now)?))
    }
}

fn rate_limited(status: RateLimitStatus) -> MutationResponse {
    MutationResponse::Rejected {
        reason: RejectReason::RateLimited,
        message: format!("Rate limit exceeded; retry after {}", status.reset_at.to_rfc3339()),
        rate_limit: Some(status),
    }
}
