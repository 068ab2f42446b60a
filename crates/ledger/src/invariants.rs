//! Ledger Invariants Module
//!
//! Runnable consistency checks over the Postgres ledger. The worker runs them
//! periodically; they can also be run by hand after a manual data fix.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is one SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::LedgerResult;
use crate::store::StoreError;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Agent(s) affected
    pub agent_ids: Vec<i64>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Balance and audit trail disagree
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Expected after some admin actions, worth a look
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Row type for debt that disagrees with its events
#[derive(Debug, sqlx::FromRow)]
struct DebtMismatchRow {
    agent_id: i64,
    current_debt: i64,
    event_total: i64,
}

/// Row type for negative balances
#[derive(Debug, sqlx::FromRow)]
struct NegativeDebtRow {
    agent_id: i64,
    current_debt: i64,
}

/// Row type for debt above the credit limit
#[derive(Debug, sqlx::FromRow)]
struct OverLimitRow {
    agent_id: i64,
    current_debt: i64,
    credit_limit: i64,
}

/// Row type for transfers whose status and decision time disagree
#[derive(Debug, sqlx::FromRow)]
struct TransferDecisionRow {
    request_id: i64,
    agent_id: i64,
    status: String,
    decided_at: Option<OffsetDateTime>,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> LedgerResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_debt_matches_events().await?);
        violations.extend(self.check_debt_not_negative().await?);
        violations.extend(self.check_debt_within_limit().await?);
        violations.extend(self.check_transfer_decisions().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Invariant 1: debt equals the sum of its debt events
    async fn check_debt_matches_events(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<DebtMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                a.id AS agent_id,
                a.current_debt,
                COALESCE(SUM(e.amount), 0)::BIGINT AS event_total
            FROM agents a
            LEFT JOIN debt_events e ON e.agent_id = a.id
            GROUP BY a.id, a.current_debt
            HAVING a.current_debt <> COALESCE(SUM(e.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "debt_matches_events".to_string(),
                agent_ids: vec![row.agent_id],
                description: format!(
                    "Agent debt is {} but debt events sum to {}",
                    row.current_debt, row.event_total
                ),
                context: serde_json::json!({
                    "current_debt": row.current_debt,
                    "event_total": row.event_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: debt is never negative
    async fn check_debt_not_negative(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeDebtRow> = sqlx::query_as(
            r#"
            SELECT id AS agent_id, current_debt
            FROM agents
            WHERE current_debt < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "debt_not_negative".to_string(),
                agent_ids: vec![row.agent_id],
                description: format!("Agent debt is negative ({})", row.current_debt),
                context: serde_json::json!({ "current_debt": row.current_debt }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: debt stays within a positive credit limit
    ///
    /// Lowering a limit below the current debt is allowed, so this is
    /// informational rather than a ledger fault.
    async fn check_debt_within_limit(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<OverLimitRow> = sqlx::query_as(
            r#"
            SELECT id AS agent_id, current_debt, credit_limit
            FROM agents
            WHERE credit_limit > 0
              AND current_debt > credit_limit
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "debt_within_limit".to_string(),
                agent_ids: vec![row.agent_id],
                description: format!(
                    "Agent debt {} is above credit limit {}",
                    row.current_debt, row.credit_limit
                ),
                context: serde_json::json!({
                    "current_debt": row.current_debt,
                    "credit_limit": row.credit_limit,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: decided transfers have a decision time, pending ones don't
    async fn check_transfer_decisions(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<TransferDecisionRow> = sqlx::query_as(
            r#"
            SELECT id AS request_id, agent_id, status, decided_at
            FROM transfer_requests
            WHERE (status = 'pending' AND decided_at IS NOT NULL)
               OR (status <> 'pending' AND decided_at IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transfer_decisions".to_string(),
                agent_ids: vec![row.agent_id],
                description: format!(
                    "Transfer request {} is '{}' but decided_at is {:?}",
                    row.request_id, row.status, row.decided_at
                ),
                context: serde_json::json!({
                    "request_id": row.request_id,
                    "status": row.status,
                    "decided_at": row.decided_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> LedgerResult<Vec<InvariantViolation>> {
        match name {
            "debt_matches_events" => self.check_debt_matches_events().await,
            "debt_not_negative" => self.check_debt_not_negative().await,
            "debt_within_limit" => self.check_debt_within_limit().await,
            "transfer_decisions" => self.check_transfer_decisions().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "debt_matches_events",
            "debt_not_negative",
            "debt_within_limit",
            "transfer_decisions",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            agent_ids: vec![1],
            description: String::new(),
            context: serde_json::Value::Null,
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"debt_matches_events"));
        assert!(checks.contains(&"transfer_decisions"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::UNIX_EPOCH,
            vec![
                violation("debt_within_limit", ViolationSeverity::Medium),
                violation("debt_within_limit", ViolationSeverity::Medium),
                violation("debt_matches_events", ViolationSeverity::Critical),
            ],
        );

        assert_eq!(summary.checks_run, 4);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::UNIX_EPOCH, vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 4);
    }
}
