//! Due-order and fairness ranking shared by the in-memory store and tests.
//!
//! The Postgres adapter expresses the same rules in SQL; this module is the
//! reference the in-memory adapters rank with.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::database::ports::{DueCase, DueCaseQuery};
use crate::domain::{DebtCase, TenantId};

/// `next_action_at` ascending with nulls first, then `created_at` ascending.
/// The case id breaks remaining ties so the order is total.
pub fn due_order(a: &DebtCase, b: &DebtCase) -> Ordering {
    let by_next = match (a.next_action_at, b.next_action_at) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    };
    by_next
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Status, due, policy, tenant and demo filters.
pub fn is_eligible(
    case: &DebtCase,
    call_enabled: bool,
    query: &DueCaseQuery,
    now: DateTime<Utc>,
) -> bool {
    case.status.is_active()
        && case.is_due(now)
        && call_enabled
        && query.tenant_id.is_none_or(|tenant| tenant == case.tenant_id)
        && (query.include_demo || !case.meta.is_demo())
}

/// Applies eligibility, the per-tenant cap and the global cap, returning
/// cases in due order.
pub fn select_due<'a, I>(
    candidates: I,
    query: &DueCaseQuery,
    now: DateTime<Utc>,
) -> Vec<DueCase>
where
    I: IntoIterator<Item = (&'a DebtCase, bool)>,
{
    let mut eligible: Vec<&DebtCase> = candidates
        .into_iter()
        .filter(|(case, call_enabled)| is_eligible(case, *call_enabled, query, now))
        .map(|(case, _)| case)
        .collect();
    eligible.sort_by(|a, b| due_order(a, b));

    let per_tenant = query.effective_per_tenant_limit() as usize;
    let mut taken: HashMap<TenantId, usize> = HashMap::new();

    eligible
        .into_iter()
        .filter(|case| {
            let rank = taken.entry(case.tenant_id).or_default();
            *rank += 1;
            *rank <= per_tenant
        })
        .take(query.limit as usize)
        .map(|case| DueCase {
            case_id: case.id,
            tenant_id: case.tenant_id,
        })
        .collect()
}
