//! Subscription guards for paid notification channels.
//!
//! Email alerts are free. SMS requires an active qualifying subscription;
//! this gate is deliberately strict and there is no debug bypass.

use crate::model::SubscriptionContext;

const ACTIVE_SUBSCRIPTION_STATUSES: &[&str] = &["active", "trialing"];

pub fn is_subscription_active(ctx: SubscriptionContext<'_>) -> bool {
    match ctx.subscription_status {
        Some(status) => ACTIVE_SUBSCRIPTION_STATUSES.contains(&status),
        None => false,
    }
}

/// SMS is available only on an active subscription with the qualifying plan.
pub fn can_use_sms(ctx: SubscriptionContext<'_>, required_plan: &str) -> bool {
    if !is_subscription_active(ctx) {
        return false;
    }
    ctx.plan_name
        .map(|p| p.eq_ignore_ascii_case(required_plan))
        .unwrap_or(false)
}
