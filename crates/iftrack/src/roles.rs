//! Role predicates and display-status labels.
//!
//! Kept as pure functions so the service layer, the pending-override cache
//! and the tests all compute status text through the same rules.

/// Roles that finalize a response immediately (auto-confirm on write).
pub const SUPERIOR_ROLES: &[&str] = &[
    "一室主任",
    "二室主任",
    "建筑总图室主任",
    "所长",
    "所领导",
    "接口工程师",
];

/// Display label for a confirmed task ("reviewed").
pub const STATUS_REVIEWED: &str = "已审查";
/// Display label for a completed task awaiting general review.
pub const STATUS_AWAITING_REVIEW: &str = "待审查";
/// Display label for a completed task awaiting its assignor's review.
pub const STATUS_AWAITING_ASSIGNER: &str = "待指派人审查";
/// Display label for an assigned, not-yet-completed task ("to do").
pub const STATUS_TODO: &str = "待完成";

/// Returns true when `role` is one of the superior roles.
///
/// Roles sometimes arrive embedded in a longer annotation such as
/// `李经理（所领导）`, so containment counts as a match.
pub fn is_superior(role: &str) -> bool {
    let role = role.trim();
    SUPERIOR_ROLES.iter().any(|s| role == *s || role.contains(s))
}

/// Returns true when any of the user's roles is a superior role.
pub fn any_superior(roles: &[String]) -> bool {
    roles.iter().any(|r| is_superior(r))
}

/// Display status for a freshly written response (spec of the
/// response-written state machine): superiors finalize immediately,
/// assigned tasks wait for their assignor, everything else waits for
/// general review.
pub fn response_display_status(writer_is_superior: bool, has_assigner: bool) -> &'static str {
    if writer_is_superior {
        STATUS_REVIEWED
    } else if has_assigner {
        STATUS_AWAITING_ASSIGNER
    } else {
        STATUS_AWAITING_REVIEW
    }
}

/// Whether a viewer with `roles` may see a task assigned by `assigned_by`
/// and assigned to `assigned_to`. Superiors see everything; others see
/// rows they assigned, rows assigned to them, and unassigned rows.
pub fn can_view(roles: &[String], user_name: &str, assigned_by: Option<&str>, assigned_to: Option<&str>) -> bool {
    if any_superior(roles) {
        return true;
    }
    match (assigned_by, assigned_to) {
        (None, None) => true,
        (by, to) => {
            by.is_some_and(|b| b.contains(user_name))
                || to.is_some_and(|t| t.contains(user_name))
                || (by.is_none() && to.is_none())
        }
    }
}
