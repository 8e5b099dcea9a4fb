//! Static denylist of destructive tool names, with a global yolo override (L3).

use std::collections::HashSet;
use std::sync::LazyLock;

static DESTRUCTIVE_TOOLS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "kubectl_delete",
        "kubectl_drain",
        "kubectl_cordon",
        "terminate_instance",
        "drop_database",
        "drop_table",
        "truncate_table",
        "rm_rf",
        "delete_namespace",
        "delete_cluster",
        "force_push",
        "revoke_credentials",
        "delete_secret",
        "delete_volume",
        "shutdown_node",
        "reboot_node",
    ]
    .into_iter()
    .collect()
});

/// Pure lookup on the unprefixed tool name.
pub fn is_destructive(original_name: &str) -> bool {
    DESTRUCTIVE_TOOLS.contains(original_name)
}

/// Whether a tool should be annotated `blocked` given the process-wide yolo flag.
/// `yolo=true` short-circuits to `false` regardless of the lookup.
pub fn is_blocked(original_name: &str, yolo: bool) -> bool {
    !yolo && is_destructive(original_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destructive_names_are_flagged() {
        assert!(is_destructive("kubectl_delete"));
        assert!(!is_destructive("kubectl_get"));
    }

    #[test]
    fn yolo_disables_blocking_without_changing_destructiveness() {
        assert!(is_blocked("kubectl_delete", false));
        assert!(!is_blocked("kubectl_delete", true));
        assert!(is_destructive("kubectl_delete"));
    }
}
