//! Create / reuse / replace policy for manifest items

use super::{ItemAction, ItemKind};
use serde::Serialize;

/// What to do with an item given the current record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyDecision {
    CreateNew,
    ReuseExisting,
    DeleteAndRecreate,
}

/// Inputs to the idempotency decision
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    pub kind: ItemKind,
    pub existing: bool,
    pub replace: bool,
    pub action: ItemAction,
    pub skip_cache: bool,
}

/// Decide how an item is processed.
///
/// Datasets are recreated on `--replace`, `--skip-cache` or a `replace` /
/// `redownload` action. Projects and charts are recreated on `--replace` or a
/// `replace` action; a cache refresh alone never recreates them.
pub fn decide(input: PolicyInput) -> IdempotencyDecision {
    if !input.existing {
        return IdempotencyDecision::CreateNew;
    }

    let recreate = match input.kind {
        ItemKind::Dataset => {
            input.replace
                || input.skip_cache
                || matches!(input.action, ItemAction::Replace | ItemAction::Redownload)
        }
        ItemKind::Project | ItemKind::Chart => {
            input.replace || input.action == ItemAction::Replace
        }
    };

    if recreate {
        IdempotencyDecision::DeleteAndRecreate
    } else {
        IdempotencyDecision::ReuseExisting
    }
}

/// Per-file intent propagated from an item's flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileIntent {
    pub replace: bool,
    pub skip_cache: bool,
}

impl FileIntent {
    pub fn for_item(replace: bool, skip_cache: bool, action: ItemAction) -> Self {
        Self {
            replace: replace || action == ItemAction::Replace,
            skip_cache: skip_cache || action == ItemAction::Redownload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: ItemKind, existing: bool) -> PolicyInput {
        PolicyInput {
            kind,
            existing,
            replace: false,
            action: ItemAction::None,
            skip_cache: false,
        }
    }

    #[test]
    fn test_absent_record_always_created() {
        for kind in [ItemKind::Dataset, ItemKind::Project, ItemKind::Chart] {
            let mut i = input(kind, false);
            i.replace = true;
            i.action = ItemAction::Replace;
            assert_eq!(decide(i), IdempotencyDecision::CreateNew);
        }
    }

    #[test]
    fn test_existing_record_reused_by_default() {
        for kind in [ItemKind::Dataset, ItemKind::Project, ItemKind::Chart] {
            assert_eq!(
                decide(input(kind, true)),
                IdempotencyDecision::ReuseExisting
            );
        }
    }

    #[test]
    fn test_dataset_recreated_on_cache_refresh() {
        let mut i = input(ItemKind::Dataset, true);
        i.skip_cache = true;
        assert_eq!(decide(i), IdempotencyDecision::DeleteAndRecreate);

        let mut i = input(ItemKind::Dataset, true);
        i.action = ItemAction::Redownload;
        assert_eq!(decide(i), IdempotencyDecision::DeleteAndRecreate);
    }

    #[test]
    fn test_project_and_chart_ignore_cache_refresh() {
        for kind in [ItemKind::Project, ItemKind::Chart] {
            let mut i = input(kind, true);
            i.skip_cache = true;
            i.action = ItemAction::Redownload;
            assert_eq!(decide(i), IdempotencyDecision::ReuseExisting);

            let mut i = input(kind, true);
            i.action = ItemAction::Replace;
            assert_eq!(decide(i), IdempotencyDecision::DeleteAndRecreate);
        }
    }

    #[test]
    fn test_file_intent_from_action() {
        assert_eq!(
            FileIntent::for_item(false, false, ItemAction::Replace),
            FileIntent {
                replace: true,
                skip_cache: false
            }
        );
        assert_eq!(
            FileIntent::for_item(false, false, ItemAction::Redownload),
            FileIntent {
                replace: false,
                skip_cache: true
            }
        );
        assert_eq!(
            FileIntent::for_item(true, true, ItemAction::None),
            FileIntent {
                replace: true,
                skip_cache: true
            }
        );
    }
}
