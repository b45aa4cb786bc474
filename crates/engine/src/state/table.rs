//! The lifecycle transition table and the checks derived from it

use metadata_store::ItemState;

use ItemState::*;

/// States reachable from `from` in one transition
pub fn allowed_targets(from: ItemState) -> &'static [ItemState] {
    match from {
        Ghost => &[Hydrating, Hydrated, DirtyLocal, Deleted],
        Hydrating => &[Hydrated, Error],
        Hydrated => &[Hydrating, DirtyLocal, Error, Ghost, Deleted],
        DirtyLocal => &[Hydrated, Conflict, Error, Deleted],
        Conflict => &[Hydrated, DirtyLocal],
        Error => &[Hydrating, Deleted],
        Deleted => &[],
    }
}

pub fn is_allowed(from: ItemState, to: ItemState) -> bool {
    allowed_targets(from).contains(&to)
}

/// Only non-virtual HYDRATED entries may lose their cached bytes.
pub fn is_evictable(state: ItemState, is_virtual: bool) -> bool {
    matches!((state, is_virtual), (Hydrated, false))
}

/// What a read of an entry needs before it can be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydratePlan {
    /// Local content is authoritative or current
    Serve,
    /// Content has to come from the remote
    Download,
    /// Another worker is already downloading
    Wait,
    /// Nothing left to read
    Gone,
}

/// An ERROR entry holding unsent edits is served from the cache, which is
/// the only copy of its content.
pub fn hydrate_plan(state: ItemState, is_virtual: bool, local_changes: bool) -> HydratePlan {
    match (state, is_virtual, local_changes) {
        (_, true, _) => HydratePlan::Serve,
        (Hydrated | DirtyLocal | Conflict, false, _) => HydratePlan::Serve,
        (Error, false, true) => HydratePlan::Serve,
        (Ghost | Error, false, _) => HydratePlan::Download,
        (Hydrating, false, _) => HydratePlan::Wait,
        (Deleted, false, _) => HydratePlan::Gone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_is_terminal() {
        for to in ItemState::ALL {
            assert!(!is_allowed(Deleted, to));
        }
    }

    #[test]
    fn test_no_self_transitions() {
        for state in ItemState::ALL {
            assert!(!is_allowed(state, state), "{state} -> {state}");
        }
    }

    #[test]
    fn test_allowed_pair_count() {
        let count = ItemState::ALL
            .iter()
            .flat_map(|from| ItemState::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| is_allowed(*from, *to))
            .count();
        assert_eq!(count, 19);
    }

    #[test]
    fn test_evictable_only_hydrated_real_entries() {
        for state in ItemState::ALL {
            assert_eq!(is_evictable(state, false), state == Hydrated);
            assert!(!is_evictable(state, true));
        }
    }

    #[test]
    fn test_hydrate_plan() {
        assert_eq!(hydrate_plan(Ghost, false, false), HydratePlan::Download);
        assert_eq!(hydrate_plan(Error, false, false), HydratePlan::Download);
        assert_eq!(hydrate_plan(Error, false, true), HydratePlan::Serve);
        assert_eq!(hydrate_plan(Hydrating, false, false), HydratePlan::Wait);
        assert_eq!(hydrate_plan(Conflict, false, true), HydratePlan::Serve);
        assert_eq!(hydrate_plan(Deleted, false, false), HydratePlan::Gone);
        assert_eq!(hydrate_plan(Hydrated, true, false), HydratePlan::Serve);
    }
}
