//! Differences between two roster snapshots.

use std::collections::HashMap;

use xnode_panel::ServiceInfo;

/// What changed between two rosters.
///
/// Entries are compared by full value, so a user whose limits changed
/// appears twice: its old value in `removed` and its new value in `added`.
/// Applying the removals before the additions gives the new roster.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct RosterDiff {
    /// Entries in the new roster but not in the old one.
    pub added: Vec<ServiceInfo>,
    /// Entries in the old roster but not in the new one.
    pub removed: Vec<ServiceInfo>,
}

impl RosterDiff {
    /// Compute the difference from `old` to `new`.
    ///
    /// Rosters are treated as multisets: if the panel lists an entry twice
    /// in `new` and once in `old`, one copy is added.  Both output lists
    /// are sorted.
    pub fn between(old: &[ServiceInfo], new: &[ServiceInfo]) -> Self {
        let mut counts: HashMap<&ServiceInfo, isize> = HashMap::new();
        for s in new {
            *counts.entry(s).or_default() += 1;
        }
        for s in old {
            *counts.entry(s).or_default() -= 1;
        }

        let mut diff = RosterDiff::default();
        for (s, n) in counts {
            let target = if n > 0 {
                &mut diff.added
            } else {
                &mut diff.removed
            };
            target.extend(std::iter::repeat_n(s, n.unsigned_abs()).cloned());
        }
        diff.added.sort();
        diff.removed.sort();
        diff
    }

    /// Return true if the rosters were equal.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
